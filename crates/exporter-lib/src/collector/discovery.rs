//! Block device and network interface discovery
//!
//! The management API has no call listing a domain's devices. Names come from
//! the domain descriptor when it declares any; otherwise a fixed list of
//! common names is probed with the real stats call and the names that answer
//! are kept.

use crate::domain::DomainHandle;
use tracing::debug;

/// Disk names probed when the descriptor is unavailable or declares none
pub const DISK_CANDIDATES: &[&str] = &[
    "vda", "vdb", "vdc", "vdd", "vde", "vdf", //
    "sda", "sdb", "sdc", "sdd", "sde", "sdf", //
    "hda", "hdb", "hdc", "hdd", //
    "nvme0n1", "nvme1n1", "nvme2n1", //
    "xvda", "xvdb", "xvdc", "xvdd",
];

/// Interface names probed when the descriptor is unavailable or declares none
pub const INTERFACE_CANDIDATES: &[&str] = &[
    "eth0", "eth1", "eth2", "eth3", "eth4", "eth5", //
    "ens3", "ens4", "ens5", "ens6", "ens7", "ens8", //
    "enp0s3", "enp0s4", "enp0s5", "enp0s6", "enp0s7", "enp0s8", //
    "eno1", "eno2", "eno3", "eno4", //
    "vnet0", "vnet1", "vnet2", "vnet3", "vnet4", "vnet5", //
    "eth0.1", "eth0.2", "eth1.1", "eth1.2", //
    "br0", "br1", "br2", //
    "virbr0", "virbr1", //
    "wlan0", "wlan1", "wlp0s3", "wlp0s4",
];

/// Block device names of a domain, ordered and without duplicates
///
/// Declared removable drives without a medium are left out.
pub fn discover_disks(domain: &DomainHandle) -> Vec<String> {
    match domain.descriptor() {
        Ok(desc) if !desc.disk_targets().is_empty() => {
            return dedup(desc.attached_disk_targets());
        }
        Ok(_) => {}
        Err(e) => {
            debug!(domain = %domain.name(), error = %e, "Descriptor unavailable, probing disks");
        }
    }

    probe(DISK_CANDIDATES, |name| domain.api().block_stats(name).is_ok())
}

/// Interface names of a domain, ordered and without duplicates
pub fn discover_interfaces(domain: &DomainHandle) -> Vec<String> {
    match domain.descriptor() {
        Ok(desc) => {
            let declared = desc.interface_targets();
            if !declared.is_empty() {
                return dedup(declared);
            }
        }
        Err(e) => {
            debug!(
                domain = %domain.name(),
                error = %e,
                "Descriptor unavailable, probing interfaces"
            );
        }
    }

    probe(INTERFACE_CANDIDATES, |name| {
        domain.api().interface_stats(name).is_ok()
    })
}

fn probe(candidates: &[&str], answers: impl Fn(&str) -> bool) -> Vec<String> {
    candidates
        .iter()
        .filter(|name| answers(name))
        .map(|name| name.to_string())
        .collect()
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Session;
    use crate::domain::{list_domains, DomainSet};
    use crate::hypervisor::{BlockStats, Connector, InterfaceStats};
    use crate::observability::ExporterState;
    use crate::testing::{FakeDomainSpec, FakeHypervisor};
    use std::sync::Arc;

    async fn domains_of(hv: &FakeHypervisor) -> DomainSet {
        let conn = hv.connector().connect("test:///default").await.unwrap();
        let session = Session::new(conn, 1);
        list_domains(&session, Arc::new(ExporterState::new())).unwrap()
    }

    fn block_stats() -> BlockStats {
        BlockStats {
            rd_req: 1,
            rd_bytes: 512,
            wr_req: 0,
            wr_bytes: 0,
            errs: 0,
        }
    }

    fn disk_probes(hv: &FakeHypervisor) -> usize {
        hv.probes()
            .iter()
            .filter(|p| DISK_CANDIDATES.iter().any(|c| p.as_str() == format!("alpha:{c}")))
            .count()
    }

    #[test]
    fn test_candidate_lists() {
        assert_eq!(DISK_CANDIDATES.len(), 23);
        assert_eq!(INTERFACE_CANDIDATES.len(), 41);
        assert_eq!(dedup(DISK_CANDIDATES.iter().map(|s| s.to_string()).collect()).len(), 23);
        assert_eq!(
            dedup(INTERFACE_CANDIDATES.iter().map(|s| s.to_string()).collect()).len(),
            41
        );
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        let names = vec!["vdb".to_string(), "vda".to_string(), "vdb".to_string()];
        assert_eq!(dedup(names), vec!["vdb", "vda"]);
    }

    #[tokio::test]
    async fn test_fallback_discovery_is_idempotent() {
        let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")
            .with_disk("sdb", block_stats())
            .with_interface("ens4", InterfaceStats::default())
            .without_descriptor()]);
        let set = domains_of(&hv).await;
        let alpha = set.get("alpha").unwrap();

        let disks = discover_disks(alpha);
        assert_eq!(disks, vec!["sdb"]);
        assert_eq!(discover_disks(alpha), disks);

        let interfaces = discover_interfaces(alpha);
        assert_eq!(interfaces, vec!["ens4"]);
        assert_eq!(discover_interfaces(alpha), interfaces);
    }

    #[tokio::test]
    async fn test_declared_discovery_is_idempotent_and_deduplicated() {
        let xml = "<domain type='kvm'><name>alpha</name><devices>\
            <disk type='file' device='disk'><source file='/a.img'/><target dev='vdb'/></disk>\
            <disk type='file' device='disk'><source file='/b.img'/><target dev='vda'/></disk>\
            <disk type='file' device='disk'><source file='/c.img'/><target dev='vdb'/></disk>\
            <interface type='network'><target dev='vnet3'/></interface>\
            </devices></domain>";
        let hv = FakeHypervisor::with_domains(vec![
            FakeDomainSpec::running("alpha").with_descriptor(xml)
        ]);
        let set = domains_of(&hv).await;
        let alpha = set.get("alpha").unwrap();

        assert_eq!(discover_disks(alpha), vec!["vdb", "vda"]);
        assert_eq!(discover_disks(alpha), vec!["vdb", "vda"]);
        assert_eq!(discover_interfaces(alpha), vec!["vnet3"]);
        assert!(hv.probes().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_descriptor_falls_back_to_candidates() {
        let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")
            .with_disk("sdb", block_stats())
            .with_descriptor("<domain><devices><disk device='disk'><target dev='vda'")]);
        let set = domains_of(&hv).await;
        let alpha = set.get("alpha").unwrap();

        assert_eq!(discover_disks(alpha), vec!["sdb"]);
        assert_eq!(disk_probes(&hv), DISK_CANDIDATES.len());
    }

    #[tokio::test]
    async fn test_descriptor_without_devices_falls_back_to_candidates() {
        let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")
            .with_disk("xvdc", block_stats())
            .with_descriptor("<domain type='xen'><name>alpha</name></domain>")]);
        let set = domains_of(&hv).await;

        assert_eq!(discover_disks(set.get("alpha").unwrap()), vec!["xvdc"]);
    }
}
