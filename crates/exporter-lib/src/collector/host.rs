//! Hypervisor host collector
//!
//! Runs once per scrape. Every sub-query fails on its own, so a host without
//! storage pools or a remote connection without interface counters still
//! reports everything else.

use super::{Collector, CollectorScope};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::{ApiError, CollectorError};
use crate::hypervisor::descriptor::Capabilities;
use crate::models::{MetricDesc, MetricRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

static CONNECTION_ALIVE: MetricDesc = MetricDesc::gauge(
    "libvirt_host_connection_alive",
    "Whether the management connection answered its liveness check",
    &[],
);
static DOMAINS_ACTIVE: MetricDesc = MetricDesc::gauge(
    "libvirt_host_domains_active",
    "Number of active domains on the host",
    &[],
);
static DOMAINS_INACTIVE: MetricDesc = MetricDesc::gauge(
    "libvirt_host_domains_inactive",
    "Number of defined but inactive domains on the host",
    &[],
);
static HOST_INFO: MetricDesc = MetricDesc::gauge(
    "libvirt_host_info",
    "Hypervisor host identity",
    &["hostname", "arch", "cpu_model"],
);
static DRIVER_INFO: MetricDesc = MetricDesc::gauge(
    "libvirt_host_driver_info",
    "Hypervisor driver of the connection",
    &["driver"],
);
static LIBVIRT_VERSION: MetricDesc = MetricDesc::gauge(
    "libvirt_host_libvirt_version_info",
    "Version of the libvirt daemon",
    &["version"],
);
static HYPERVISOR_VERSION: MetricDesc = MetricDesc::gauge(
    "libvirt_host_hypervisor_version_info",
    "Version of the hypervisor",
    &["version"],
);
static CPUS: MetricDesc = MetricDesc::gauge(
    "libvirt_host_cpus",
    "Number of active host CPUs",
    &[],
);
static CPU_MHZ: MetricDesc = MetricDesc::gauge(
    "libvirt_host_cpu_frequency_mhz",
    "Host CPU frequency in MHz",
    &[],
);
static MEMORY_TOTAL: MetricDesc = MetricDesc::gauge(
    "libvirt_host_memory_total_bytes",
    "Host memory in bytes",
    &[],
);
static MEMORY_FREE: MetricDesc = MetricDesc::gauge(
    "libvirt_host_memory_free_bytes",
    "Free host memory in bytes",
    &[],
);
static POOL_INFO: MetricDesc = MetricDesc::gauge(
    "libvirt_storage_pool_info",
    "Storage pool type and state",
    &["pool", "type", "state"],
);
static POOL_CAPACITY: MetricDesc = MetricDesc::gauge(
    "libvirt_storage_pool_capacity_bytes",
    "Storage pool capacity in bytes",
    &["pool"],
);
static POOL_ALLOCATION: MetricDesc = MetricDesc::gauge(
    "libvirt_storage_pool_allocation_bytes",
    "Storage pool allocation in bytes",
    &["pool"],
);
static POOL_AVAILABLE: MetricDesc = MetricDesc::gauge(
    "libvirt_storage_pool_available_bytes",
    "Free space in the storage pool in bytes",
    &["pool"],
);
static POOL_VOLUMES: MetricDesc = MetricDesc::gauge(
    "libvirt_storage_pool_volumes",
    "Number of volumes in the storage pool",
    &["pool"],
);
static NETWORK_ACTIVE: MetricDesc = MetricDesc::gauge(
    "libvirt_network_active",
    "Whether the virtual network is active",
    &["network", "bridge"],
);
static IFACE_RX_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_host_interface_receive_bytes_total",
    "Bytes received on the host interface",
    &["interface"],
);
static IFACE_RX_PACKETS: MetricDesc = MetricDesc::counter(
    "libvirt_host_interface_receive_packets_total",
    "Packets received on the host interface",
    &["interface"],
);
static IFACE_TX_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_host_interface_transmit_bytes_total",
    "Bytes transmitted on the host interface",
    &["interface"],
);
static IFACE_TX_PACKETS: MetricDesc = MetricDesc::counter(
    "libvirt_host_interface_transmit_packets_total",
    "Packets transmitted on the host interface",
    &["interface"],
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &CONNECTION_ALIVE,
    &DOMAINS_ACTIVE,
    &DOMAINS_INACTIVE,
    &HOST_INFO,
    &DRIVER_INFO,
    &LIBVIRT_VERSION,
    &HYPERVISOR_VERSION,
    &CPUS,
    &CPU_MHZ,
    &MEMORY_TOTAL,
    &MEMORY_FREE,
    &POOL_INFO,
    &POOL_CAPACITY,
    &POOL_ALLOCATION,
    &POOL_AVAILABLE,
    &POOL_VOLUMES,
    &NETWORK_ACTIVE,
    &IFACE_RX_BYTES,
    &IFACE_RX_PACKETS,
    &IFACE_TX_BYTES,
    &IFACE_TX_PACKETS,
];

/// Host-scope collector guarded so it contributes once per scrape
#[derive(Default)]
pub struct ConnectionCollector {
    collected: AtomicBool,
}

impl ConnectionCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for ConnectionCollector {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn scope(&self) -> CollectorScope {
        CollectorScope::Host
    }

    fn describe(&self) -> &'static [&'static MetricDesc] {
        DESCRIPTORS
    }

    fn reset(&self) {
        self.collected.store(false, Ordering::Release);
    }

    fn collect(
        &self,
        session: &Session,
        _domain: Option<&DomainHandle>,
    ) -> Result<Vec<MetricRecord>, CollectorError> {
        if self
            .collected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Vec::new());
        }

        let conn = session.connection();
        let no_labels: [&str; 0] = [];
        let mut records = Vec::new();

        let alive = session.is_alive();
        records.push(CONNECTION_ALIVE.record(&no_labels, if alive { 1.0 } else { 0.0 }));

        if let Some(n) = sub_query("count active domains", conn.num_active_domains()) {
            records.push(DOMAINS_ACTIVE.record(&no_labels, f64::from(n)));
        }
        if let Some(n) = sub_query("count inactive domains", conn.num_inactive_domains()) {
            records.push(DOMAINS_INACTIVE.record(&no_labels, f64::from(n)));
        }

        if let Some(hostname) = sub_query("get hostname", conn.hostname()) {
            let caps = sub_query(
                "get capabilities",
                conn.capabilities().and_then(|xml| Capabilities::parse(&xml)),
            )
            .unwrap_or_default();
            records.push(
                HOST_INFO.record(&[hostname.as_str(), caps.arch(), caps.cpu_model()], 1.0),
            );
        }
        if let Some(driver) = sub_query("get driver type", conn.driver_type()) {
            records.push(DRIVER_INFO.record(&[driver], 1.0));
        }
        if let Some(version) = sub_query("get libvirt version", conn.lib_version()) {
            records.push(LIBVIRT_VERSION.record(&[format_version(version)], 1.0));
        }
        if let Some(version) = sub_query("get hypervisor version", conn.hypervisor_version()) {
            records.push(HYPERVISOR_VERSION.record(&[format_version(version)], 1.0));
        }

        if let Some(node) = sub_query("get node info", conn.node_info()) {
            records.push(CPUS.record(&no_labels, f64::from(node.cpus)));
            records.push(CPU_MHZ.record(&no_labels, f64::from(node.mhz)));
            let total = node.memory_kib.saturating_mul(1024) as f64;
            records.push(MEMORY_TOTAL.record(&no_labels, total));
        }
        if let Some(free) = sub_query("get free memory", conn.free_memory()) {
            records.push(MEMORY_FREE.record(&no_labels, free as f64));
        }

        for pool in sub_query("list storage pools", conn.storage_pools()).unwrap_or_default() {
            let name = pool.name.as_str();
            records.push(
                POOL_INFO.record(&[name, pool.pool_type.as_str(), pool.state.as_str()], 1.0),
            );
            records.push(POOL_CAPACITY.record(&[name], pool.capacity as f64));
            records.push(POOL_ALLOCATION.record(&[name], pool.allocation as f64));
            records.push(POOL_AVAILABLE.record(&[name], pool.available as f64));
            records.push(POOL_VOLUMES.record(&[name], f64::from(pool.volumes)));
        }

        for net in sub_query("list networks", conn.networks()).unwrap_or_default() {
            records.push(NETWORK_ACTIVE.record(
                &[net.name.as_str(), net.bridge.as_str()],
                if net.active { 1.0 } else { 0.0 },
            ));
        }

        for iface in sub_query("list host interfaces", conn.host_interfaces()).unwrap_or_default() {
            let name = [iface.name.as_str()];
            records.push(IFACE_RX_BYTES.record(&name, iface.rx_bytes as f64));
            records.push(IFACE_RX_PACKETS.record(&name, iface.rx_packets as f64));
            records.push(IFACE_TX_BYTES.record(&name, iface.tx_bytes as f64));
            records.push(IFACE_TX_PACKETS.record(&name, iface.tx_packets as f64));
        }

        Ok(records)
    }
}

fn sub_query<T>(operation: &'static str, result: Result<T, ApiError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(collector = "connection", operation, error = %e, "Host query failed");
            None
        }
    }
}

/// `major * 1_000_000 + minor * 1_000 + release` to `major.minor.release`
pub(crate) fn format_version(encoded: u64) -> String {
    format!(
        "{}.{}.{}",
        encoded / 1_000_000,
        encoded / 1_000 % 1_000,
        encoded % 1_000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(9_000_000), "9.0.0");
        assert_eq!(format_version(8_002_001), "8.2.1");
        assert_eq!(format_version(10_010_000), "10.10.0");
    }
}
