//! Balloon memory statistics collector (running domains only)
//!
//! Only the statistics present in the hypervisor's response are reported.
//! Sizes arrive in KiB and are exported in bytes.

use super::domain_info::kib_to_bytes;
use super::{require_running, required, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::hypervisor::MemoryStatTag;
use crate::models::{MetricDesc, MetricRecord};

const LABELS: &[&str] = crate::domain::DOMAIN_LABELS;

static ACTUAL_BALLOON: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_actual_balloon_bytes",
    "Current balloon size in bytes",
    LABELS,
);
static UNUSED: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_unused_bytes",
    "Memory left completely unused by the guest in bytes",
    LABELS,
);
static AVAILABLE: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_available_bytes",
    "Memory usable by the guest as seen by the guest in bytes",
    LABELS,
);
static USABLE: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_usable_bytes",
    "Memory the guest can reclaim without swapping in bytes",
    LABELS,
);
static RSS: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_rss_bytes",
    "Resident set size of the domain process on the host in bytes",
    LABELS,
);
static DISK_CACHES: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_disk_caches_bytes",
    "Guest memory used for disk caches in bytes",
    LABELS,
);
static TOTAL: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_total_bytes",
    "Total guest memory in bytes",
    LABELS,
);
static SWAP_IN: MetricDesc = MetricDesc::counter(
    "libvirt_vm_memory_swap_in_bytes_total",
    "Memory swapped in by the guest in bytes",
    LABELS,
);
static SWAP_OUT: MetricDesc = MetricDesc::counter(
    "libvirt_vm_memory_swap_out_bytes_total",
    "Memory swapped out by the guest in bytes",
    LABELS,
);
static MAJOR_FAULTS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_memory_major_faults_total",
    "Page faults that required disk IO in the guest",
    LABELS,
);
static MINOR_FAULTS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_memory_minor_faults_total",
    "Page faults served without disk IO in the guest",
    LABELS,
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &ACTUAL_BALLOON,
    &UNUSED,
    &AVAILABLE,
    &USABLE,
    &RSS,
    &DISK_CACHES,
    &TOTAL,
    &SWAP_IN,
    &SWAP_OUT,
    &MAJOR_FAULTS,
    &MINOR_FAULTS,
];

pub struct MemoryCollector;

impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> &'static [&'static MetricDesc] {
        DESCRIPTORS
    }

    fn collect(
        &self,
        _session: &Session,
        domain: Option<&DomainHandle>,
    ) -> Result<Vec<MetricRecord>, CollectorError> {
        let Some(domain) = domain else {
            return Ok(Vec::new());
        };
        if !require_running(domain)? {
            return Ok(Vec::new());
        }
        let Some(stats) = required(domain, "get memory stats", domain.api().memory_stats())? else {
            return Ok(Vec::new());
        };

        let labels = domain.labels();
        let mut records = Vec::with_capacity(stats.len() + 1);
        for stat in &stats {
            let (desc, value) = match stat.tag {
                MemoryStatTag::ActualBalloon => (&ACTUAL_BALLOON, kib_to_bytes(stat.value)),
                MemoryStatTag::Unused => (&UNUSED, kib_to_bytes(stat.value)),
                MemoryStatTag::Available => (&AVAILABLE, kib_to_bytes(stat.value)),
                MemoryStatTag::Usable => (&USABLE, kib_to_bytes(stat.value)),
                MemoryStatTag::Rss => (&RSS, kib_to_bytes(stat.value)),
                MemoryStatTag::DiskCaches => (&DISK_CACHES, kib_to_bytes(stat.value)),
                MemoryStatTag::SwapIn => (&SWAP_IN, kib_to_bytes(stat.value)),
                MemoryStatTag::SwapOut => (&SWAP_OUT, kib_to_bytes(stat.value)),
                MemoryStatTag::MajorFault => (&MAJOR_FAULTS, stat.value as f64),
                MemoryStatTag::MinorFault => (&MINOR_FAULTS, stat.value as f64),
                MemoryStatTag::LastUpdate | MemoryStatTag::Unknown(_) => continue,
            };
            records.push(desc.record(&labels, value));

            if stat.tag == MemoryStatTag::Available {
                records.push(TOTAL.record(&labels, kib_to_bytes(stat.value)));
            }
        }

        Ok(records)
    }
}
