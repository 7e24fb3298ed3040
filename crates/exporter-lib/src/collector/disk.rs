//! Block device collector (running domains only)

use super::{discover_disks, log_skip, require_running, supported, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::models::{MetricDesc, MetricRecord};
use tracing::debug;

const LABELS: &[&str] = &["domain", "uuid", "device"];

static READ_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_vm_disk_read_bytes_total",
    "Bytes read from the block device",
    LABELS,
);
static WRITE_BYTES: MetricDesc = MetricDesc::counter(
    "libvirt_vm_disk_write_bytes_total",
    "Bytes written to the block device",
    LABELS,
);
static READ_REQUESTS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_disk_read_requests_total",
    "Read requests issued to the block device",
    LABELS,
);
static WRITE_REQUESTS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_disk_write_requests_total",
    "Write requests issued to the block device",
    LABELS,
);
static ERRORS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_disk_errors_total",
    "Errors reported for the block device",
    LABELS,
);
static CAPACITY: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_disk_capacity_bytes",
    "Logical size of the block device in bytes",
    LABELS,
);
static ALLOCATION: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_disk_allocation_bytes",
    "Host storage in use by the block device in bytes",
    LABELS,
);
static PHYSICAL: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_disk_physical_bytes",
    "Host physical size of the block device container in bytes",
    LABELS,
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &READ_BYTES,
    &WRITE_BYTES,
    &READ_REQUESTS,
    &WRITE_REQUESTS,
    &ERRORS,
    &CAPACITY,
    &ALLOCATION,
    &PHYSICAL,
];

pub struct DiskCollector;

impl Collector for DiskCollector {
    fn name(&self) -> &'static str {
        "disk"
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

        let api = domain.api();
        let mut records = Vec::new();

        for device in discover_disks(domain) {
            let labels = [domain.name(), domain.uuid(), device.as_str()];

            // a failing device never drops the others
            match api.block_stats(&device) {
                Ok(stats) => {
                    let counters = [
                        (&READ_BYTES, stats.rd_bytes),
                        (&WRITE_BYTES, stats.wr_bytes),
                        (&READ_REQUESTS, stats.rd_req),
                        (&WRITE_REQUESTS, stats.wr_req),
                        (&ERRORS, stats.errs),
                    ];
                    for (desc, raw) in counters {
                        if let Some(value) = supported(raw) {
                            records.push(desc.record(&labels, value));
                        }
                    }
                }
                Err(e) => log_skip(domain, self.name(), "get block stats", &e),
            }

            // block info is optional per driver and storage type
            match api.block_info(&device) {
                Ok(info) => {
                    records.push(CAPACITY.record(&labels, info.capacity as f64));
                    records.push(ALLOCATION.record(&labels, info.allocation as f64));
                    records.push(PHYSICAL.record(&labels, info.physical as f64));
                }
                Err(e) => debug!(
                    domain = %domain.name(),
                    uuid = %domain.uuid(),
                    device = %device,
                    error = %e,
                    "Block info unavailable"
                ),
            }
        }

        Ok(records)
    }
}
