//! Device inventory, snapshot and job collector
//!
//! Inventory comes from the domain descriptor and is reported for every
//! domain. Job progress is only reported while a job is active.

use super::{log_skip, optional, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::models::{MetricDesc, MetricRecord};

const LABELS: &[&str] = crate::domain::DOMAIN_LABELS;

/// Hostdev kinds always reported, even when zero
const HOSTDEV_KINDS: &[&str] = &["pci", "usb", "mdev"];

static TPM: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_tpm_present",
    "Whether the domain has a TPM device",
    LABELS,
);
static RNG: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_rng_present",
    "Whether the domain has a random number generator device",
    LABELS,
);
static HOSTDEVS: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_hostdevs",
    "Host devices assigned to the domain by kind",
    &["domain", "uuid", "type"],
);
static SNAPSHOTS: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_snapshots",
    "Number of snapshots of the domain",
    LABELS,
);
static JOB_INFO: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_job_info",
    "Active background job of the domain",
    &["domain", "uuid", "type"],
);
static JOB_TOTAL: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_job_data_total_bytes",
    "Total data of the active job in bytes",
    LABELS,
);
static JOB_PROCESSED: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_job_data_processed_bytes",
    "Data processed by the active job in bytes",
    LABELS,
);
static JOB_REMAINING: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_job_data_remaining_bytes",
    "Data remaining for the active job in bytes",
    LABELS,
);
static JOB_PROGRESS: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_job_progress_ratio",
    "Progress of the active job between 0 and 1",
    LABELS,
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &TPM,
    &RNG,
    &HOSTDEVS,
    &SNAPSHOTS,
    &JOB_INFO,
    &JOB_TOTAL,
    &JOB_PROCESSED,
    &JOB_REMAINING,
    &JOB_PROGRESS,
];

pub struct DeviceCollector;

impl Collector for DeviceCollector {
    fn name(&self) -> &'static str {
        "device"
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

        let labels = domain.labels();
        let mut records = Vec::new();

        match domain.descriptor() {
            Ok(desc) => {
                let devices = &desc.devices;
                let flag = |present: bool| if present { 1.0 } else { 0.0 };
                records.push(TPM.record(&labels, flag(!devices.tpms.is_empty())));
                records.push(RNG.record(&labels, flag(!devices.rngs.is_empty())));

                let mut kinds: Vec<&str> = HOSTDEV_KINDS.to_vec();
                for dev in &devices.hostdevs {
                    if !dev.hostdev_type.is_empty() && !kinds.contains(&dev.hostdev_type.as_str()) {
                        kinds.push(&dev.hostdev_type);
                    }
                }
                for kind in kinds {
                    let count = devices
                        .hostdevs
                        .iter()
                        .filter(|d| d.hostdev_type == kind)
                        .count();
                    let labels = [domain.name(), domain.uuid(), kind];
                    records.push(HOSTDEVS.record(&labels, count as f64));
                }
            }
            Err(e) => log_skip(domain, self.name(), "get descriptor", &e),
        }

        let api = domain.api();
        if let Some(count) = optional(domain, self.name(), "list snapshots", api.snapshot_count()) {
            records.push(SNAPSHOTS.record(&labels, f64::from(count)));
        }

        // job queries fail on inactive domains; that is not worth a log line
        if let Ok(job) = api.job_info() {
            if job.job_type.is_active() {
                records.push(JOB_INFO.record(
                    &[domain.name(), domain.uuid(), job.job_type.as_str()],
                    1.0,
                ));
                records.push(JOB_TOTAL.record(&labels, job.data_total as f64));
                records.push(JOB_PROCESSED.record(&labels, job.data_processed as f64));
                records.push(JOB_REMAINING.record(&labels, job.data_remaining as f64));
                if job.data_total > 0 {
                    let ratio = job.data_processed as f64 / job.data_total as f64;
                    records.push(JOB_PROGRESS.record(&labels, ratio.clamp(0.0, 1.0)));
                }
            }
        }

        Ok(records)
    }
}
