//! vCPU and CPU time collector (running domains only)

use super::{optional, require_running, required, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::models::{MetricDesc, MetricRecord};

const LABELS: &[&str] = crate::domain::DOMAIN_LABELS;

static VCPUS_MAX: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_vcpus_max",
    "Maximum number of virtual CPUs the domain can use",
    LABELS,
);
static VCPUS_CURRENT: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_vcpus_current",
    "Number of virtual CPUs currently online",
    LABELS,
);
static CPU_TIME: MetricDesc = MetricDesc::counter(
    "libvirt_vm_cpu_time_nanoseconds_total",
    "Cumulative CPU time used by the domain in nanoseconds",
    LABELS,
);
static USER_TIME: MetricDesc = MetricDesc::counter(
    "libvirt_vm_cpu_user_time_nanoseconds_total",
    "Cumulative guest user CPU time in nanoseconds",
    LABELS,
);
static SYSTEM_TIME: MetricDesc = MetricDesc::counter(
    "libvirt_vm_cpu_system_time_nanoseconds_total",
    "Cumulative guest system CPU time in nanoseconds",
    LABELS,
);
static SCHEDULER: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_cpu_scheduler_info",
    "Scheduler policy of the domain",
    &["domain", "uuid", "scheduler"],
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &VCPUS_MAX,
    &VCPUS_CURRENT,
    &CPU_TIME,
    &USER_TIME,
    &SYSTEM_TIME,
    &SCHEDULER,
];

pub struct CpuCollector;

impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        "cpu"
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
        let Some(info) = required(domain, "get domain info", domain.info())? else {
            return Ok(Vec::new());
        };

        let api = domain.api();
        let labels = domain.labels();
        let mut records = Vec::with_capacity(DESCRIPTORS.len());

        if let Some(max) = optional(domain, self.name(), "get max vcpus", api.max_vcpus()) {
            records.push(VCPUS_MAX.record(&labels, f64::from(max)));
        }
        if let Some(current) = optional(domain, self.name(), "get vcpus", api.current_vcpus()) {
            records.push(VCPUS_CURRENT.record(&labels, f64::from(current)));
        }
        records.push(CPU_TIME.record(&labels, info.cpu_time_ns as f64));

        // the split is optional per driver
        if let Ok(stats) = api.cpu_stats() {
            if stats.user_time_ns > 0 {
                records.push(USER_TIME.record(&labels, stats.user_time_ns as f64));
            }
            if stats.system_time_ns > 0 {
                records.push(SYSTEM_TIME.record(&labels, stats.system_time_ns as f64));
            }
        }

        if let Some(scheduler) =
            optional(domain, self.name(), "get scheduler type", api.scheduler_type())
        {
            let labels = [domain.name(), domain.uuid(), scheduler.as_str()];
            records.push(SCHEDULER.record(&labels, 1.0));
        }

        Ok(records)
    }
}
