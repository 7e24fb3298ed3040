//! Domain status collector
//!
//! Reports every enumerated domain, running or not.

use super::{optional, required, Collector};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::hypervisor::DomainState;
use crate::models::{MetricDesc, MetricRecord};

const LABELS: &[&str] = crate::domain::DOMAIN_LABELS;

static RUNNING: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_running",
    "Whether the domain is running (1) or not (0)",
    LABELS,
);
static STATE: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_state",
    "Raw domain state code (0 nostate, 1 running, 2 blocked, 3 paused, 4 shutdown, \
     5 shutoff, 6 crashed, 7 pmsuspended)",
    LABELS,
);
static PERSISTENT: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_persistent",
    "Whether the domain has a persistent configuration",
    LABELS,
);
static AUTOSTART: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_autostart",
    "Whether the domain starts with the host",
    LABELS,
);
static MANAGED_SAVE: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_managed_save",
    "Whether the domain has a managed save image",
    LABELS,
);
static MEMORY_MAX: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_max_bytes",
    "Memory assigned to the domain in bytes",
    LABELS,
);
static MEMORY_CURRENT: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_memory_current_bytes",
    "Memory currently used by the domain in bytes",
    LABELS,
);
static CPU_SECONDS: MetricDesc = MetricDesc::counter(
    "libvirt_vm_cpu_seconds_total",
    "Cumulative CPU time used by the domain in seconds",
    LABELS,
);
static VCPUS: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_vcpus",
    "Number of virtual CPUs of the domain",
    LABELS,
);
static UPTIME: MetricDesc = MetricDesc::gauge(
    "libvirt_vm_uptime_seconds",
    "Seconds since the domain was started",
    LABELS,
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &RUNNING,
    &STATE,
    &PERSISTENT,
    &AUTOSTART,
    &MANAGED_SAVE,
    &MEMORY_MAX,
    &MEMORY_CURRENT,
    &CPU_SECONDS,
    &VCPUS,
    &UPTIME,
];

pub struct DomainInfoCollector;

impl Collector for DomainInfoCollector {
    fn name(&self) -> &'static str {
        "domain_info"
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
        let Some(info) = required(domain, "get domain info", domain.info())? else {
            return Ok(Vec::new());
        };

        let labels = domain.labels();
        let running = info.state == DomainState::Running;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let mut records = vec![
            RUNNING.record(&labels, flag(running)),
            STATE.record(&labels, f64::from(info.state.code())),
        ];

        let api = domain.api();
        if let Some(persistent) =
            optional(domain, self.name(), "is persistent", api.is_persistent())
        {
            records.push(PERSISTENT.record(&labels, flag(persistent)));
        }
        if let Some(autostart) = optional(domain, self.name(), "get autostart", api.autostart()) {
            records.push(AUTOSTART.record(&labels, flag(autostart)));
        }
        if let Some(saved) =
            optional(domain, self.name(), "has managed save", api.has_managed_save())
        {
            records.push(MANAGED_SAVE.record(&labels, flag(saved)));
        }

        records.push(MEMORY_MAX.record(&labels, kib_to_bytes(info.max_memory_kib)));
        records.push(MEMORY_CURRENT.record(&labels, kib_to_bytes(info.memory_kib)));
        records.push(CPU_SECONDS.record(&labels, info.cpu_time_ns as f64 / 1e9));
        records.push(VCPUS.record(&labels, f64::from(info.vcpus)));

        if running {
            // boot time is not available from every driver; absence is not an error
            if let Ok(boot) = api.boot_time() {
                let uptime = chrono::Utc::now().timestamp() - boot;
                records.push(UPTIME.record(&labels, uptime.max(0) as f64));
            }
        }

        Ok(records)
    }
}

pub(crate) fn kib_to_bytes(kib: u64) -> f64 {
    kib.saturating_mul(1024) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kib_to_bytes() {
        assert_eq!(kib_to_bytes(524_288), 536_870_912.0);
        assert_eq!(kib_to_bytes(0), 0.0);
    }
}
