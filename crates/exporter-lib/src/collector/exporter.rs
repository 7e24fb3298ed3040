//! Self-monitoring collector
//!
//! Reports the exporter's own health from [`ExporterState`]. It runs after
//! every other unit of the scrape, and also when the scrape failed before
//! reaching the hypervisor, so `libvirt_up` is always present.

use super::{Collector, CollectorScope};
use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::CollectorError;
use crate::models::{MetricDesc, MetricRecord};
use crate::observability::ExporterState;
use std::sync::Arc;

static UP: MetricDesc = MetricDesc::gauge(
    "libvirt_up",
    "Whether the last scrape reached the hypervisor and enumerated domains",
    &[],
);
static LAST_SCRAPE: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_last_scrape_timestamp_seconds",
    "Unix time the last scrape finished",
    &[],
);
static SCRAPE_DURATION: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_scrape_duration_seconds",
    "Duration of the last scrape in seconds",
    &[],
);
static SCRAPES: MetricDesc = MetricDesc::counter(
    "libvirt_exporter_scrapes_total",
    "Scrapes performed since start",
    &[],
);
static SCRAPE_ERRORS: MetricDesc = MetricDesc::counter(
    "libvirt_exporter_scrape_errors_total",
    "Scrapes that failed to reach the hypervisor or enumerate domains",
    &[],
);
static RECONNECTS: MetricDesc = MetricDesc::counter(
    "libvirt_exporter_reconnects_total",
    "Successful reconnects to the hypervisor",
    &[],
);
static DOMAINS: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_domains_discovered",
    "Domains enumerated by the last scrape",
    &[],
);
static CACHE_HITS: MetricDesc = MetricDesc::counter(
    "libvirt_exporter_descriptor_cache_hits_total",
    "Domain descriptor lookups served from the per-scrape cache",
    &[],
);
static CACHE_MISSES: MetricDesc = MetricDesc::counter(
    "libvirt_exporter_descriptor_cache_misses_total",
    "Domain descriptor lookups that fetched and parsed the descriptor",
    &[],
);
static COLLECTOR_SUCCESS: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_collector_success",
    "Whether every unit of the collector succeeded in the last scrape",
    &["collector"],
);
static COLLECTOR_DURATION: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_collector_duration_seconds",
    "Time spent in the collector's units during the last scrape",
    &["collector"],
);
static BUILD_INFO: MetricDesc = MetricDesc::gauge(
    "libvirt_exporter_build_info",
    "Exporter build information",
    &["version"],
);

static DESCRIPTORS: &[&MetricDesc] = &[
    &UP,
    &LAST_SCRAPE,
    &SCRAPE_DURATION,
    &SCRAPES,
    &SCRAPE_ERRORS,
    &RECONNECTS,
    &DOMAINS,
    &CACHE_HITS,
    &CACHE_MISSES,
    &COLLECTOR_SUCCESS,
    &COLLECTOR_DURATION,
    &BUILD_INFO,
];

pub struct ExporterCollector {
    state: Arc<ExporterState>,
}

impl ExporterCollector {
    pub fn new(state: Arc<ExporterState>) -> Self {
        Self { state }
    }

    /// Records built from the current state, without touching the API
    pub(crate) fn records(&self) -> Vec<MetricRecord> {
        let snap = self.state.snapshot();
        let none: [&str; 0] = [];

        let mut records = vec![
            UP.record(&none, if snap.last_scrape_up { 1.0 } else { 0.0 }),
            LAST_SCRAPE.record(&none, snap.last_scrape_timestamp as f64),
            SCRAPE_DURATION.record(&none, snap.last_scrape_duration.as_secs_f64()),
            SCRAPES.record(&none, snap.scrapes_total as f64),
            SCRAPE_ERRORS.record(&none, snap.scrape_errors_total as f64),
            RECONNECTS.record(&none, snap.reconnects_total as f64),
            DOMAINS.record(&none, snap.domains_discovered as f64),
            CACHE_HITS.record(&none, snap.cache_hits_total as f64),
            CACHE_MISSES.record(&none, snap.cache_misses_total as f64),
        ];

        for outcome in &snap.outcomes {
            let label = [outcome.collector];
            records.push(COLLECTOR_SUCCESS.record(&label, if outcome.success { 1.0 } else { 0.0 }));
            records.push(COLLECTOR_DURATION.record(&label, outcome.duration.as_secs_f64()));
        }

        records.push(BUILD_INFO.record(&[env!("CARGO_PKG_VERSION")], 1.0));
        records
    }
}

impl Collector for ExporterCollector {
    fn name(&self) -> &'static str {
        "exporter"
    }

    fn scope(&self) -> CollectorScope {
        CollectorScope::Summary
    }

    fn describe(&self) -> &'static [&'static MetricDesc] {
        DESCRIPTORS
    }

    fn collect(
        &self,
        _session: &Session,
        _domain: Option<&DomainHandle>,
    ) -> Result<Vec<MetricRecord>, CollectorError> {
        Ok(self.records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{CollectorOutcome, ScrapeSummary};
    use std::time::Duration;

    #[test]
    fn test_records_reflect_state() {
        let state = Arc::new(ExporterState::new());
        state.record_reconnect();
        state.finish_scrape(ScrapeSummary {
            up: true,
            duration: Duration::from_millis(250),
            domains: 2,
            outcomes: vec![
                CollectorOutcome {
                    collector: "cpu",
                    success: true,
                    duration: Duration::from_millis(3),
                },
                CollectorOutcome {
                    collector: "memory",
                    success: false,
                    duration: Duration::from_millis(4),
                },
            ],
        });

        let records = ExporterCollector::new(state).records();
        let value = |name: &str| records.iter().find(|r| r.name() == name).map(|r| r.value);

        assert_eq!(value("libvirt_up"), Some(1.0));
        assert_eq!(value("libvirt_exporter_reconnects_total"), Some(1.0));
        assert_eq!(value("libvirt_exporter_domains_discovered"), Some(2.0));
        assert_eq!(value("libvirt_exporter_scrape_duration_seconds"), Some(0.25));

        let memory = records
            .iter()
            .find(|r| {
                r.name() == "libvirt_exporter_collector_success"
                    && r.label("collector") == Some("memory")
            })
            .unwrap();
        assert_eq!(memory.value, 0.0);
    }

    #[test]
    fn test_up_defaults_to_zero() {
        let records = ExporterCollector::new(Arc::new(ExporterState::new())).records();
        let up = records.iter().find(|r| r.name() == "libvirt_up").unwrap();
        assert_eq!(up.value, 0.0);
    }
}
