//! Metric collectors
//!
//! Each collector covers one category of hypervisor data and turns API
//! answers into [`MetricRecord`]s. Per-domain collectors are invoked once per
//! enumerated domain; host collectors once per scrape; summary collectors
//! after every other unit has finished.
//!
//! Collectors are stateless between scrapes apart from what [`Collector::reset`]
//! clears, so the [`Orchestrator`] can run units for different domains
//! concurrently.

mod cpu;
mod device;
mod discovery;
mod disk;
mod domain_info;
mod exporter;
mod host;
mod memory;
mod network;
mod orchestrator;


pub use cpu::CpuCollector;
pub use device::DeviceCollector;
pub use discovery::{discover_disks, discover_interfaces, DISK_CANDIDATES, INTERFACE_CANDIDATES};
pub use disk::DiskCollector;
pub use domain_info::DomainInfoCollector;
pub use exporter::ExporterCollector;
pub use host::ConnectionCollector;
pub use memory::MemoryCollector;
pub use network::NetworkCollector;
pub use orchestrator::{CollectionConfig, Orchestrator, OrchestratorBuilder};

use crate::connection::Session;
use crate::domain::DomainHandle;
use crate::error::{ApiError, CollectorError};
use crate::models::{MetricDesc, MetricRecord};
use crate::observability::ExporterState;
use std::sync::Arc;
use tracing::warn;

/// When and how often a collector runs within a scrape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorScope {
    /// Once per enumerated domain
    Domain,
    /// Once per scrape, for the hypervisor itself
    Host,
    /// Once per scrape, after every other unit finished
    Summary,
}

/// A source of metric records
///
/// `collect` blocks on the management API and is run on the blocking pool.
pub trait Collector: Send + Sync {
    /// Category name, also used in `metrics.enabled` and log records
    fn name(&self) -> &'static str;

    fn scope(&self) -> CollectorScope {
        CollectorScope::Domain
    }

    /// Every family this collector may emit
    fn describe(&self) -> &'static [&'static MetricDesc];

    /// Produce records for one unit of work.
    ///
    /// `domain` is set for [`CollectorScope::Domain`] collectors and `None`
    /// otherwise.
    fn collect(
        &self,
        session: &Session,
        domain: Option<&DomainHandle>,
    ) -> Result<Vec<MetricRecord>, CollectorError>;

    /// Clear per-scrape state before a new scrape starts
    fn reset(&self) {}
}

/// Category names accepted in `metrics.enabled`
pub const CATEGORIES: &[&str] = &[
    "domain_info",
    "cpu",
    "memory",
    "disk",
    "network",
    "device",
    "connection",
];

/// Map a configured category name to its collector name.
///
/// Accepts the canonical names plus the older `vm_*` spellings.
pub fn normalize_category(name: &str) -> Option<&'static str> {
    let canonical = match name.trim() {
        "vm_status" | "vm_uptime" | "domain" => "domain_info",
        "vm_cpu" => "cpu",
        "vm_memory" => "memory",
        "vm_disk" => "disk",
        "vm_network" => "network",
        "vm_device" | "devices" => "device",
        "host" => "connection",
        other => other,
    };
    CATEGORIES.iter().copied().find(|c| *c == canonical)
}

/// Ordered set of collectors used by the orchestrator
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in collector, in exposition order
    pub fn with_defaults(state: Arc<ExporterState>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DomainInfoCollector));
        registry.register(Arc::new(CpuCollector));
        registry.register(Arc::new(MemoryCollector));
        registry.register(Arc::new(DiskCollector));
        registry.register(Arc::new(NetworkCollector));
        registry.register(Arc::new(DeviceCollector));
        registry.register(Arc::new(ConnectionCollector::new()));
        registry.register(Arc::new(ExporterCollector::new(state)));
        registry
    }

    /// Add a collector. A collector with the same name is replaced.
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        match self
            .collectors
            .iter_mut()
            .find(|c| c.name() == collector.name())
        {
            Some(slot) => *slot = collector,
            None => self.collectors.push(collector),
        }
    }

    /// Keep only the enabled categories. The self-monitoring collector is
    /// always kept.
    pub fn retain_enabled<S: AsRef<str>>(&mut self, enabled: &[S]) {
        let enabled: Vec<&'static str> = enabled
            .iter()
            .filter_map(|name| normalize_category(name.as_ref()))
            .collect();
        self.collectors.retain(|c| {
            c.scope() == CollectorScope::Summary || enabled.contains(&c.name())
        });
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Collector>> {
        self.collectors.iter()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Descriptors of every registered collector, in registration order
    pub fn describe(&self) -> Vec<&'static MetricDesc> {
        self.collectors
            .iter()
            .flat_map(|c| c.describe().iter().copied())
            .collect()
    }

    pub fn reset_all(&self) {
        for collector in &self.collectors {
            collector.reset();
        }
    }
}

/// Gate for collectors that only report running domains.
///
/// `Ok(false)` means: emit nothing for this domain, without error.
pub(crate) fn require_running(domain: &DomainHandle) -> Result<bool, CollectorError> {
    match domain.is_running() {
        Ok(running) => Ok(running),
        Err(e) if e.is_domain_gone() => Ok(false),
        Err(e) => Err(domain_error(domain, "get domain info", e)),
    }
}

pub(crate) fn domain_error(
    domain: &DomainHandle,
    operation: &'static str,
    source: ApiError,
) -> CollectorError {
    CollectorError::Domain {
        domain: domain.name().to_string(),
        uuid: domain.uuid().to_string(),
        operation,
        source,
    }
}

/// Outcome of a query whose failure aborts the unit, unless the domain
/// merely stopped
pub(crate) fn required<T>(
    domain: &DomainHandle,
    operation: &'static str,
    result: Result<T, ApiError>,
) -> Result<Option<T>, CollectorError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_domain_gone() => Ok(None),
        Err(e) => Err(domain_error(domain, operation, e)),
    }
}

/// Outcome of a query whose failure only skips the affected records
pub(crate) fn optional<T>(
    domain: &DomainHandle,
    collector: &'static str,
    operation: &'static str,
    result: Result<T, ApiError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log_skip(domain, collector, operation, &e);
            None
        }
    }
}

pub(crate) fn log_skip(
    domain: &DomainHandle,
    collector: &'static str,
    operation: &str,
    err: &ApiError,
) {
    if err.is_domain_gone() {
        return;
    }
    warn!(
        collector,
        domain = %domain.name(),
        uuid = %domain.uuid(),
        operation,
        error = %err,
        "Query failed, skipping affected metrics"
    );
}

/// Counters reported as -1 by the hypervisor are unsupported
pub(crate) fn supported(value: i64) -> Option<f64> {
    (value >= 0).then_some(value as f64)
}
