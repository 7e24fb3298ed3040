//! Scrape orchestration
//!
//! One scrape runs these steps in order:
//! 1. make sure the hypervisor session is live (reconnecting if needed)
//! 2. enumerate domains
//! 3. run every host unit and every (domain, collector) unit on the blocking
//!    pool, bounded by a semaphore and a per-unit timeout
//! 4. merge the records in a stable order (host first, then domain by domain)
//! 5. update the self-monitoring state and append the summary records
//!
//! A failure in step 1 or 2 makes the scrape report self-monitoring records
//! only, with `libvirt_up` at 0. Unit failures only mark their collector as
//! failed for this scrape.

use super::{Collector, CollectorRegistry, CollectorScope};
use crate::connection::{ConnectionGuardian, Session};
use crate::domain::{list_domains, DomainHandle, DomainSet};
use crate::error::{ApiError, CollectorError, ScrapeError};
use crate::health::{components, HealthRegistry};
use crate::models::{MetricDesc, MetricRecord, Snapshot};
use crate::observability::{CollectorOutcome, ExporterState, ScrapeSummary, StructuredLogger};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the scrape engine
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Upper bound for one collector unit (default: 10 seconds)
    pub timeout: Duration,
    /// Units running at the same time (default: 10)
    pub max_concurrency: usize,
    /// Expected time between scrapes; slower scrapes are logged (default: 15 seconds)
    pub interval: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_concurrency: 10,
            interval: Duration::from_secs(15),
        }
    }
}

/// Output of one unit of work
struct UnitResult {
    seq: usize,
    collector: &'static str,
    domain: Option<String>,
    elapsed: Duration,
    result: Result<Vec<MetricRecord>, CollectorError>,
}

/// Records and outcomes of the hypervisor part of a scrape
struct Collected {
    records: Vec<MetricRecord>,
    outcomes: Vec<CollectorOutcome>,
    domains: usize,
}

/// Runs scrapes against the guarded session
pub struct Orchestrator {
    guardian: Arc<ConnectionGuardian>,
    registry: CollectorRegistry,
    state: Arc<ExporterState>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
    logger: StructuredLogger,
    scrape_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn guardian(&self) -> &Arc<ConnectionGuardian> {
        &self.guardian
    }

    pub fn state(&self) -> &Arc<ExporterState> {
        &self.state
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// Every family the enabled collectors may emit. Needs no connection.
    pub fn describe(&self) -> Vec<&'static MetricDesc> {
        self.registry.describe()
    }

    /// Run one scrape. Concurrent callers wait for the running scrape.
    ///
    /// Never fails: problems reaching the hypervisor show up as
    /// `Snapshot::up == false` and in the self-monitoring records.
    pub async fn scrape(&self) -> Snapshot {
        let _guard = self.scrape_lock.lock().await;
        let started = Instant::now();
        self.registry.reset_all();

        let (mut records, outcomes, domains, up) = match self.collect_hypervisor().await {
            Ok(collected) => (collected.records, collected.outcomes, collected.domains, true),
            Err(e) => {
                self.state.record_scrape_error();
                self.logger.log_scrape_failed(&e.to_string());
                self.report_scrape_error(&e).await;
                (Vec::new(), Vec::new(), 0, false)
            }
        };

        let duration = started.elapsed();
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.collector)
            .collect();

        if up {
            if let Some(health) = &self.health {
                health.set_healthy(components::CONNECTION).await;
                health.record_collectors(&failed).await;
            }
        }
        if duration > self.config.interval {
            self.logger
                .log_slow_scrape(duration, self.config.interval, domains);
        }

        debug!(
            up,
            domains,
            records = records.len(),
            failed_collectors = failed.len(),
            elapsed_ms = duration.as_millis() as u64,
            "Scrape complete"
        );

        self.state.finish_scrape(ScrapeSummary {
            up,
            duration,
            domains,
            outcomes,
        });

        records.extend(self.collect_summary().await);

        Snapshot {
            records,
            up,
            duration,
        }
    }

    async fn report_scrape_error(&self, err: &ScrapeError) {
        let Some(health) = &self.health else {
            return;
        };
        match err {
            ScrapeError::ConnectionUnavailable { .. } => {
                health
                    .set_unhealthy(components::CONNECTION, err.to_string())
                    .await
            }
            ScrapeError::EnumerationFailed(_) => {
                health
                    .set_degraded(components::CONNECTION, err.to_string())
                    .await
            }
        }
    }

    async fn collect_hypervisor(&self) -> Result<Collected, ScrapeError> {
        let session = self.guardian.ensure_live().await?;
        let domains = self.enumerate(session.clone()).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut units = JoinSet::new();
        let mut seq = 0;

        for collector in self.scoped(CollectorScope::Host) {
            self.spawn_unit(&mut units, &semaphore, seq, collector, &session, None);
            seq += 1;
        }
        for domain in domains.iter() {
            for collector in self.scoped(CollectorScope::Domain) {
                self.spawn_unit(
                    &mut units,
                    &semaphore,
                    seq,
                    collector,
                    &session,
                    Some(domain.clone()),
                );
                seq += 1;
            }
        }

        let mut results = Vec::with_capacity(seq);
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(unit) => results.push(unit),
                Err(e) => warn!(error = %e, "Collector unit task failed"),
            }
        }
        results.sort_by_key(|unit| unit.seq);

        let mut outcomes: Vec<CollectorOutcome> = self
            .registry
            .iter()
            .filter(|c| c.scope() != CollectorScope::Summary)
            .map(|c| CollectorOutcome {
                collector: c.name(),
                success: true,
                duration: Duration::ZERO,
            })
            .collect();

        let mut records = Vec::new();
        for unit in results {
            if let Some(outcome) = outcomes.iter_mut().find(|o| o.collector == unit.collector) {
                outcome.duration += unit.elapsed;
                outcome.success &= unit.result.is_ok();
            }
            match unit.result {
                Ok(unit_records) => records.extend(unit_records),
                Err(e) => warn!(
                    collector = unit.collector,
                    domain = unit.domain.as_deref().unwrap_or(""),
                    error = %e,
                    "Collector unit failed"
                ),
            }
        }

        Ok(Collected {
            records,
            outcomes,
            domains: domains.len(),
        })
    }

    async fn enumerate(&self, session: Arc<Session>) -> Result<DomainSet, ScrapeError> {
        let state = self.state.clone();
        let task = tokio::task::spawn_blocking(move || list_domains(&session, state));

        match tokio::time::timeout(self.config.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ScrapeError::EnumerationFailed(ApiError::other(format!(
                "enumeration task failed: {e}"
            )))),
            Err(_) => Err(ScrapeError::EnumerationFailed(ApiError::other(format!(
                "enumeration timed out after {}ms",
                self.config.timeout.as_millis()
            )))),
        }
    }

    /// Self-monitoring records, built after the state reflects this scrape
    async fn collect_summary(&self) -> Vec<MetricRecord> {
        let session = self.guardian.current().await;
        let mut records = Vec::new();

        for collector in self.scoped(CollectorScope::Summary) {
            let name = collector.name();
            match run_unit(collector, session.clone(), None, self.config.timeout).await {
                Ok(unit_records) => records.extend(unit_records),
                Err(e) => warn!(collector = name, error = %e, "Summary collector failed"),
            }
        }
        records
    }

    fn scoped(&self, scope: CollectorScope) -> impl Iterator<Item = Arc<dyn Collector>> + '_ {
        self.registry
            .iter()
            .filter(move |c| c.scope() == scope)
            .cloned()
    }

    fn spawn_unit(
        &self,
        units: &mut JoinSet<UnitResult>,
        semaphore: &Arc<Semaphore>,
        seq: usize,
        collector: Arc<dyn Collector>,
        session: &Arc<Session>,
        domain: Option<Arc<DomainHandle>>,
    ) {
        let semaphore = semaphore.clone();
        let session = session.clone();
        let timeout = self.config.timeout;

        units.spawn(async move {
            let name = collector.name();
            let domain_name = domain.as_ref().map(|d| d.name().to_string());

            // After a timeout the permit is returned while the blocking call
            // keeps running detached, holding its domain handle until it returns.
            let (elapsed, result) = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let started = Instant::now();
                    let result = run_unit(collector, session, domain, timeout).await;
                    (started.elapsed(), result)
                }
                Err(_) => (
                    Duration::ZERO,
                    Err(CollectorError::Task("unit semaphore closed".to_string())),
                ),
            };

            UnitResult {
                seq,
                collector: name,
                domain: domain_name,
                elapsed,
                result,
            }
        });
    }
}

/// Run one collector call on the blocking pool under a timeout.
///
/// A timed-out call keeps its blocking thread until the API returns; its
/// result is discarded.
async fn run_unit(
    collector: Arc<dyn Collector>,
    session: Arc<Session>,
    domain: Option<Arc<DomainHandle>>,
    timeout: Duration,
) -> Result<Vec<MetricRecord>, CollectorError> {
    // the closure owns the handle, so a timed-out unit releases it late
    let task = tokio::task::spawn_blocking(move || collector.collect(&session, domain.as_deref()));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(CollectorError::Task(e.to_string())),
        Err(_) => Err(CollectorError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    guardian: Option<Arc<ConnectionGuardian>>,
    state: Option<Arc<ExporterState>>,
    registry: Option<CollectorRegistry>,
    enabled: Option<Vec<String>>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
}

impl OrchestratorBuilder {
    pub fn guardian(mut self, guardian: Arc<ConnectionGuardian>) -> Self {
        self.guardian = Some(guardian);
        self
    }

    /// State shared with the guardian; also feeds the self-monitoring collector
    pub fn state(mut self, state: Arc<ExporterState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Use a custom registry instead of the built-in collectors
    pub fn registry(mut self, registry: CollectorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Restrict collection to these categories
    pub fn enabled_categories<S: Into<String>>(
        mut self,
        enabled: impl IntoIterator<Item = S>,
    ) -> Self {
        self.enabled = Some(enabled.into_iter().map(Into::into).collect());
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let guardian = self
            .guardian
            .ok_or_else(|| anyhow!("connection guardian is required"))?;
        let state = self
            .state
            .ok_or_else(|| anyhow!("exporter state is required"))?;

        if self.config.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        if self.config.timeout.is_zero() {
            bail!("collection timeout must be greater than zero");
        }

        let mut registry = self
            .registry
            .unwrap_or_else(|| CollectorRegistry::with_defaults(state.clone()));
        if let Some(enabled) = &self.enabled {
            registry.retain_enabled(enabled.as_slice());
        }

        Ok(Orchestrator {
            logger: StructuredLogger::new(guardian.uri()),
            guardian,
            registry,
            state,
            health: self.health,
            config: self.config,
            scrape_lock: Mutex::new(()),
        })
    }
}
