//! Observability infrastructure for the exporter
//!
//! Provides:
//! - [`ExporterState`]: counters and last-scrape facts the self-monitoring
//!   collector reports (scrape count, errors, reconnects, descriptor cache)
//! - [`StructuredLogger`]: consistent `event = "..."` log records for
//!   lifecycle and connection events

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of one collector during the last scrape
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOutcome {
    pub collector: &'static str,
    pub success: bool,
    /// Sum of the collector's unit durations
    pub duration: Duration,
}

/// Summary handed to [`ExporterState::finish_scrape`]
#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub up: bool,
    pub duration: Duration,
    pub domains: usize,
    pub outcomes: Vec<CollectorOutcome>,
}

/// Point-in-time copy of [`ExporterState`]
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub scrapes_total: u64,
    pub scrape_errors_total: u64,
    pub reconnects_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub last_scrape_timestamp: i64,
    pub last_scrape_duration: Duration,
    pub last_scrape_up: bool,
    pub domains_discovered: u64,
    pub outcomes: Vec<CollectorOutcome>,
}

/// Process-wide self-monitoring state
///
/// Shared between the connection guardian, the domain enumerator, the
/// orchestrator and the self-monitoring collector.
#[derive(Debug, Default)]
pub struct ExporterState {
    scrapes_total: AtomicU64,
    scrape_errors_total: AtomicU64,
    reconnects_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    last_scrape_timestamp: AtomicI64,
    last_scrape_duration_us: AtomicU64,
    last_scrape_up: AtomicBool,
    domains_discovered: AtomicU64,
    outcomes: Mutex<Vec<CollectorOutcome>>,
}

impl ExporterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scrape_error(&self) {
        self.scrape_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects_total(&self) -> u64 {
        self.reconnects_total.load(Ordering::Relaxed)
    }

    pub fn scrape_errors_total(&self) -> u64 {
        self.scrape_errors_total.load(Ordering::Relaxed)
    }

    pub fn last_scrape_up(&self) -> bool {
        self.last_scrape_up.load(Ordering::Relaxed)
    }

    /// Record the end of a scrape cycle
    pub fn finish_scrape(&self, summary: ScrapeSummary) {
        self.scrapes_total.fetch_add(1, Ordering::Relaxed);
        self.last_scrape_timestamp
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        self.last_scrape_duration_us.store(
            u64::try_from(summary.duration.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.last_scrape_up.store(summary.up, Ordering::Relaxed);
        self.domains_discovered
            .store(summary.domains as u64, Ordering::Relaxed);

        match self.outcomes.lock() {
            Ok(mut outcomes) => *outcomes = summary.outcomes,
            Err(poisoned) => *poisoned.into_inner() = summary.outcomes,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let outcomes = match self.outcomes.lock() {
            Ok(outcomes) => outcomes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        StateSnapshot {
            scrapes_total: self.scrapes_total.load(Ordering::Relaxed),
            scrape_errors_total: self.scrape_errors_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            last_scrape_timestamp: self.last_scrape_timestamp.load(Ordering::Relaxed),
            last_scrape_duration: Duration::from_micros(
                self.last_scrape_duration_us.load(Ordering::Relaxed),
            ),
            last_scrape_up: self.last_scrape_up.load(Ordering::Relaxed),
            domains_discovered: self.domains_discovered.load(Ordering::Relaxed),
            outcomes,
        }
    }
}

/// Structured logger for exporter events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    uri: String,
}

impl StructuredLogger {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, listen_address: &str, telemetry_path: &str) {
        info!(
            event = "exporter_started",
            uri = %self.uri,
            exporter_version = %version,
            listen_address = %listen_address,
            telemetry_path = %telemetry_path,
            "Libvirt exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            uri = %self.uri,
            reason = %reason,
            "Libvirt exporter shutting down"
        );
    }

    /// Log a reconnect attempt outcome
    pub fn log_reconnect(
        &self,
        attempt: u32,
        max_attempts: u32,
        generation: u64,
        error: Option<&str>,
    ) {
        match error {
            None => info!(
                event = "connection_restored",
                uri = %self.uri,
                attempt,
                generation,
                "Reconnected to hypervisor"
            ),
            Some(error) => warn!(
                event = "reconnect_failed",
                uri = %self.uri,
                attempt,
                max_attempts,
                error = %error,
                "Reconnect attempt failed"
            ),
        }
    }

    /// Log a scrape that produced no hypervisor data
    pub fn log_scrape_failed(&self, error: &str) {
        warn!(
            event = "scrape_failed",
            uri = %self.uri,
            error = %error,
            "Scrape failed, reporting exporter metrics only"
        );
    }

    /// Log a scrape that took longer than the configured interval
    pub fn log_slow_scrape(&self, elapsed: Duration, interval: Duration, domains: usize) {
        warn!(
            event = "slow_scrape",
            uri = %self.uri,
            elapsed_ms = elapsed.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            domains,
            "Scrape took longer than the collection interval"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_scrape_updates_state() {
        let state = ExporterState::new();
        state.record_reconnect();
        state.record_cache_miss();
        state.record_cache_hit();
        state.record_cache_hit();

        state.finish_scrape(ScrapeSummary {
            up: true,
            duration: Duration::from_millis(120),
            domains: 3,
            outcomes: vec![CollectorOutcome {
                collector: "cpu",
                success: true,
                duration: Duration::from_millis(10),
            }],
        });

        let snap = state.snapshot();
        assert_eq!(snap.scrapes_total, 1);
        assert_eq!(snap.reconnects_total, 1);
        assert_eq!(snap.cache_hits_total, 2);
        assert_eq!(snap.cache_misses_total, 1);
        assert_eq!(snap.domains_discovered, 3);
        assert_eq!(snap.last_scrape_duration, Duration::from_millis(120));
        assert!(snap.last_scrape_up);
        assert!(snap.last_scrape_timestamp > 0);
        assert_eq!(snap.outcomes.len(), 1);
    }

    #[test]
    fn test_failed_scrape_keeps_counters() {
        let state = ExporterState::new();
        state.record_scrape_error();
        state.finish_scrape(ScrapeSummary {
            up: false,
            duration: Duration::from_millis(5),
            domains: 0,
            outcomes: Vec::new(),
        });

        assert_eq!(state.scrape_errors_total(), 1);
        assert!(!state.last_scrape_up());
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("qemu:///system");
        logger.log_startup("0.1.0", "0.0.0.0:9177", "/metrics");
        logger.log_reconnect(1, 3, 2, Some("connection refused"));
        logger.log_shutdown("test");
    }
}
