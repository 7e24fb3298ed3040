//! Hypervisor connection lifecycle
//!
//! A [`Session`] wraps one open management connection. The
//! [`ConnectionGuardian`] owns the current session, checks its liveness at
//! the start of every scrape and replaces it with a fresh one when the
//! hypervisor went away. Reconnect attempts follow a [`ReconnectPolicy`] and
//! are bounded, so a scrape never hangs on a dead hypervisor.

use crate::error::{ApiError, ScrapeError};
use crate::hypervisor::{Connection, Connector};
use crate::observability::{ExporterState, StructuredLogger};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Delay growth between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts per scrape before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
    /// Upper bound for a single connect or liveness call
    pub call_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.initial_backoff.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.initial_backoff.saturating_mul(factor)
            }
        };
        std::cmp::min(delay, self.max_backoff)
    }
}

/// One open management connection
pub struct Session {
    conn: Arc<dyn Connection>,
    connected_at: DateTime<Utc>,
    generation: u64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uri", &self.conn.uri())
            .field("connected_at", &self.connected_at)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(conn: Arc<dyn Connection>, generation: u64) -> Self {
        Self {
            conn,
            connected_at: Utc::now(),
            generation,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    pub fn uri(&self) -> &str {
        self.conn.uri()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Incremented on every reconnect, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Liveness probe. Blocks on the API.
    pub fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.conn.is_alive() {
            Ok(alive) => alive,
            Err(e) => {
                debug!(uri = %self.uri(), error = %e, "Liveness check failed");
                false
            }
        }
    }

    /// Close the connection. Only the first call reaches the API.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.conn.close() {
            debug!(uri = %self.uri(), error = %e, "Error closing connection");
        }
    }
}

/// Owner of the process-wide session
pub struct ConnectionGuardian {
    uri: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    session: RwLock<Arc<Session>>,
    state: Arc<ExporterState>,
    logger: StructuredLogger,
}

impl ConnectionGuardian {
    /// Open the initial session. Failure here is fatal for the process.
    pub async fn connect(
        uri: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        state: Arc<ExporterState>,
    ) -> Result<Self, ScrapeError> {
        let uri = uri.into();
        let conn = open(connector.as_ref(), &uri, policy.call_timeout)
            .await
            .map_err(|source| ScrapeError::ConnectionUnavailable {
                uri: uri.clone(),
                attempts: 1,
                source,
            })?;

        info!(uri = %uri, "Connected to hypervisor");

        Ok(Self {
            logger: StructuredLogger::new(uri.clone()),
            uri,
            connector,
            policy,
            session: RwLock::new(Arc::new(Session::new(conn, 1))),
            state,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Current session without a liveness check
    pub async fn current(&self) -> Arc<Session> {
        self.session.read().await.clone()
    }

    /// Return a live session, reconnecting if the current one is dead
    pub async fn ensure_live(&self) -> Result<Arc<Session>, ScrapeError> {
        let current = self.current().await;
        if self.probe(&current).await {
            return Ok(current);
        }

        warn!(
            uri = %self.uri,
            generation = current.generation(),
            "Hypervisor connection lost, reconnecting"
        );

        let mut slot = self.session.write().await;

        // a concurrent caller may have replaced the session while we waited
        if !Arc::ptr_eq(&*slot, &current) && self.probe(&*slot).await {
            return Ok(slot.clone());
        }

        let dead = slot.clone();
        // best effort; the old handle may already be unusable
        let _ = tokio::task::spawn_blocking(move || dead.close()).await;

        let next_generation = slot.generation() + 1;
        let mut last_error = ApiError::no_connection("no reconnect attempt made");

        for attempt in 1..=self.policy.max_attempts {
            match open(self.connector.as_ref(), &self.uri, self.policy.call_timeout).await {
                Ok(conn) => {
                    let session = Arc::new(Session::new(conn, next_generation));
                    *slot = session.clone();
                    self.state.record_reconnect();
                    self.logger
                        .log_reconnect(attempt, self.policy.max_attempts, next_generation, None);
                    return Ok(session);
                }
                Err(e) => {
                    self.logger.log_reconnect(
                        attempt,
                        self.policy.max_attempts,
                        next_generation,
                        Some(&e.to_string()),
                    );
                    last_error = e;
                    if attempt < self.policy.max_attempts {
                        let backoff = self.policy.backoff_for(attempt);
                        debug!(
                            attempt,
                            next_backoff_ms = backoff.as_millis() as u64,
                            "Waiting before next reconnect attempt"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(ScrapeError::ConnectionUnavailable {
            uri: self.uri.clone(),
            attempts: self.policy.max_attempts,
            source: last_error,
        })
    }

    /// Close the current session. Safe to call more than once.
    pub async fn shutdown(&self) {
        let session = self.current().await;
        let generation = session.generation();
        if tokio::task::spawn_blocking(move || session.close())
            .await
            .is_err()
        {
            warn!(uri = %self.uri, "Close task panicked");
        }
        info!(uri = %self.uri, generation, "Hypervisor connection closed");
    }

    async fn probe(&self, session: &Arc<Session>) -> bool {
        let session = session.clone();
        let check = tokio::task::spawn_blocking(move || session.is_alive());
        matches!(
            tokio::time::timeout(self.policy.call_timeout, check).await,
            Ok(Ok(true))
        )
    }
}

async fn open(
    connector: &dyn Connector,
    uri: &str,
    call_timeout: Duration,
) -> Result<Arc<dyn Connection>, ApiError> {
    match tokio::time::timeout(call_timeout, connector.connect(uri)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::no_connection(format!(
            "connect timed out after {}ms",
            call_timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHypervisor;

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            strategy: BackoffStrategy::Exponential,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_exponential_is_capped() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_linear() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(300));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let hv = FakeHypervisor::new();
        hv.fail_next_connects(1);

        let result = ConnectionGuardian::connect(
            "test:///default",
            hv.connector(),
            quick_policy(3),
            Arc::new(ExporterState::new()),
        )
        .await;

        assert!(matches!(
            result,
            Err(ScrapeError::ConnectionUnavailable { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_live_session_is_reused() {
        let hv = FakeHypervisor::new();
        let state = Arc::new(ExporterState::new());
        let guardian = ConnectionGuardian::connect(
            "test:///default",
            hv.connector(),
            quick_policy(3),
            state.clone(),
        )
        .await
        .unwrap();

        let first = guardian.ensure_live().await.unwrap();
        let second = guardian.ensure_live().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.generation(), 1);
        assert_eq!(hv.connect_count(), 1);
        assert_eq!(state.reconnects_total(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_loss() {
        let hv = FakeHypervisor::new();
        let state = Arc::new(ExporterState::new());
        let guardian = ConnectionGuardian::connect(
            "test:///default",
            hv.connector(),
            quick_policy(3),
            state.clone(),
        )
        .await
        .unwrap();
        let original = guardian.current().await;

        hv.drop_connections();
        hv.fail_next_connects(1);

        let session = guardian.ensure_live().await.unwrap();
        assert_eq!(session.generation(), 2);
        assert!(original.is_closed());
        assert_eq!(hv.connect_count(), 3);
        assert_eq!(state.reconnects_total(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let hv = FakeHypervisor::new();
        let guardian = ConnectionGuardian::connect(
            "test:///default",
            hv.connector(),
            quick_policy(2),
            Arc::new(ExporterState::new()),
        )
        .await
        .unwrap();

        hv.drop_connections();
        hv.fail_next_connects(10);

        let err = guardian.ensure_live().await.unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::ConnectionUnavailable { attempts: 2, .. }
        ));
        assert_eq!(hv.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_once() {
        let hv = FakeHypervisor::new();
        let guardian = ConnectionGuardian::connect(
            "test:///default",
            hv.connector(),
            quick_policy(1),
            Arc::new(ExporterState::new()),
        )
        .await
        .unwrap();

        guardian.shutdown().await;
        guardian.shutdown().await;

        assert!(guardian.current().await.is_closed());
        assert_eq!(hv.close_count(), 1);
    }
}
