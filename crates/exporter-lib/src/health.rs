//! Health check infrastructure for the exporter
//!
//! Tracks the state of the hypervisor connection and of the collectors as
//! observed by the most recent scrape, and answers liveness and readiness
//! probes from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Partially working, e.g. some collectors failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub uptime_seconds: i64,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of the readiness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const CONNECTION: &str = "libvirt_connection";
    pub const COLLECTOR: &str = "collector";
}

/// Shared, cloneable health state
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(BTreeMap::new())),
            ready: Arc::new(RwLock::new(false)),
            started_at: chrono::Utc::now(),
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record which collectors failed during a completed scrape
    pub async fn record_collectors(&self, failed: &[&str]) {
        if failed.is_empty() {
            self.set_healthy(components::COLLECTOR).await;
        } else {
            self.set_degraded(
                components::COLLECTOR,
                format!("failed collectors: {}", failed.join(", ")),
            )
            .await;
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            uptime_seconds: (chrono::Utc::now() - self.started_at).num_seconds(),
            components,
        }
    }

    /// Ready once the initial connection is established and while the
    /// connection component is not unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Exporter not yet initialized".to_string()),
            };
        }

        let components = self.components.read().await;
        match components.get(components::CONNECTION) {
            Some(conn) if conn.status == ComponentStatus::Unhealthy => ReadinessResponse {
                ready: false,
                reason: Some(
                    conn.message
                        .clone()
                        .unwrap_or_else(|| "Hypervisor connection unavailable".to_string()),
                ),
            },
            _ => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(health.uptime_seconds >= 0);
    }

    #[tokio::test]
    async fn test_failed_collectors_degrade_health() {
        let registry = HealthRegistry::new();
        registry.set_healthy(components::CONNECTION).await;
        registry.record_collectors(&["memory", "disk"]).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        let message = health.components[components::COLLECTOR].message.clone().unwrap();
        assert!(message.contains("memory, disk"));

        registry.record_collectors(&[]).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_wins_over_degraded() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::COLLECTOR, "slow").await;
        registry.set_unhealthy(components::CONNECTION, "refused").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_response_json_shape() {
        let registry = HealthRegistry::new();
        registry.set_healthy(components::CONNECTION).await;
        registry.set_degraded(components::COLLECTOR, "failed collectors: disk").await;

        let json = serde_json::to_value(registry.health().await).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"]["libvirt_connection"]["status"], "healthy");
        // healthy components carry no message field
        assert!(json["components"]["libvirt_connection"].get("message").is_none());
        assert_eq!(
            json["components"]["collector"]["message"],
            "failed collectors: disk"
        );
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_follows_connection() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.set_healthy(components::CONNECTION).await;
        assert!(registry.readiness().await.ready);

        // collector trouble alone does not take the exporter out of rotation
        registry.set_degraded(components::COLLECTOR, "memory failed").await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::CONNECTION, "connection lost")
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("connection lost"));
    }
}
