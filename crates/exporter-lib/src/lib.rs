//! Collection engine for the libvirt Prometheus exporter
//!
//! This crate provides the core functionality for:
//! - Hypervisor connection lifecycle with bounded reconnects
//! - Domain enumeration and device discovery
//! - Per-category metric collectors and the scrape orchestrator
//! - Prometheus text exposition
//! - Health checks and observability

pub mod collector;
pub mod connection;
pub mod domain;
pub mod error;
pub mod exposition;
pub mod health;
pub mod hypervisor;
pub mod models;
pub mod observability;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use collector::{CollectionConfig, CollectorRegistry, Orchestrator, OrchestratorBuilder};
pub use connection::{BackoffStrategy, ConnectionGuardian, ReconnectPolicy, Session};
pub use error::{ApiError, ApiErrorCode, CollectorError, ScrapeError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ExporterState, StructuredLogger};
