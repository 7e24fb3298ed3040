//! Libvirt Exporter - Prometheus metrics for libvirt-managed virtual machines
//!
//! Connects to one hypervisor, runs a scrape on every request to the
//! telemetry path and serves health and readiness probes.

use anyhow::{Context, Result};
use clap::Parser;
use exporter_lib::{
    collector::CollectorRegistry,
    health::{components, HealthRegistry},
    hypervisor::libvirt::LibvirtConnector,
    ConnectionGuardian, ExporterState, Orchestrator, StructuredLogger,
};
use libvirt_exporter::{
    api,
    config::{Cli, ExporterConfig, LogFormat, LoggingSection},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ExporterConfig::load(&cli)?;

    init_tracing(&config.logging);

    if cli.print_metrics {
        return print_metrics(&config);
    }

    info!(uri = %config.libvirt.uri, "Starting libvirt-exporter");

    let state = Arc::new(ExporterState::new());
    let health_registry = HealthRegistry::new();
    let logger = StructuredLogger::new(config.libvirt.uri.clone());

    // an unreachable hypervisor at startup is fatal
    let guardian = ConnectionGuardian::connect(
        config.libvirt.uri.clone(),
        Arc::new(LibvirtConnector),
        config.reconnect_policy(),
        state.clone(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.libvirt.uri))?;
    let guardian = Arc::new(guardian);

    health_registry.set_healthy(components::CONNECTION).await;
    health_registry.set_healthy(components::COLLECTOR).await;

    let orchestrator = Orchestrator::builder()
        .guardian(guardian.clone())
        .state(state)
        .health(health_registry.clone())
        .enabled_categories(config.metrics.enabled.clone())
        .config(config.collection_config())
        .build()?;

    let app_state = Arc::new(
        api::AppState::new(
            Arc::new(orchestrator),
            health_registry.clone(),
            config.web.telemetry_path.clone(),
        )
        .with_extra_labels(config.metrics.extra_labels.clone()),
    );

    health_registry.set_ready(true).await;
    logger.log_startup(
        EXPORTER_VERSION,
        &config.web.listen_address,
        &config.web.telemetry_path,
    );

    let shutdown_logger = logger.clone();
    api::serve(&config.web.listen_address, app_state, async move {
        let reason = shutdown_signal().await;
        shutdown_logger.log_shutdown(reason);
    })
    .await?;

    health_registry.set_ready(false).await;
    guardian.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing(logging: &LoggingSection) {
    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

fn print_metrics(config: &ExporterConfig) -> Result<()> {
    let mut registry = CollectorRegistry::with_defaults(Arc::new(ExporterState::new()));
    registry.retain_enabled(config.metrics.enabled.as_slice());

    let families = serde_json::to_string_pretty(&registry.describe())
        .context("Failed to serialize metric descriptors")?;
    println!("{families}");
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
