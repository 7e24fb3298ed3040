//! Exporter configuration
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. YAML file (`--config.file`, else `./config.yaml` or
//!    `/etc/libvirt-exporter/config.yaml` when present)
//! 3. environment (`LIBVIRT_EXPORTER_<SECTION>__<KEY>`)
//! 4. command-line flags

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use exporter_lib::collector::{normalize_category, CollectorRegistry, CATEGORIES};
use exporter_lib::{BackoffStrategy, CollectionConfig, ExporterState, ReconnectPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "LIBVIRT_EXPORTER";
const DEFAULT_CONFIG_PATHS: &[&str] = &["config.yaml", "/etc/libvirt-exporter/config.yaml"];

/// Paths served by the exporter itself
const RESERVED_PATHS: &[&str] = &["/", "/healthz", "/readyz"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Prometheus exporter for libvirt-managed virtual machines
#[derive(Debug, Default, Parser)]
#[command(name = "libvirt-exporter")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(long = "config.file")]
    pub config_file: Option<PathBuf>,

    /// Hypervisor connection URI
    #[arg(long = "libvirt.uri")]
    pub libvirt_uri: Option<String>,

    /// Address to listen on for HTTP requests
    #[arg(long = "web.listen-address")]
    pub listen_address: Option<String>,

    /// Path under which metrics are exposed
    #[arg(long = "web.telemetry-path")]
    pub telemetry_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log.level")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long = "log.format", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Print the metric families as JSON and exit
    #[arg(long)]
    pub print_metrics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Configuration validation failures
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("invalid libvirt URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid listen address {0:?}, expected host:port")]
    InvalidListenAddress(String),

    #[error("telemetry path {0:?} must start with '/'")]
    RelativeTelemetryPath(String),

    #[error("telemetry path {0:?} is reserved")]
    ReservedTelemetryPath(String),

    #[error("unknown log level {0:?}")]
    UnknownLogLevel(String),

    #[error("unknown metrics category {name:?}, expected one of: {expected}")]
    UnknownCategory { name: String, expected: String },

    #[error("invalid extra label name {0:?}")]
    InvalidLabelName(String),

    #[error("extra label {0:?} collides with an exported label")]
    ReservedLabelName(String),

    #[error("max_backoff_ms must not be below reconnect_backoff_ms")]
    BackoffRange,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibvirtSection {
    pub uri: String,
    /// Upper bound for connect and liveness calls (seconds)
    pub timeout: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_policy: BackoffStrategy,
}

impl Default for LibvirtSection {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            timeout: 30,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 5_000,
            backoff_policy: BackoffStrategy::Exponential,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub listen_address: String,
    pub telemetry_path: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9177".to_string(),
            telemetry_path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionSection {
    /// Expected scrape interval (seconds)
    pub interval: u64,
    /// Per-unit timeout (seconds)
    pub timeout: u64,
    pub max_concurrent: usize,
}

impl Default for CollectionSection {
    fn default() -> Self {
        Self {
            interval: 15,
            timeout: 10,
            max_concurrent: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: Vec<String>,
    pub extra_labels: BTreeMap<String, String>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: CATEGORIES.iter().map(|c| c.to_string()).collect(),
            extra_labels: BTreeMap::new(),
        }
    }
}

/// Exporter configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub libvirt: LibvirtSection,
    pub web: WebSection,
    pub logging: LoggingSection,
    pub collection: CollectionSection,
    pub metrics: MetricsSection,
}

impl ExporterConfig {
    /// Load and validate configuration from every source
    pub fn load(cli: &Cli) -> Result<Self> {
        let defaults: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
        Self::load_with_search_paths(cli, &defaults)
    }

    /// Like [`ExporterConfig::load`], looking for an implicit config file in
    /// `search_paths` instead of the default locations
    pub fn load_with_search_paths(cli: &Cli, search_paths: &[PathBuf]) -> Result<Self> {
        let mut builder = config::Config::builder();

        match &cli.config_file {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path.as_path())
                        .format(config::FileFormat::Yaml)
                        .required(true),
                );
            }
            None => {
                if let Some(path) = search_paths.iter().find(|p| p.is_file()) {
                    builder = builder.add_source(
                        config::File::from(path.as_path()).format(config::FileFormat::Yaml),
                    );
                }
            }
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("metrics.enabled"),
            )
            .set_override_option("libvirt.uri", cli.libvirt_uri.clone())?
            .set_override_option("web.listen_address", cli.listen_address.clone())?
            .set_override_option("web.telemetry_path", cli.telemetry_path.clone())?
            .set_override_option("logging.level", cli.log_level.clone())?
            .set_override_option("logging.format", cli.log_format.map(LogFormat::as_str))?;

        let config: ExporterConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a single file, ignoring other sources except defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let cli = Cli {
            config_file: Some(path.to_path_buf()),
            ..Cli::default()
        };
        Self::load_with_search_paths(&cli, &[])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let libvirt = &self.libvirt;
        if libvirt.uri.trim().is_empty() {
            return Err(ConfigError::Empty { field: "libvirt.uri" });
        }
        url::Url::parse(&libvirt.uri).map_err(|e| ConfigError::InvalidUri {
            uri: libvirt.uri.clone(),
            reason: e.to_string(),
        })?;
        positive("libvirt.timeout", libvirt.timeout)?;
        positive("libvirt.reconnect_attempts", u64::from(libvirt.reconnect_attempts))?;
        positive("libvirt.reconnect_backoff_ms", libvirt.reconnect_backoff_ms)?;
        if libvirt.max_backoff_ms < libvirt.reconnect_backoff_ms {
            return Err(ConfigError::BackoffRange);
        }

        let web = &self.web;
        if web.listen_address.trim().is_empty() {
            return Err(ConfigError::Empty { field: "web.listen_address" });
        }
        let valid_port = web
            .listen_address
            .rsplit_once(':')
            .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
        if !valid_port {
            return Err(ConfigError::InvalidListenAddress(web.listen_address.clone()));
        }
        if web.telemetry_path.is_empty() {
            return Err(ConfigError::Empty { field: "web.telemetry_path" });
        }
        if !web.telemetry_path.starts_with('/') {
            return Err(ConfigError::RelativeTelemetryPath(web.telemetry_path.clone()));
        }
        if RESERVED_PATHS.contains(&web.telemetry_path.as_str()) {
            return Err(ConfigError::ReservedTelemetryPath(web.telemetry_path.clone()));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::UnknownLogLevel(self.logging.level.clone()));
        }

        positive("collection.interval", self.collection.interval)?;
        positive("collection.timeout", self.collection.timeout)?;
        positive("collection.max_concurrent", self.collection.max_concurrent as u64)?;

        for name in &self.metrics.enabled {
            if normalize_category(name).is_none() {
                return Err(ConfigError::UnknownCategory {
                    name: name.clone(),
                    expected: CATEGORIES.join(", "),
                });
            }
        }

        let exported = exported_label_names();
        for name in self.metrics.extra_labels.keys() {
            if !is_valid_label_name(name) {
                return Err(ConfigError::InvalidLabelName(name.clone()));
            }
            if exported.contains(&name.as_str()) {
                return Err(ConfigError::ReservedLabelName(name.clone()));
            }
        }

        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.libvirt.reconnect_attempts,
            initial_backoff: Duration::from_millis(self.libvirt.reconnect_backoff_ms),
            max_backoff: Duration::from_millis(self.libvirt.max_backoff_ms),
            strategy: self.libvirt.backoff_policy,
            call_timeout: Duration::from_secs(self.libvirt.timeout),
        }
    }

    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            timeout: Duration::from_secs(self.collection.timeout),
            max_concurrency: self.collection.max_concurrent,
            interval: Duration::from_secs(self.collection.interval),
        }
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(())
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    first_ok
        && !name.starts_with("__")
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Label names used by any built-in metric family
fn exported_label_names() -> Vec<&'static str> {
    let registry = CollectorRegistry::with_defaults(Arc::new(ExporterState::new()));
    let mut names: Vec<&'static str> = registry
        .describe()
        .iter()
        .flat_map(|desc| desc.labels.iter().copied())
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::load_with_search_paths(&Cli::default(), &[]).unwrap();
        assert_eq!(config.libvirt.uri, "qemu:///system");
        assert_eq!(config.web.listen_address, "0.0.0.0:9177");
        assert_eq!(config.web.telemetry_path, "/metrics");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.collection.max_concurrent, 10);
        assert_eq!(config.metrics.enabled.len(), CATEGORIES.len());

        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.collection_config().interval, Duration::from_secs(15));
    }

    #[test]
    fn test_load_from_file() {
        let file = yaml(
            r#"
libvirt:
  uri: "qemu+ssh://root@hv01/system"
  reconnect_attempts: 5
  backoff_policy: linear
web:
  listen_address: "127.0.0.1:9300"
collection:
  max_concurrent: 4
metrics:
  enabled: [cpu, vm_memory]
  extra_labels:
    site: fra1
"#,
        );

        let config = ExporterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.libvirt.uri, "qemu+ssh://root@hv01/system");
        assert_eq!(config.libvirt.reconnect_attempts, 5);
        assert_eq!(config.libvirt.backoff_policy, BackoffStrategy::Linear);
        assert_eq!(config.web.listen_address, "127.0.0.1:9300");
        // untouched keys keep their defaults
        assert_eq!(config.web.telemetry_path, "/metrics");
        assert_eq!(config.collection.max_concurrent, 4);
        assert_eq!(config.metrics.enabled, vec!["cpu", "vm_memory"]);
        assert_eq!(config.metrics.extra_labels["site"], "fra1");
    }

    #[test]
    fn test_flags_override_file() {
        let file = yaml("libvirt:\n  uri: \"qemu:///session\"\nlogging:\n  format: json\n");
        let cli = Cli {
            config_file: Some(file.path().to_path_buf()),
            libvirt_uri: Some("test:///default".to_string()),
            telemetry_path: Some("/probe".to_string()),
            ..Cli::default()
        };

        let config = ExporterConfig::load_with_search_paths(&cli, &[]).unwrap();
        assert_eq!(config.libvirt.uri, "test:///default");
        assert_eq!(config.web.telemetry_path, "/probe");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_implicit_file_from_search_path() {
        let file = yaml("web:\n  listen_address: \"0.0.0.0:9999\"\n");
        let missing = PathBuf::from("/nonexistent/libvirt-exporter.yaml");

        let config = ExporterConfig::load_with_search_paths(
            &Cli::default(),
            &[missing, file.path().to_path_buf()],
        )
        .unwrap();
        assert_eq!(config.web.listen_address, "0.0.0.0:9999");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let cli = Cli {
            config_file: Some(PathBuf::from("/nonexistent/libvirt-exporter.yaml")),
            ..Cli::default()
        };
        assert!(ExporterConfig::load_with_search_paths(&cli, &[]).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ExporterConfig::default();
        config.libvirt.uri = String::new();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty { field: "libvirt.uri" })
        );

        let mut config = ExporterConfig::default();
        config.libvirt.uri = "not a uri".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUri { .. })));

        let mut config = ExporterConfig::default();
        config.web.telemetry_path = "metrics".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativeTelemetryPath(_))
        ));

        let mut config = ExporterConfig::default();
        config.web.telemetry_path = "/healthz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedTelemetryPath(_))
        ));

        let mut config = ExporterConfig::default();
        config.web.listen_address = "9177".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidListenAddress(_))
        ));

        let mut config = ExporterConfig::default();
        config.collection.max_concurrent = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "collection.max_concurrent"
            })
        );

        let mut config = ExporterConfig::default();
        config.collection.interval = 0;
        assert!(config.validate().is_err());

        let mut config = ExporterConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLogLevel(_))));

        let mut config = ExporterConfig::default();
        config.libvirt.max_backoff_ms = 100;
        assert_eq!(config.validate(), Err(ConfigError::BackoffRange));
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut config = ExporterConfig::default();
        config.metrics.enabled = vec!["cpu".to_string(), "gpu".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCategory { name, .. }) if name == "gpu"
        ));
    }

    #[test]
    fn test_extra_label_names() {
        let mut config = ExporterConfig::default();
        config
            .metrics
            .extra_labels
            .insert("domain".to_string(), "x".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::ReservedLabelName("domain".to_string()))
        );

        let mut config = ExporterConfig::default();
        config
            .metrics
            .extra_labels
            .insert("1site".to_string(), "x".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLabelName(_))));

        assert!(is_valid_label_name("site"));
        assert!(is_valid_label_name("_zone"));
        assert!(!is_valid_label_name("__name__"));
        assert!(!is_valid_label_name("a-b"));
    }
}
