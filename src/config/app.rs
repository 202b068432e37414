//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::probe::speedtest::SpeedtestConfig;
use crate::probe::storage::StorageProbeConfig;
use crate::sampler::SamplerConfig;
use crate::sink::influx::InfluxConfig;
use crate::sink::logstash::LogstashConfig;
use crate::tags::Tags;
use crate::telemetry::TraceExportConfig;

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default metrics server port.
pub const DEFAULT_METRICS_PORT: u16 = 8000;

fn default_true() -> bool {
    true
}

// =============================================================================
// Metrics Server Configuration
// =============================================================================

/// Prometheus scrape server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsServerConfig {
    /// Serve `/metrics` at all (default: true).
    pub enabled: bool,

    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8000).
    pub port: u16,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_METRICS_PORT,
        }
    }
}

// =============================================================================
// Probe & Sink Configuration
// =============================================================================

/// Probe configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbesConfig {
    pub storage: StorageProbeConfig,

    #[serde(default)]
    pub speedtest: SpeedtestConfig,
}

/// OpenTelemetry sink switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Sink configurations. A missing section disables that sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub influxdb: Option<InfluxConfig>,
    pub otel: OtelConfig,
    pub logstash: Option<LogstashConfig>,
}

impl SinksConfig {
    /// Number of enabled sinks.
    pub fn enabled_count(&self) -> usize {
        usize::from(self.influxdb.is_some())
            + usize::from(self.otel.enabled)
            + usize::from(self.logstash.is_some())
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Sampling loop configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Static tags added to every published point.
    #[serde(default)]
    pub global_tags: Tags,

    /// Hostname override. Detected from the system when unset.
    #[serde(default)]
    pub hostname: Option<String>,

    pub probes: ProbesConfig,

    #[serde(default)]
    pub sinks: SinksConfig,

    #[serde(default)]
    pub metrics_server: MetricsServerConfig,

    /// OTLP span export. Disabled when absent.
    #[serde(default)]
    pub tracing: Option<TraceExportConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_server.enabled {
            self.metrics_server.bind.parse::<IpAddr>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "invalid metrics_server bind address: '{}'",
                    self.metrics_server.bind
                ))
            })?;

            if self.metrics_server.port == 0 {
                return Err(ConfigError::ValidationError(
                    "metrics_server port must be non-zero".to_string(),
                ));
            }
        }

        if self.sampler.sink_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "sampler sink_timeout must be positive".to_string(),
            ));
        }
        if self.sampler.probe_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationError(
                "sampler probe_timeout must be positive".to_string(),
            ));
        }

        if self.hostname.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ValidationError(
                "hostname override cannot be empty".to_string(),
            ));
        }
        if let Some(key) = self.global_tags.keys().find(|k| k.is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "global tag key cannot be empty (value: '{}')",
                self.global_tags[key]
            )));
        }
        let has_control = |s: &str| s.chars().any(char::is_control);
        if let Some((key, value)) = self
            .global_tags
            .iter()
            .find(|(k, v)| has_control(k) || has_control(v))
        {
            return Err(ConfigError::ValidationError(format!(
                "global tag {key:?}: {value:?} contains control characters"
            )));
        }
        if self.hostname.as_deref().is_some_and(has_control) {
            return Err(ConfigError::ValidationError(
                "hostname override contains control characters".to_string(),
            ));
        }

        self.probes.storage.validate()?;
        self.probes.speedtest.validate()?;

        if let Some(influx) = &self.sinks.influxdb {
            influx.validate()?;
        }
        if let Some(logstash) = &self.sinks.logstash {
            logstash.validate()?;
        }
        if let Some(traces) = &self.tracing {
            traces.validate()?;
        }

        Ok(())
    }
}
