//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Sampler settings (interval, timeouts, storage failure policy)
//! - Global tags and hostname override
//! - Probe settings (object storage, speed test)
//! - Sink settings (InfluxDB, OpenTelemetry, Logstash)
//! - Metrics server settings (bind address, port)

mod app;
mod validation;

pub use app::{AppConfig, MetricsServerConfig, OtelConfig, ProbesConfig, SinksConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration};

// Re-export constants
pub use app::DEFAULT_METRICS_PORT;
