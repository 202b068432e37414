//! Configuration errors and parsing helpers.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use strum_macros::AsRefStr;
use thiserror::Error;

use crate::probe::ProbeError;
use crate::sink::SinkError;
use crate::telemetry::TelemetryError;

/// Configuration error types.
#[derive(Debug, Error, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A probe section is invalid.
    #[error("invalid probe config: {0}")]
    Probe(#[from] ProbeError),

    /// A sink section is invalid.
    #[error("invalid sink config: {0}")]
    Sink(#[from] SinkError),

    /// The tracing section is invalid.
    #[error("invalid tracing config: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Any other invalid value.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `2h30m`, `1d`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use netpulse::config::parse_duration;
///
/// assert_eq!(parse_duration("90s").unwrap().as_secs(), 90);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// As in the shell, the default also applies when the variable is set but
/// empty. An unset variable without a default expands to nothing.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &Captures| {
            let value = std::env::var(&caps[1]).ok().filter(|v| !v.is_empty());
            match (value, caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => String::new(),
            }
        })
        .into_owned()
}
