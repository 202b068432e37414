//! Core probe trait and error types.

use std::time::Duration;

use strum_macros::AsRefStr;
use thiserror::Error;

use crate::measurement::Measurement;

/// Bytes per megabyte as reported in every `*_speed_mbs` field.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Errors that can occur while running a probe.
#[derive(Debug, Error, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProbeError {
    /// Transport-level HTTP failure (DNS, connect, TLS, body read).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The remote service answered with an unexpected status.
    #[error("{operation} failed with HTTP status {status}")]
    Status { operation: &'static str, status: u16 },

    /// Server discovery found nothing reachable.
    #[error("no reachable speed-test server")]
    NoServer,

    /// The remote service returned something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The probe did not finish within the configured bound.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl ProbeError {
    /// Stable, machine-readable error kind for structured logs.
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// A network measurement producing one [`Measurement`] per call.
///
/// Probes own all of their network I/O and unit conversions. A call either
/// returns a fully populated measurement or fails; there is no partial
/// result. Probes do not retry.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Identifier used in logs and spans.
    fn name(&self) -> &str;

    /// Run the probe once.
    async fn measure(&self) -> Result<Measurement, ProbeError>;
}

/// Convert a byte count transferred over `elapsed` to MB/s.
///
/// A zero duration yields `0.0` so the result is always finite and
/// non-negative.
pub fn throughput_mbs(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / BYTES_PER_MB
}
