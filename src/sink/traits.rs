//! Core sink trait and error types.

use std::time::Duration;

use strum_macros::AsRefStr;
use thiserror::Error;

use crate::measurement::Point;

/// Errors that can occur while publishing a point.
#[derive(Debug, Error, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SinkError {
    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("rejected with HTTP status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The sink cannot accept points right now (queue full or closed).
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Failed to encode the point.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Publishing did not finish in time.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl SinkError {
    /// Stable, machine-readable error kind for structured logs.
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// A telemetry backend that accepts published points.
///
/// Implementations decide their own wire representation. Publishing is
/// best-effort: the caller logs a returned error and moves on, so a sink must
/// never panic on backend failure.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Sink identity used in logs and dispatch reports.
    fn name(&self) -> &str;

    /// Publish one point.
    async fn publish(&self, point: &Point) -> Result<(), SinkError>;
}
