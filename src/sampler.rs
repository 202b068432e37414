//! Sampling loop.
//!
//! One cycle runs the storage probe, publishes its point to every sink, then
//! does the same for the speed-test probe. Cycles are strictly sequential and
//! separated by a fixed sleep.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::time::timeout;
use tracing::Instrument;

use crate::measurement::Measurement;
use crate::probe::{Probe, ProbeError};
use crate::sink::{DEFAULT_SINK_TIMEOUT, SinkFailure, SinkSet};
use crate::tags::GlobalTags;

/// Default pause between cycles (60 seconds).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum allowed pause between cycles (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_sink_timeout() -> Duration {
    DEFAULT_SINK_TIMEOUT
}

/// What to do when the storage probe fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and go on with the cycle.
    #[default]
    Continue,
    /// Stop sampling with an error.
    Abort,
}

/// Sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Pause between cycles (default: 60s, minimum: 1s).
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on a single probe run. Unbounded when unset.
    #[serde(default, with = "humantime_serde")]
    pub probe_timeout: Option<Duration>,

    /// Upper bound on a single sink publish (default: 10s).
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub sink_timeout: Duration,

    /// Storage probe failure handling (default: continue).
    #[serde(default)]
    pub on_storage_failure: FailurePolicy,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            probe_timeout: None,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            on_storage_failure: FailurePolicy::Continue,
        }
    }
}

impl SamplerConfig {
    /// Set the cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the probe timeout.
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = Some(probe_timeout);
        self
    }

    /// Set the storage failure policy.
    pub fn with_storage_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_storage_failure = policy;
        self
    }
}

/// Errors that end the sampling loop.
#[derive(Debug, Error, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SamplerError {
    /// Storage probe failed under [`FailurePolicy::Abort`].
    #[error("storage probe failed: {0}")]
    StorageProbe(#[source] ProbeError),
}

impl SamplerError {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

/// Outcome of one probe phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// The probe succeeded and its point was offered to every sink.
    Published {
        measurement: Measurement,
        delivered: Vec<String>,
        failed: Vec<SinkFailure>,
    },
    /// The probe failed; nothing was published.
    ProbeFailed { kind: String, error: String },
}

impl PhaseOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

/// Outcome of one full cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub storage: PhaseOutcome,
    pub speedtest: PhaseOutcome,
}

/// Runs both probes in a loop and publishes their results.
pub struct Sampler {
    storage: Box<dyn Probe>,
    speedtest: Box<dyn Probe>,
    sinks: SinkSet,
    globals: GlobalTags,
    config: SamplerConfig,
}

/// Parent of every phase span for the lifetime of the loop.
fn root_span() -> tracing::Span {
    tracing::info_span!("sampler")
}

impl Sampler {
    /// Create a sampler. The interval is clamped to [`MIN_INTERVAL`].
    pub fn new(
        storage: Box<dyn Probe>,
        speedtest: Box<dyn Probe>,
        sinks: SinkSet,
        globals: GlobalTags,
        mut config: SamplerConfig,
    ) -> Self {
        if config.interval < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            config.interval = MIN_INTERVAL;
        }
        let sinks = sinks.with_timeout(config.sink_timeout);

        Self {
            storage,
            speedtest,
            sinks,
            globals,
            config,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Run cycles forever.
    ///
    /// Returns only when the storage probe fails under
    /// [`FailurePolicy::Abort`].
    pub async fn run(&self) -> Result<(), SamplerError> {
        tracing::info!(
            interval = ?self.config.interval,
            sinks = ?self.sinks.names(),
            hostname = %self.globals.hostname(),
            "Sampler started"
        );

        self.cycles().instrument(root_span()).await
    }

    async fn cycles(&self) -> Result<(), SamplerError> {
        let mut cycle: u64 = 1;
        loop {
            self.run_cycle(cycle).await?;
            tracing::info!("Sleeping for {} seconds", self.config.interval.as_secs());
            tokio::time::sleep(self.config.interval).await;
            cycle += 1;
        }
    }

    /// Run a single cycle under the root `sampler` span.
    pub async fn run_once(&self) -> Result<CycleReport, SamplerError> {
        self.run_cycle(1).instrument(root_span()).await
    }

    /// Run one cycle: storage phase, then speed-test phase.
    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport, SamplerError> {
        let storage = self
            .phase(self.storage.as_ref())
            .instrument(tracing::info_span!("storage_phase", cycle))
            .await;

        let storage = match storage {
            Ok(outcome) => outcome,
            Err(e) if self.config.on_storage_failure == FailurePolicy::Abort => {
                return Err(SamplerError::StorageProbe(e));
            }
            Err(e) => PhaseOutcome::ProbeFailed {
                kind: e.kind().to_string(),
                error: e.to_string(),
            },
        };

        let speedtest = match self
            .phase(self.speedtest.as_ref())
            .instrument(tracing::info_span!("speedtest_phase", cycle))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => PhaseOutcome::ProbeFailed {
                kind: e.kind().to_string(),
                error: e.to_string(),
            },
        };

        Ok(CycleReport {
            cycle,
            storage,
            speedtest,
        })
    }

    /// Measure with one probe and publish the result.
    ///
    /// Logs exactly one line for the probe: its summary on success, the
    /// failure reason otherwise.
    async fn phase(&self, probe: &dyn Probe) -> Result<PhaseOutcome, ProbeError> {
        let measured = match self.config.probe_timeout {
            Some(limit) => match timeout(limit, probe.measure()).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(limit)),
            },
            None => probe.measure().await,
        };

        let measurement = match measured {
            Ok(measurement) => measurement,
            Err(e) => {
                tracing::error!(probe = %probe.name(), error.kind = %e.kind(), error = %e, "Probe failed");
                return Err(e);
            }
        };

        tracing::info!(probe = %probe.name(), measurement = %measurement.name(), "{}", measurement.summary());

        let point = measurement.to_point(&self.globals);
        let report = self.sinks.publish(&point).await;

        Ok(PhaseOutcome::Published {
            measurement,
            delivered: report.delivered,
            failed: report.failed,
        })
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("storage", &self.storage.name())
            .field("speedtest", &self.speedtest.name())
            .field("sinks", &self.sinks)
            .field("globals", &self.globals)
            .field("config", &self.config)
            .finish()
    }
}
