//! Netpulse - Network Throughput Sampler
//!
//! This crate periodically measures network throughput and latency against an
//! S3-compatible object store and a public speed-test server, then publishes
//! every result to InfluxDB, OpenTelemetry metrics and Logstash. It can be used
//! as a library, or run as a standalone binary with the `netpulse` executable.
//!
//! # Architecture
//!
//! - **Probes**: One network measurement each ([`probe`])
//! - **Measurements**: Typed probe results turned into tagged points ([`measurement`], [`tags`])
//! - **Sinks**: Best-effort publication to each backend ([`sink`])
//! - **Sampler**: Sequential measure, publish and sleep loop ([`sampler`])
//! - **Presentation**: Prometheus scrape endpoint ([`server`])
//!
//! # Example
//!
//! ```rust,ignore
//! use netpulse::{GlobalTags, Sampler, SamplerConfig, SinkSet};
//! use netpulse::probe::{speedtest::SpeedtestProbe, storage::StorageProbe};
//! use netpulse::sink::otel::OtelSink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sampler = Sampler::new(
//!         Box::new(StorageProbe::new(storage_config)?),
//!         Box::new(SpeedtestProbe::new(Default::default())?),
//!         SinkSet::new().with_sink(OtelSink::global()),
//!         GlobalTags::detect(Default::default()),
//!         SamplerConfig::default(),
//!     );
//!     sampler.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod measurement;
pub mod probe;
pub mod sampler;
pub mod server;
pub mod sink;
pub mod tags;
pub mod telemetry;

pub use config::{AppConfig, ConfigError};
pub use measurement::{Measurement, MeasurementKind, Point};
pub use probe::{Probe, ProbeError};
pub use sampler::{CycleReport, FailurePolicy, PhaseOutcome, Sampler, SamplerConfig, SamplerError};
pub use sink::{DispatchReport, Sink, SinkError, SinkSet};
pub use tags::{GlobalTags, Tags};
pub use telemetry::{MetricsHandles, TelemetryError, TraceExportConfig};
