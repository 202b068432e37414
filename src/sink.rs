//! Sink Layer
//!
//! Telemetry backends that receive every published point.
//!
//! # Sinks
//!
//! - [`influx::InfluxSink`]: InfluxDB v2 line protocol over HTTP
//! - [`otel::OtelSink`]: OpenTelemetry gauges and histograms
//! - [`logstash::LogstashSink`]: JSON events over a Logstash TCP input
//!
//! [`SinkSet`] fans one point out to all of them with per-sink failure
//! isolation.

mod dispatch;
pub mod influx;
pub mod logstash;
pub mod otel;
mod traits;

pub use dispatch::{DEFAULT_SINK_TIMEOUT, DispatchReport, SinkFailure, SinkSet};
pub use traits::{Sink, SinkError};
