//! Probe Layer
//!
//! Network measurements run once per sampling cycle. Each probe performs its
//! own I/O and unit conversion and returns a fully populated
//! [`Measurement`](crate::measurement::Measurement) or a [`ProbeError`].
//!
//! # Probes
//!
//! - [`storage::StorageProbe`]: S3-compatible object upload/download throughput
//! - [`speedtest::SpeedtestProbe`]: speedtest.net latency and throughput

pub mod speedtest;
pub mod storage;
mod traits;

pub use traits::{BYTES_PER_MB, Probe, ProbeError, throughput_mbs};
