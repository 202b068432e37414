//! Measurement records produced by probes and the points handed to sinks.
//!
//! A probe returns one fully populated [`Measurement`]. The sampler turns it
//! into a [`Point`] by merging the global tags, then publishes that point to
//! every sink. Points carry no timestamp: identical probe results always yield
//! identical points, and each sink stamps the write time itself.

use std::collections::BTreeMap;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::tags::{GlobalTags, Tags};

/// Measurement name used for object-storage throughput points.
pub const STORAGE_MEASUREMENT: &str = "wasabi";

/// Measurement name used for public speed-test points.
pub const SPEEDTEST_MEASUREMENT: &str = "ookla";

/// Numeric fields keyed by static field name.
pub type Fields = BTreeMap<&'static str, f64>;

/// Field names shared by both measurement kinds.
pub mod field {
    pub const UPLOAD_SPEED_MBS: &str = "upload_speed_mbs";
    pub const DOWNLOAD_SPEED_MBS: &str = "download_speed_mbs";
    pub const UPLOAD_TIME_S: &str = "upload_time_s";
    pub const DOWNLOAD_TIME_S: &str = "download_time_s";
    pub const PING_MS: &str = "ping_ms";
}

/// Which probe produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum MeasurementKind {
    Storage,
    Speedtest,
}

/// Result of one object-storage throughput probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageMeasurement {
    /// Bucket the test object was written to.
    pub bucket: String,
    /// S3-compatible endpoint URL.
    pub endpoint: String,
    pub download_speed_mbs: f64,
    pub upload_speed_mbs: f64,
    pub download_time_s: f64,
    pub upload_time_s: f64,
}

/// Result of one public speed-test probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedtestMeasurement {
    /// Name of the selected test server (usually its city).
    pub server_name: String,
    /// Country of the selected test server.
    pub country: String,
    pub download_speed_mbs: f64,
    pub upload_speed_mbs: f64,
    /// Round-trip latency to the selected server.
    pub ping_ms: f64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Geographic position of a speed-test server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// One probe result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Measurement {
    Storage(StorageMeasurement),
    Speedtest(SpeedtestMeasurement),
}

impl Measurement {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Self::Storage(_) => MeasurementKind::Storage,
            Self::Speedtest(_) => MeasurementKind::Speedtest,
        }
    }

    /// Measurement name as seen by every sink.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Storage(_) => STORAGE_MEASUREMENT,
            Self::Speedtest(_) => SPEEDTEST_MEASUREMENT,
        }
    }

    /// Record-specific tags, before the global set is merged in.
    pub fn tags(&self) -> Tags {
        let pairs: [(&str, &str); 2] = match self {
            Self::Storage(m) => [("endpoint", m.endpoint.as_str()), ("bucket", m.bucket.as_str())],
            Self::Speedtest(m) => [
                ("server_name", m.server_name.as_str()),
                ("country", m.country.as_str()),
            ],
        };
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn fields(&self) -> Fields {
        match self {
            Self::Storage(m) => Fields::from([
                (field::UPLOAD_SPEED_MBS, m.upload_speed_mbs),
                (field::DOWNLOAD_SPEED_MBS, m.download_speed_mbs),
                (field::UPLOAD_TIME_S, m.upload_time_s),
                (field::DOWNLOAD_TIME_S, m.download_time_s),
            ]),
            Self::Speedtest(m) => Fields::from([
                (field::UPLOAD_SPEED_MBS, m.upload_speed_mbs),
                (field::DOWNLOAD_SPEED_MBS, m.download_speed_mbs),
                (field::PING_MS, m.ping_ms),
            ]),
        }
    }

    /// Server position, only known for speed-test results.
    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Storage(_) => None,
            Self::Speedtest(m) => Some(Location {
                lat: m.latitude,
                lon: m.longitude,
            }),
        }
    }

    /// Build the point published to sinks.
    pub fn to_point(&self, globals: &GlobalTags) -> Point {
        Point {
            measurement: self.name(),
            tags: globals.apply(self.tags()),
            fields: self.fields(),
            location: self.location(),
        }
    }

    /// One-line summary for the cycle log.
    pub fn summary(&self) -> String {
        match self {
            Self::Storage(m) => format!(
                "upload {:.2} MB/s, download {:.2} MB/s, upload time {:.2}s, download time {:.2}s, endpoint {}, bucket {}",
                m.upload_speed_mbs,
                m.download_speed_mbs,
                m.upload_time_s,
                m.download_time_s,
                m.endpoint,
                m.bucket,
            ),
            Self::Speedtest(m) => format!(
                "upload {:.2} MB/s, download {:.2} MB/s, ping {:.2} ms, server {} ({})",
                m.upload_speed_mbs, m.download_speed_mbs, m.ping_ms, m.server_name, m.country,
            ),
        }
    }
}

impl From<StorageMeasurement> for Measurement {
    fn from(m: StorageMeasurement) -> Self {
        Self::Storage(m)
    }
}

impl From<SpeedtestMeasurement> for Measurement {
    fn from(m: SpeedtestMeasurement) -> Self {
        Self::Speedtest(m)
    }
}

/// A named measurement with merged tags, ready for publication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Tags,
    pub fields: Fields,
    /// Attached as attributes by sinks that support them.
    pub location: Option<Location>,
}
