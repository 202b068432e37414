//! OpenTelemetry metrics sink.
//!
//! Every field updates a gauge named `<measurement>.<field>` holding the last
//! observed value. Duration, speed and latency fields additionally feed
//! histograms with explicit bucket boundaries. Point tags become attributes;
//! speed-test points also carry the server's `lat`/`lon`.

use std::collections::HashMap;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Gauge, Histogram, Meter};

use crate::measurement::{SPEEDTEST_MEASUREMENT, STORAGE_MEASUREMENT, field};
use crate::measurement::Point;
use crate::sink::{Sink, SinkError};

/// Instrumentation scope used for the global meter.
pub const METER_NAME: &str = "netpulse";

/// Object-storage transfer time buckets, in seconds.
const TRANSFER_TIME_BOUNDS: &[f64] = &[
    0.0, 0.1, 0.2, 0.4, 0.6, 0.8, 1.1, 1.2, 1.3, 1.4, 1.5, 1.6, 1.7, 1.8, 1.9, 2.0, 5.0, 10.0,
    50.0, 100.0,
];

/// Speed-test throughput buckets, in MB/s.
const SPEED_BOUNDS: &[f64] = &[
    0.0, 20.0, 40.0, 60.0, 80.0, 100.0, 130.0, 160.0, 190.0, 220.0, 270.0, 350.0, 500.0,
];

/// Speed-test latency buckets, in milliseconds.
const PING_BOUNDS: &[f64] = &[0.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0];

/// Histogram definitions: (measurement, field, instrument name, unit, bounds).
const HISTOGRAMS: &[(&str, &str, &str, &str, &[f64])] = &[
    (STORAGE_MEASUREMENT, field::DOWNLOAD_TIME_S, "wasabi.download_time", "s", TRANSFER_TIME_BOUNDS),
    (STORAGE_MEASUREMENT, field::UPLOAD_TIME_S, "wasabi.upload_time", "s", TRANSFER_TIME_BOUNDS),
    (SPEEDTEST_MEASUREMENT, field::DOWNLOAD_SPEED_MBS, "ookla.download_speed", "MBy/s", SPEED_BOUNDS),
    (SPEEDTEST_MEASUREMENT, field::UPLOAD_SPEED_MBS, "ookla.upload_speed", "MBy/s", SPEED_BOUNDS),
    (SPEEDTEST_MEASUREMENT, field::PING_MS, "ookla.ping", "ms", PING_BOUNDS),
];

/// Gauge definitions: (measurement, field).
const GAUGES: &[(&str, &str)] = &[
    (STORAGE_MEASUREMENT, field::DOWNLOAD_SPEED_MBS),
    (STORAGE_MEASUREMENT, field::UPLOAD_SPEED_MBS),
    (STORAGE_MEASUREMENT, field::DOWNLOAD_TIME_S),
    (STORAGE_MEASUREMENT, field::UPLOAD_TIME_S),
    (SPEEDTEST_MEASUREMENT, field::DOWNLOAD_SPEED_MBS),
    (SPEEDTEST_MEASUREMENT, field::UPLOAD_SPEED_MBS),
    (SPEEDTEST_MEASUREMENT, field::PING_MS),
];

#[derive(Default)]
struct FieldInstruments {
    gauge: Option<Gauge<f64>>,
    histogram: Option<Histogram<f64>>,
}

/// Records points into OpenTelemetry instruments.
///
/// Instruments are created once up front; the configured meter provider
/// decides where they are exported.
pub struct OtelSink {
    instruments: HashMap<(&'static str, &'static str), FieldInstruments>,
}

impl OtelSink {
    /// Create a sink recording through `meter`.
    pub fn new(meter: &Meter) -> Self {
        let mut instruments: HashMap<_, FieldInstruments> = HashMap::new();

        for &(measurement, field) in GAUGES {
            let gauge = meter
                .f64_gauge(format!("{measurement}.{field}"))
                .with_description(format!("Last observed {field} of the {measurement} probe"))
                .build();
            instruments.entry((measurement, field)).or_default().gauge = Some(gauge);
        }

        for &(measurement, field, name, unit, bounds) in HISTOGRAMS {
            let histogram = meter
                .f64_histogram(name)
                .with_unit(unit)
                .with_boundaries(bounds.to_vec())
                .build();
            instruments.entry((measurement, field)).or_default().histogram = Some(histogram);
        }

        Self { instruments }
    }

    /// Create a sink using the global meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }
}

impl std::fmt::Debug for OtelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelSink")
            .field("instruments", &self.instruments.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Sink for OtelSink {
    fn name(&self) -> &str {
        "otel"
    }

    async fn publish(&self, point: &Point) -> Result<(), SinkError> {
        let attributes = attributes(point);

        for (&field, &value) in &point.fields {
            let Some(instruments) = self.instruments.get(&(point.measurement, field)) else {
                tracing::debug!(measurement = %point.measurement, field, "No instrument for field");
                continue;
            };
            if let Some(gauge) = &instruments.gauge {
                gauge.record(value, &attributes);
            }
            if let Some(histogram) = &instruments.histogram {
                histogram.record(value, &attributes);
            }
        }

        Ok(())
    }
}

/// Point tags as attributes, plus `lat`/`lon` when a location is present.
fn attributes(point: &Point) -> Vec<KeyValue> {
    let mut attrs: Vec<KeyValue> = point
        .tags
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    if let Some(location) = point.location {
        attrs.push(KeyValue::new("lat", location.lat));
        attrs.push(KeyValue::new("lon", location.lon));
    }
    attrs
}
