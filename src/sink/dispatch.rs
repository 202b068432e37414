//! Fan-out of one point to every configured sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::measurement::Point;
use crate::sink::{Sink, SinkError};

/// Default bound on a single sink publish call (10 seconds).
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub sink: String,
    pub kind: String,
    pub error: String,
}

/// Outcome of publishing one point to every sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sinks that accepted the point.
    pub delivered: Vec<String>,
    /// Sinks that failed, with the reason.
    pub failed: Vec<SinkFailure>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered set of sinks sharing one publish timeout.
///
/// Sinks are built once before sampling starts and never change afterwards.
#[derive(Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
    timeout: Duration,
}

impl Default for SinkSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkSet {
    /// Create an empty set with the default publish timeout.
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    /// Set the per-sink publish timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Add an already shared sink.
    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Names of the registered sinks, in publish order.
    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Publish a point to every sink.
    ///
    /// Each call is bounded by the set's timeout. Failures are logged with the
    /// sink identity and error kind, collected in the report and never
    /// returned as an error; a failing sink does not stop the others.
    pub async fn publish(&self, point: &Point) -> DispatchReport {
        let mut report = DispatchReport::default();

        for sink in &self.sinks {
            let name = sink.name();
            let result = match timeout(self.timeout, sink.publish(point)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(self.timeout)),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(sink = %name, measurement = %point.measurement, "Point published");
                    report.delivered.push(name.to_string());
                }
                Err(e) => {
                    tracing::warn!(
                        sink = %name,
                        measurement = %point.measurement,
                        error.kind = %e.kind(),
                        error = %e,
                        "Failed to publish point"
                    );
                    report.failed.push(SinkFailure {
                        sink: name.to_string(),
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet")
            .field("sinks", &self.names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Fields, Point};
    use crate::tags::Tags;
    use std::sync::Mutex;

    struct RecordingSink {
        name: &'static str,
        points: Arc<Mutex<Vec<Point>>>,
    }

    #[async_trait::async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn publish(&self, point: &Point) -> Result<(), SinkError> {
            self.points.lock().unwrap().push(point.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn publish(&self, _point: &Point) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("backend down".to_string()))
        }
    }

    struct HangingSink;

    #[async_trait::async_trait]
    impl Sink for HangingSink {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn publish(&self, _point: &Point) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn point() -> Point {
        Point {
            measurement: "wasabi",
            tags: Tags::from([("hostname".to_string(), "h".to_string())]),
            fields: Fields::from([("upload_speed_mbs", 8.0)]),
            location: None,
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_sinks() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let last = Arc::new(Mutex::new(Vec::new()));
        let sinks = SinkSet::new()
            .with_sink(RecordingSink {
                name: "first",
                points: Arc::clone(&first),
            })
            .with_sink(FailingSink)
            .with_sink(RecordingSink {
                name: "last",
                points: Arc::clone(&last),
            });

        let report = sinks.publish(&point()).await;

        assert_eq!(report.delivered, vec!["first", "last"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].sink, "failing");
        assert_eq!(report.failed[0].kind, "unavailable");
        assert!(!report.is_complete());
        assert_eq!(first.lock().unwrap().as_slice(), &[point()]);
        assert_eq!(last.lock().unwrap().as_slice(), &[point()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sink_times_out() {
        let points = Arc::new(Mutex::new(Vec::new()));
        let sinks = SinkSet::new()
            .with_timeout(Duration::from_secs(2))
            .with_sink(HangingSink)
            .with_sink(RecordingSink {
                name: "after",
                points: Arc::clone(&points),
            });

        let report = sinks.publish(&point()).await;

        assert_eq!(report.failed[0].kind, "timeout");
        assert_eq!(report.delivered, vec!["after"]);
        assert_eq!(points.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_set_publishes_nothing() {
        let report = SinkSet::new().publish(&point()).await;
        assert!(report.delivered.is_empty());
        assert!(report.is_complete());
    }
}
