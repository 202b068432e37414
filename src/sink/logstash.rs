//! Logstash log shipper.
//!
//! Single-connection pattern: one background task owns the TCP connection to
//! Logstash and drains a bounded MPSC channel of JSON events, writing them in
//! the `json_lines` codec format. Producers never block:
//!
//! - [`LogstashSink`] enqueues one event per published point
//! - [`LogstashLayer`] enqueues one event per `tracing` log record
//!
//! A failed connect or write drops the connection; the next event after the
//! reconnect delay tries again. Events arriving while disconnected are lost.
//! [`LogstashHandle::flush`] waits until everything queued before it has been
//! written, which lets shutdown drain the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::measurement::Point;
use crate::sink::{Sink, SinkError};

// =============================================================================
// Constants
// =============================================================================

/// Default channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default connect timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before reconnecting after a failure (5 seconds).
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Log records from this module are never shipped, to avoid feedback loops.
const SHIPPER_TARGET: &str = module_path!();

fn default_host() -> String {
    "logstash".to_string()
}

fn default_tags() -> Vec<String> {
    vec!["netpulse".to_string()]
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_ship_logs() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

// =============================================================================
// Configuration
// =============================================================================

/// Logstash TCP input settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogstashConfig {
    /// Logstash host (default: "logstash").
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Tags attached to every shipped event (default: ["netpulse"]).
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    /// Events buffered before producers start dropping (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Also ship application log records (default: true).
    #[serde(default = "default_ship_logs")]
    pub ship_logs: bool,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl LogstashConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tags: default_tags(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ship_logs: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.host.is_empty() {
            return Err(SinkError::Config("logstash host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(SinkError::Config("logstash port must be non-zero".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(SinkError::Config(
                "logstash channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Message processed by the shipper task, in queue order.
#[derive(Debug)]
enum Message {
    Event(Value),
    /// Acknowledged once every earlier message has been handled.
    Flush(oneshot::Sender<()>),
}

/// Cloneable producer side of the shipper.
#[derive(Clone)]
pub struct LogstashHandle {
    tx: Sender<Message>,
    host: Arc<str>,
    tags: Arc<[String]>,
}

impl LogstashHandle {
    /// Spawn the shipper task and return its handle.
    ///
    /// `host` is the reporting machine's name written into every event.
    pub fn spawn(config: &LogstashConfig, host: impl Into<String>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let shipper = Shipper {
            rx,
            address: config.address(),
            connect_timeout: config.connect_timeout,
            reconnect_delay: config.reconnect_delay,
        };
        let task = tokio::spawn(shipper.run());

        let handle = Self {
            tx,
            host: Arc::from(host.into()),
            tags: Arc::from(config.tags.clone()),
        };
        (handle, task)
    }

    /// Enqueue an event without waiting.
    pub fn send(&self, event: Value) -> Result<(), SinkError> {
        self.tx.try_send(Message::Event(event)).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Unavailable("logstash queue full".to_string()),
            TrySendError::Closed(_) => {
                SinkError::Unavailable("logstash shipper stopped".to_string())
            }
        })
    }

    /// Wait until every event queued before this call has been written or
    /// dropped by the shipper.
    ///
    /// # Errors
    /// Returns `SinkError::Timeout` when `limit` elapses first, and
    /// `SinkError::Unavailable` when the shipper has stopped.
    pub async fn flush(&self, limit: Duration) -> Result<(), SinkError> {
        let stopped = || SinkError::Unavailable("logstash shipper stopped".to_string());
        let (ack, done) = oneshot::channel();

        let flushed = async {
            self.tx.send(Message::Flush(ack)).await.map_err(|_| stopped())?;
            done.await.map_err(|_| stopped())
        };
        timeout(limit, flushed)
            .await
            .map_err(|_| SinkError::Timeout(limit))?
    }

    /// Common envelope fields of the Logstash v1 event format.
    fn envelope(&self, event_type: &str, message: String) -> Map<String, Value> {
        let mut event = Map::new();
        event.insert(
            "@timestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        event.insert("@version".to_string(), json!("1"));
        event.insert("host".to_string(), json!(&*self.host));
        event.insert("type".to_string(), json!(event_type));
        event.insert("tags".to_string(), json!(&*self.tags));
        event.insert("message".to_string(), json!(message));
        event
    }

    /// Event describing one published point.
    pub fn point_event(&self, point: &Point) -> Value {
        let values = point
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut event = self.envelope("measurement", format!("{} {}", point.measurement, values));
        event.insert("measurement".to_string(), json!(point.measurement));
        event.insert("labels".to_string(), json!(point.tags));
        event.insert("values".to_string(), json!(point.fields));
        if let Some(location) = point.location {
            event.insert("lat".to_string(), json!(location.lat));
            event.insert("lon".to_string(), json!(location.lon));
        }
        Value::Object(event)
    }

    /// Event describing one log record.
    fn log_event(&self, level: &Level, target: &str, record: JsonVisitor) -> Value {
        let mut event = self.envelope("log", record.message.unwrap_or_default());
        event.insert("level".to_string(), json!(level.as_str()));
        event.insert("logger_name".to_string(), json!(target));
        for (k, v) in record.fields {
            event.entry(k).or_insert(v);
        }
        Value::Object(event)
    }
}

impl std::fmt::Debug for LogstashHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogstashHandle")
            .field("host", &self.host)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Shipper task
// =============================================================================

struct Shipper {
    rx: Receiver<Message>,
    address: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
}

impl Shipper {
    async fn run(mut self) {
        let mut conn: Option<TcpStream> = None;
        let mut retry_at: Option<Instant> = None;

        while let Some(message) = self.rx.recv().await {
            let event = match message {
                Message::Event(event) => event,
                Message::Flush(ack) => {
                    if let Some(stream) = conn.as_mut() {
                        if let Err(e) = stream.flush().await {
                            tracing::warn!(address = %self.address, error = %e, "Logstash flush failed, dropping connection");
                            conn = None;
                        }
                    }
                    let _ = ack.send(());
                    continue;
                }
            };
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode logstash event");
                    continue;
                }
            };
            line.push(b'\n');

            if conn.is_none() {
                if retry_at.is_some_and(|at| Instant::now() < at) {
                    continue;
                }
                conn = self.connect().await;
                if conn.is_none() {
                    retry_at = Some(Instant::now() + self.reconnect_delay);
                    continue;
                }
                retry_at = None;
            }

            if let Some(stream) = conn.as_mut() {
                if let Err(e) = stream.write_all(&line).await {
                    tracing::warn!(address = %self.address, error = %e, "Logstash write failed, dropping connection");
                    conn = None;
                    retry_at = Some(Instant::now() + self.reconnect_delay);
                }
            }
        }

        tracing::debug!("Logstash shipper stopped");
    }

    async fn connect(&self) -> Option<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                tracing::info!(address = %self.address, "Connected to logstash");
                Some(stream)
            }
            Ok(Err(e)) => {
                tracing::warn!(address = %self.address, error = %e, "Logstash connect failed");
                None
            }
            Err(_) => {
                tracing::warn!(address = %self.address, timeout = ?self.connect_timeout, "Logstash connect timed out");
                None
            }
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Publishes points as Logstash events.
#[derive(Debug, Clone)]
pub struct LogstashSink {
    handle: LogstashHandle,
}

impl LogstashSink {
    pub fn new(handle: LogstashHandle) -> Self {
        Self { handle }
    }
}

#[async_trait::async_trait]
impl Sink for LogstashSink {
    fn name(&self) -> &str {
        "logstash"
    }

    async fn publish(&self, point: &Point) -> Result<(), SinkError> {
        self.handle.send(self.handle.point_event(point))
    }
}

// =============================================================================
// Tracing layer
// =============================================================================

/// Forwards `tracing` events to Logstash.
#[derive(Debug, Clone)]
pub struct LogstashLayer {
    handle: LogstashHandle,
}

impl LogstashLayer {
    pub fn new(handle: LogstashHandle) -> Self {
        Self { handle }
    }
}

impl<S: Subscriber> Layer<S> for LogstashLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(SHIPPER_TARGET) {
            return;
        }

        let mut record = JsonVisitor::default();
        event.record(&mut record);

        // Nowhere to report a full queue from inside the logging pipeline.
        let _ = self
            .handle
            .send(self.handle.log_event(meta.level(), meta.target(), record));
    }
}

/// Collects event fields into JSON values.
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for JsonVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, json!(format!("{value:?}")));
    }
}
