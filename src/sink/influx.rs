//! InfluxDB v2 sink.
//!
//! Encodes points as line protocol and writes them through the HTTP
//! `/api/v2/write` endpoint. No timestamp is sent, so the server assigns the
//! write time.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::measurement::Point;
use crate::sink::{Sink, SinkError};

/// Default organisation name.
const DEFAULT_ORG: &str = "geox";

/// Default request timeout (10 seconds).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn default_org() -> String {
    DEFAULT_ORG.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// InfluxDB connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Server URL, e.g. `http://influxdb:8086`.
    pub url: String,
    /// Organisation (default: "geox").
    #[serde(default = "default_org")]
    pub org: String,
    pub bucket: String,
    /// API token sent as `Authorization: Token <token>`.
    pub token: String,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl InfluxConfig {
    pub fn new(
        url: impl Into<String>,
        bucket: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            org: default_org(),
            bucket: bucket.into(),
            token: token.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the organisation.
    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = org.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SinkError> {
        Url::parse(&self.url)
            .map_err(|e| SinkError::Config(format!("invalid influxdb url '{}': {e}", self.url)))?;
        for (field, value) in [
            ("org", &self.org),
            ("bucket", &self.bucket),
            ("token", &self.token),
        ] {
            if value.is_empty() {
                return Err(SinkError::Config(format!(
                    "influxdb {field} cannot be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Writes points to InfluxDB.
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    auth: String,
}

impl InfluxSink {
    /// Create a new sink.
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        config.validate()?;

        let mut write_url = Url::parse(&config.url)
            .and_then(|base| base.join("api/v2/write"))
            .map_err(|e| SinkError::Config(format!("invalid influxdb url: {e}")))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            write_url,
            auth: format!("Token {}", config.token),
        })
    }
}

impl std::fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSink")
            .field("write_url", &self.write_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn publish(&self, point: &Point) -> Result<(), SinkError> {
        let Some(line) = line_protocol(point) else {
            tracing::debug!(measurement = %point.measurement, "No finite fields, skipping influxdb write");
            return Ok(());
        };

        let resp = self
            .client
            .post(self.write_url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Encode a point as one line of InfluxDB line protocol.
///
/// Non-finite fields are dropped. Returns `None` when no field is left, since
/// a line without fields is invalid.
pub fn line_protocol(point: &Point) -> Option<String> {
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| format!("{}={}", escape_key(k), format_float(*v)))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(point.measurement);
    for (k, v) in &point.tags {
        // Empty tag values are not allowed by the protocol.
        if v.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(k));
        line.push('=');
        line.push_str(&escape_key(v));
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    Some(line)
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

/// Line breaks cannot be escaped in keys or tag values; they become
/// (escaped) spaces so a point always stays on one line.
fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let c = if matches!(c, '\n' | '\r') { ' ' } else { c };
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Floats always carry a decimal point so the server never infers an integer.
fn format_float(v: f64) -> String {
    let s = v.to_string();
    if s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Fields;
    use crate::tags::Tags;
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        extract::{RawQuery, State},
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Default)]
    struct Captured {
        query: Option<String>,
        auth: Option<String>,
        body: String,
    }

    type Shared = Arc<Mutex<Vec<Captured>>>;

    async fn start_mock_influx(status: StatusCode) -> (String, Shared) {
        let captured: Shared = Arc::default();
        let app = Router::new()
            .route(
                "/api/v2/write",
                post(
                    move |State(captured): State<Shared>,
                          RawQuery(query): RawQuery,
                          headers: HeaderMap,
                          body: String| async move {
                        captured.lock().unwrap().push(Captured {
                            query,
                            auth: headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string),
                            body,
                        });
                        (status, "")
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), captured)
    }

    fn point() -> Point {
        Point {
            measurement: "wasabi",
            tags: Tags::from([
                ("bucket".to_string(), "b1".to_string()),
                ("endpoint".to_string(), "https://e".to_string()),
                ("hostname".to_string(), "host-a".to_string()),
            ]),
            fields: Fields::from([
                ("download_speed_mbs", 10.0),
                ("download_time_s", 1.0),
                ("upload_speed_mbs", 8.0),
                ("upload_time_s", 1.25),
            ]),
            location: None,
        }
    }

    #[test]
    fn test_line_protocol_format() {
        assert_eq!(
            line_protocol(&point()).unwrap(),
            "wasabi,bucket=b1,endpoint=https://e,hostname=host-a \
             download_speed_mbs=10.0,download_time_s=1.0,upload_speed_mbs=8.0,upload_time_s=1.25"
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        let mut p = point();
        p.tags = Tags::from([("server name".to_string(), "New York, NY=1".to_string())]);
        let line = line_protocol(&p).unwrap();
        assert!(line.starts_with(r"wasabi,server\ name=New\ York\,\ NY\=1 "));
    }

    #[test]
    fn test_line_protocol_flattens_line_breaks() {
        let mut p = point();
        p.tags = Tags::from([("server_name".to_string(), "New\nYork\r\n".to_string())]);
        let line = line_protocol(&p).unwrap();
        assert!(!line.contains(['\n', '\r']));
        assert!(line.starts_with(r"wasabi,server_name=New\ York\ \  "));
    }

    #[test]
    fn test_line_protocol_skips_non_finite_and_empty() {
        let mut p = point();
        p.fields = Fields::from([("ping_ms", f64::NAN), ("upload_speed_mbs", 1.5)]);
        p.tags.insert("empty".to_string(), String::new());
        let line = line_protocol(&p).unwrap();
        assert!(line.ends_with(" upload_speed_mbs=1.5"));
        assert!(!line.contains("empty"));

        p.fields = Fields::from([("ping_ms", f64::INFINITY)]);
        assert!(line_protocol(&p).is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(InfluxConfig::new("http://influx:8086", "metrics", "t").validate().is_ok());
        assert!(InfluxConfig::new("not a url", "metrics", "t").validate().is_err());
        assert!(InfluxConfig::new("http://influx:8086", "metrics", "").validate().is_err());
    }

    #[tokio::test]
    async fn test_publish_writes_line() {
        let (url, captured) = start_mock_influx(StatusCode::NO_CONTENT).await;
        let sink = InfluxSink::new(&InfluxConfig::new(&url, "metrics", "secret").with_org("acme")).unwrap();

        sink.publish(&point()).await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].auth.as_deref(), Some("Token secret"));
        assert_eq!(
            captured[0].query.as_deref(),
            Some("org=acme&bucket=metrics&precision=ns")
        );
        assert_eq!(captured[0].body, line_protocol(&point()).unwrap());
    }

    #[tokio::test]
    async fn test_publish_rejected() {
        let (url, _captured) = start_mock_influx(StatusCode::UNAUTHORIZED).await;
        let sink = InfluxSink::new(&InfluxConfig::new(&url, "metrics", "bad")).unwrap();

        let err = sink.publish(&point()).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status: 401, .. }));
    }
}
