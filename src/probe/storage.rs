//! Object-storage throughput probe.
//!
//! Writes a fixed-size object to an S3-compatible bucket, reads it back and
//! deletes it, timing the two transfer legs.

mod sigv4;

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::measurement::{Measurement, StorageMeasurement};
use crate::probe::{Probe, ProbeError, throughput_mbs};

use sigv4::Credentials;

/// Default payload size (1 MiB).
pub const DEFAULT_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Default per-request timeout (60 seconds).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default signing region.
const DEFAULT_REGION: &str = "us-east-1";

/// Byte the payload is filled with.
const PAYLOAD_BYTE: u8 = b'A';

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_payload_size() -> usize {
    DEFAULT_PAYLOAD_SIZE
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// Configuration for the object-storage probe.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageProbeConfig {
    /// S3-compatible endpoint, e.g. `https://s3.eu-central-1.wasabisys.com`.
    pub endpoint: String,
    /// Bucket the test object is written to.
    pub bucket: String,
    /// Signing region (default: "us-east-1").
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Size of the uploaded object in bytes (default: 1 MiB).
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    /// Timeout for each HTTP request (default: 60s).
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl std::fmt::Debug for StorageProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProbeConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("payload_size", &self.payload_size)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl StorageProbeConfig {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            region: default_region(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the payload size.
    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Set the signing region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ProbeError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ProbeError::Config(format!("invalid endpoint '{}': {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProbeError::Config(format!(
                "endpoint '{}' must use http or https",
                self.endpoint
            )));
        }
        for (field, value) in [
            ("bucket", &self.bucket),
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
        ] {
            if value.is_empty() {
                return Err(ProbeError::Config(format!("{field} cannot be empty")));
            }
        }
        if self.payload_size == 0 {
            return Err(ProbeError::Config(
                "payload_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Upload/download throughput probe against one bucket.
pub struct StorageProbe {
    config: StorageProbeConfig,
    credentials: Credentials,
    client: Client,
    payload: Vec<u8>,
    payload_hash: String,
}

impl StorageProbe {
    /// Create a new probe.
    ///
    /// # Errors
    /// Returns `ProbeError::Config` for an invalid configuration and
    /// `ProbeError::Network` if the HTTP client cannot be built.
    pub fn new(config: StorageProbeConfig) -> Result<Self, ProbeError> {
        config.validate()?;

        let client = Client::builder().timeout(config.request_timeout).build()?;
        let payload = vec![PAYLOAD_BYTE; config.payload_size];
        let payload_hash = sigv4::payload_sha256(&payload);
        let credentials = Credentials {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        };

        Ok(Self {
            config,
            credentials,
            client,
            payload,
            payload_hash,
        })
    }

    fn object_url(&self, key: &str) -> Result<Url, ProbeError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|e| ProbeError::Config(format!("invalid endpoint: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProbeError::Config("endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(&self.config.bucket)
            .push(key);
        Ok(url)
    }

    fn signed(&self, method: Method, url: &Url, payload_hash: &str) -> RequestBuilder {
        let signed = sigv4::sign(
            method.as_str(),
            url,
            &[],
            payload_hash,
            &self.credentials,
            &self.config.region,
            Utc::now(),
        );
        signed
            .headers
            .into_iter()
            .fold(self.client.request(method, url.clone()), |req, (k, v)| {
                req.header(k, v)
            })
    }

    async fn put_object(&self, url: &Url) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        let resp = self
            .signed(Method::PUT, url, &self.payload_hash)
            .body(self.payload.clone())
            .send()
            .await?;
        check_status(&resp, "put_object")?;
        // Drain the body so the timing covers the whole exchange.
        resp.bytes().await?;
        Ok(start.elapsed())
    }

    async fn get_object(&self, url: &Url) -> Result<(u64, Duration), ProbeError> {
        let start = Instant::now();
        let resp = self
            .signed(Method::GET, url, sigv4::EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        check_status(&resp, "get_object")?;
        let body = resp.bytes().await?;
        Ok((body.len() as u64, start.elapsed()))
    }

    async fn delete_object(&self, url: &Url) -> Result<(), ProbeError> {
        let resp = self
            .signed(Method::DELETE, url, sigv4::EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        check_status(&resp, "delete_object")
    }
}

impl std::fmt::Debug for StorageProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProbe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Probe for StorageProbe {
    fn name(&self) -> &str {
        "storage"
    }

    async fn measure(&self) -> Result<Measurement, ProbeError> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        let url = self.object_url(&key)?;

        let upload_time = self.put_object(&url).await?;
        let uploaded = self.payload.len() as u64;

        let (downloaded, download_time) = self.get_object(&url).await?;
        if downloaded != uploaded {
            tracing::warn!(
                key = %key,
                uploaded,
                downloaded,
                "Downloaded object size differs from uploaded payload"
            );
        }

        if let Err(e) = self.delete_object(&url).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete probe object");
        }

        Ok(StorageMeasurement {
            bucket: self.config.bucket.clone(),
            endpoint: self.config.endpoint.clone(),
            upload_speed_mbs: throughput_mbs(uploaded, upload_time),
            download_speed_mbs: throughput_mbs(downloaded, download_time),
            upload_time_s: upload_time.as_secs_f64(),
            download_time_s: download_time.as_secs_f64(),
        }
        .into())
    }
}

fn check_status(resp: &reqwest::Response, operation: &'static str) -> Result<(), ProbeError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ProbeError::Status {
            operation,
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::put,
    };
    use tokio::net::TcpListener;

    type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    #[derive(Clone)]
    struct MockS3 {
        objects: Objects,
        fail_put: bool,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"))
            && headers.contains_key("x-amz-date")
            && headers.contains_key("x-amz-content-sha256")
    }

    async fn put_handler(
        State(s3): State<MockS3>,
        Path((bucket, key)): Path<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        if s3.fail_put || !authorized(&headers) {
            return StatusCode::FORBIDDEN;
        }
        s3.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"), body.to_vec());
        StatusCode::OK
    }

    async fn get_handler(
        State(s3): State<MockS3>,
        Path((bucket, key)): Path<(String, String)>,
    ) -> Result<Vec<u8>, StatusCode> {
        s3.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{key}"))
            .cloned()
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn delete_handler(
        State(s3): State<MockS3>,
        Path((bucket, key)): Path<(String, String)>,
    ) -> StatusCode {
        s3.objects
            .lock()
            .unwrap()
            .remove(&format!("{bucket}/{key}"));
        StatusCode::NO_CONTENT
    }

    async fn start_mock_s3(fail_put: bool) -> (String, Objects) {
        let objects: Objects = Arc::default();
        let state = MockS3 {
            objects: Arc::clone(&objects),
            fail_put,
        };
        let app = Router::new()
            .route(
                "/{bucket}/{key}",
                put(put_handler).get(get_handler).delete(delete_handler),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), objects)
    }

    #[test]
    fn test_config_validation() {
        let config = StorageProbeConfig::new("https://s3.wasabisys.com", "b1", "AKID", "secret");
        assert!(config.validate().is_ok());

        let bad_scheme = StorageProbeConfig::new("ftp://host", "b1", "AKID", "secret");
        assert!(bad_scheme.validate().is_err());

        let empty_bucket = StorageProbeConfig::new("https://host", "", "AKID", "secret");
        let err = empty_bucket.validate().unwrap_err();
        assert!(err.to_string().contains("bucket cannot be empty"));

        let zero_payload =
            StorageProbeConfig::new("https://host", "b1", "AKID", "secret").with_payload_size(0);
        assert!(zero_payload.validate().is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = StorageProbeConfig::new("https://host", "b1", "AKID", "top-secret");
        assert!(!format!("{config:?}").contains("top-secret"));
    }

    #[test]
    fn test_object_url_is_path_style() {
        let config = StorageProbeConfig::new("https://s3.example.com/", "b1", "AKID", "secret");
        let probe = StorageProbe::new(config).unwrap();
        let url = probe.object_url("abc123").unwrap();
        assert_eq!(url.as_str(), "https://s3.example.com/b1/abc123");
    }

    #[tokio::test]
    async fn test_measure_round_trip() {
        let (endpoint, objects) = start_mock_s3(false).await;
        let config = StorageProbeConfig::new(&endpoint, "b1", "AKID", "secret")
            .with_payload_size(64 * 1024);
        let probe = StorageProbe::new(config).unwrap();

        let measurement = probe.measure().await.unwrap();
        let Measurement::Storage(m) = measurement else {
            panic!("expected storage measurement");
        };

        assert_eq!(m.bucket, "b1");
        assert_eq!(m.endpoint, endpoint);
        assert!(m.upload_speed_mbs >= 0.0 && m.upload_speed_mbs.is_finite());
        assert!(m.download_speed_mbs >= 0.0 && m.download_speed_mbs.is_finite());
        assert!(m.upload_time_s > 0.0);
        assert!(m.download_time_s > 0.0);

        let expected_up = throughput_mbs(64 * 1024, Duration::from_secs_f64(m.upload_time_s));
        assert!((m.upload_speed_mbs - expected_up).abs() <= 1e-3 * expected_up);

        // Probe object is cleaned up.
        assert!(objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_measure_put_rejected() {
        let (endpoint, _objects) = start_mock_s3(true).await;
        let config = StorageProbeConfig::new(&endpoint, "b1", "AKID", "secret")
            .with_payload_size(1024);
        let probe = StorageProbe::new(config).unwrap();

        let err = probe.measure().await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Status {
                operation: "put_object",
                status: 403
            }
        ));
    }

    #[tokio::test]
    async fn test_measure_unreachable_endpoint() {
        let config = StorageProbeConfig::new("http://127.0.0.1:1", "b1", "AKID", "secret")
            .with_payload_size(16);
        let probe = StorageProbe::new(config).unwrap();
        assert!(matches!(
            probe.measure().await,
            Err(ProbeError::Network(_))
        ));
    }
}
