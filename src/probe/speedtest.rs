//! Public speed-test probe against the speedtest.net server network.
//!
//! One measurement runs three steps:
//!
//! 1. Fetch the server list and pick the candidate with the lowest average
//!    `latency.txt` round trip.
//! 2. Download `random{N}x{N}.jpg` images from it concurrently.
//! 3. Upload generated payloads to its `upload.php` concurrently.
//!
//! Speeds are total bytes over wall-clock time, in MB/s.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::measurement::{Measurement, SpeedtestMeasurement};
use crate::probe::{Probe, ProbeError, throughput_mbs};

/// Public JSON server list.
pub const DEFAULT_SERVERS_URL: &str =
    "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true&limit=10";

/// Default number of servers to measure latency against.
const DEFAULT_CANDIDATES: usize = 5;

/// Default number of latency requests per candidate.
const DEFAULT_LATENCY_SAMPLES: u32 = 3;

/// Default per-request timeout (30 seconds).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix speedtest.net upload endpoints expect on the form body.
const UPLOAD_PREFIX: &[u8] = b"content1=";

fn default_servers_url() -> String {
    DEFAULT_SERVERS_URL.to_string()
}

fn default_candidates() -> usize {
    DEFAULT_CANDIDATES
}

fn default_latency_samples() -> u32 {
    DEFAULT_LATENCY_SAMPLES
}

fn default_download_sizes() -> Vec<u32> {
    vec![350, 500, 750, 1000, 1500]
}

fn default_upload_sizes() -> Vec<usize> {
    let sizes = [256 * 1024, 512 * 1024, 1024 * 1024];
    sizes.iter().chain(sizes.iter()).copied().collect()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_user_agent() -> String {
    format!(
        "Mozilla/5.0 ({}) netpulse/{}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
}

/// Configuration for the speed-test probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedtestConfig {
    /// Server list URL returning the speedtest.net JSON format.
    #[serde(default = "default_servers_url")]
    pub servers_url: String,
    /// Number of listed servers to consider (default: 5).
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    /// Latency requests per candidate (default: 3).
    #[serde(default = "default_latency_samples")]
    pub latency_samples: u32,
    /// Image edge sizes fetched during the download leg.
    #[serde(default = "default_download_sizes")]
    pub download_sizes: Vec<u32>,
    /// Payload sizes in bytes sent during the upload leg.
    #[serde(default = "default_upload_sizes")]
    pub upload_sizes: Vec<usize>,
    /// Timeout for each HTTP request (default: 30s).
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            servers_url: default_servers_url(),
            candidates: DEFAULT_CANDIDATES,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            download_sizes: default_download_sizes(),
            upload_sizes: default_upload_sizes(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: default_user_agent(),
        }
    }
}

impl SpeedtestConfig {
    /// Set the server list URL.
    pub fn with_servers_url(mut self, url: impl Into<String>) -> Self {
        self.servers_url = url.into();
        self
    }

    /// Set the download image sizes.
    pub fn with_download_sizes(mut self, sizes: Vec<u32>) -> Self {
        self.download_sizes = sizes;
        self
    }

    /// Set the upload payload sizes.
    pub fn with_upload_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.upload_sizes = sizes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ProbeError> {
        Url::parse(&self.servers_url).map_err(|e| {
            ProbeError::Config(format!("invalid servers_url '{}': {e}", self.servers_url))
        })?;
        if self.candidates == 0 {
            return Err(ProbeError::Config("candidates must be positive".to_string()));
        }
        if self.latency_samples == 0 {
            return Err(ProbeError::Config(
                "latency_samples must be positive".to_string(),
            ));
        }
        if self.download_sizes.is_empty() || self.upload_sizes.is_empty() {
            return Err(ProbeError::Config(
                "download_sizes and upload_sizes cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry of the speedtest.net server list.
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    /// Upload endpoint; other resources live next to it.
    pub url: String,
    pub name: String,
    pub country: String,
    #[serde(default)]
    pub sponsor: String,
    #[serde(deserialize_with = "number_or_string")]
    pub lat: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub lon: f64,
}

impl Server {
    /// Resolve a resource that sits next to the upload endpoint.
    fn resource(&self, name: &str) -> Result<Url, ProbeError> {
        Url::parse(&self.url)
            .and_then(|base| base.join(name))
            .map_err(|e| ProbeError::InvalidResponse(format!("bad server url '{}': {e}", self.url)))
    }
}

/// The list serves coordinates as strings; accept plain numbers too.
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Speed-test probe.
pub struct SpeedtestProbe {
    config: SpeedtestConfig,
    client: Client,
}

impl SpeedtestProbe {
    /// Create a new probe.
    pub fn new(config: SpeedtestConfig) -> Result<Self, ProbeError> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { config, client })
    }

    /// Fetch the server list.
    pub async fn servers(&self) -> Result<Vec<Server>, ProbeError> {
        let resp = self.client.get(&self.config.servers_url).send().await?;
        if !resp.status().is_success() {
            return Err(ProbeError::Status {
                operation: "server_list",
                status: resp.status().as_u16(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProbeError::InvalidResponse(format!("server list: {e}")))
    }

    /// Average `latency.txt` round trip, or `None` if any sample fails.
    async fn latency(&self, server: &Server) -> Option<Duration> {
        let url = server.resource("latency.txt").ok()?;
        let mut total = Duration::ZERO;
        for _ in 0..self.config.latency_samples {
            let start = Instant::now();
            let resp = self.client.get(url.clone()).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            resp.bytes().await.ok()?;
            total += start.elapsed();
        }
        Some(total / self.config.latency_samples)
    }

    /// Pick the server with the lowest average latency.
    pub async fn best_server(&self) -> Result<(Server, Duration), ProbeError> {
        let servers = self.servers().await?;
        let mut best: Option<(Server, Duration)> = None;

        for server in servers.into_iter().take(self.config.candidates) {
            match self.latency(&server).await {
                Some(latency) => {
                    tracing::debug!(server = %server.name, sponsor = %server.sponsor, latency_ms = latency.as_secs_f64() * 1000.0, "Candidate latency");
                    if best.as_ref().is_none_or(|(_, l)| latency < *l) {
                        best = Some((server, latency));
                    }
                }
                None => {
                    tracing::debug!(server = %server.name, "Candidate unreachable");
                }
            }
        }

        best.ok_or(ProbeError::NoServer)
    }

    async fn download(&self, server: &Server) -> Result<(u64, Duration), ProbeError> {
        let urls = self
            .config
            .download_sizes
            .iter()
            .map(|size| server.resource(&format!("random{size}x{size}.jpg")))
            .collect::<Result<Vec<_>, _>>()?;

        let start = Instant::now();
        let results = join_all(urls.into_iter().map(|url| async move {
            let resp = self.client.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(ProbeError::Status {
                    operation: "download",
                    status: resp.status().as_u16(),
                });
            }
            Ok::<u64, ProbeError>(resp.bytes().await?.len() as u64)
        }))
        .await;
        let elapsed = start.elapsed();

        let bytes = results.into_iter().sum::<Result<u64, ProbeError>>()?;
        Ok((bytes, elapsed))
    }

    async fn upload(&self, server: &Server) -> Result<(u64, Duration), ProbeError> {
        let url = server.resource("upload.php")?;
        let payloads: Vec<Vec<u8>> = self
            .config
            .upload_sizes
            .iter()
            .map(|&size| upload_payload(size))
            .collect();

        let start = Instant::now();
        let results = join_all(payloads.into_iter().map(|body| {
            let url = url.clone();
            async move {
                let sent = body.len() as u64;
                let resp = self.client.post(url).body(body).send().await?;
                if !resp.status().is_success() {
                    return Err(ProbeError::Status {
                        operation: "upload",
                        status: resp.status().as_u16(),
                    });
                }
                resp.bytes().await?;
                Ok::<u64, ProbeError>(sent)
            }
        }))
        .await;
        let elapsed = start.elapsed();

        let bytes = results.into_iter().sum::<Result<u64, ProbeError>>()?;
        Ok((bytes, elapsed))
    }
}

impl std::fmt::Debug for SpeedtestProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedtestProbe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Probe for SpeedtestProbe {
    fn name(&self) -> &str {
        "speedtest"
    }

    async fn measure(&self) -> Result<Measurement, ProbeError> {
        let (server, latency) = self.best_server().await?;
        tracing::debug!(server = %server.name, country = %server.country, "Selected speed-test server");

        let (down_bytes, down_time) = self.download(&server).await?;
        let (up_bytes, up_time) = self.upload(&server).await?;

        Ok(SpeedtestMeasurement {
            server_name: server.name,
            country: server.country,
            download_speed_mbs: throughput_mbs(down_bytes, down_time),
            upload_speed_mbs: throughput_mbs(up_bytes, up_time),
            ping_ms: latency.as_secs_f64() * 1000.0,
            latitude: server.lat,
            longitude: server.lon,
        }
        .into())
    }
}

/// Form body of exactly `size` bytes (at least the prefix).
fn upload_payload(size: usize) -> Vec<u8> {
    const CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut body = Vec::with_capacity(size.max(UPLOAD_PREFIX.len()));
    body.extend_from_slice(UPLOAD_PREFIX);
    body.extend(
        CHARS
            .iter()
            .cycle()
            .take(size.saturating_sub(UPLOAD_PREFIX.len())),
    );
    body
}
