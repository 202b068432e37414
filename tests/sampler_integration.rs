//! Sampler Integration Tests
//!
//! Runs full cycles with the real probes and sinks against local mock
//! backends: an S3-compatible object store, a speed-test server, InfluxDB and
//! a Logstash TCP input.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use netpulse::probe::speedtest::{SpeedtestConfig, SpeedtestProbe};
use netpulse::probe::storage::{StorageProbe, StorageProbeConfig};
use netpulse::sink::influx::{InfluxConfig, InfluxSink};
use netpulse::sink::logstash::{LogstashConfig, LogstashHandle, LogstashSink};
use netpulse::sink::otel::OtelSink;
use netpulse::{GlobalTags, PhaseOutcome, Sampler, SamplerConfig, SinkSet, Tags, telemetry};
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

// =============================================================================
// Mock Backends
// =============================================================================

type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn start_mock_s3() -> String {
    let objects: Objects = Arc::default();
    let app = Router::new()
        .route(
            "/{bucket}/{key}",
            put(
                |State(objects): State<Objects>, Path((b, k)): Path<(String, String)>, body: Bytes| async move {
                    objects.lock().unwrap().insert(format!("{b}/{k}"), body.to_vec());
                    StatusCode::OK
                },
            )
            .get(
                |State(objects): State<Objects>, Path((b, k)): Path<(String, String)>| async move {
                    objects
                        .lock()
                        .unwrap()
                        .get(&format!("{b}/{k}"))
                        .cloned()
                        .ok_or(StatusCode::NOT_FOUND)
                },
            )
            .delete(
                |State(objects): State<Objects>, Path((b, k)): Path<(String, String)>| async move {
                    objects.lock().unwrap().remove(&format!("{b}/{k}"));
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .with_state(objects);
    serve(app).await
}

async fn start_mock_speedtest(healthy: bool) -> String {
    let base: Arc<OnceLock<String>> = Arc::default();
    let app = Router::new()
        .route(
            "/api/js/servers",
            get(|State(base): State<Arc<OnceLock<String>>>| async move {
                let base = base.get().cloned().unwrap_or_default();
                Json(json!([{
                    "url": format!("{base}/speedtest/upload.php"),
                    "lat": "52.37", "lon": "4.89",
                    "name": "Amsterdam", "country": "Netherlands", "sponsor": "Mock", "id": "1"
                }]))
            }),
        )
        .route(
            "/speedtest/{file}",
            get(move |Path(file): Path<String>| async move {
                if !healthy {
                    Err(StatusCode::SERVICE_UNAVAILABLE)
                } else if file == "latency.txt" {
                    Ok(b"test=test\n".to_vec())
                } else {
                    Ok(vec![0xFF; 2048])
                }
            })
            .post(|body: Bytes| async move { format!("size={}", body.len()) }),
        )
        .with_state(Arc::clone(&base));
    let url = serve(app).await;
    base.set(url.clone()).unwrap();
    url
}

async fn start_mock_influx() -> (String, Arc<Mutex<Vec<String>>>) {
    let lines: Arc<Mutex<Vec<String>>> = Arc::default();
    let app = Router::new()
        .route(
            "/api/v2/write",
            post(|State(lines): State<Arc<Mutex<Vec<String>>>>, body: String| async move {
                lines.lock().unwrap().push(body);
                StatusCode::NO_CONTENT
            }),
        )
        .with_state(Arc::clone(&lines));
    (serve(app).await, lines)
}

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    sampler: Sampler,
    influx_lines: Arc<Mutex<Vec<String>>>,
    logstash: TcpListener,
    registry: prometheus::Registry,
    // Dropping the provider shuts it down and empties the registry.
    _provider: SdkMeterProvider,
}

async fn harness(speedtest_healthy: bool) -> Harness {
    let s3 = start_mock_s3().await;
    let speedtest = start_mock_speedtest(speedtest_healthy).await;
    let (influx, influx_lines) = start_mock_influx().await;

    let logstash = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let logstash_port = logstash.local_addr().unwrap().port();
    let (handle, _task) =
        LogstashHandle::spawn(&LogstashConfig::new("127.0.0.1", logstash_port), "host-a");

    let metrics = telemetry::metrics_provider().unwrap();

    let sinks = SinkSet::new()
        .with_sink(InfluxSink::new(&InfluxConfig::new(&influx, "metrics", "token")).unwrap())
        .with_sink(OtelSink::new(&metrics.provider.meter("netpulse")))
        .with_sink(LogstashSink::new(handle));

    let storage = StorageProbe::new(
        StorageProbeConfig::new(&s3, "b1", "AKID", "secret").with_payload_size(32 * 1024),
    )
    .unwrap();
    let speedtest = SpeedtestProbe::new(
        SpeedtestConfig::default()
            .with_servers_url(format!("{speedtest}/api/js/servers"))
            .with_download_sizes(vec![350])
            .with_upload_sizes(vec![1000]),
    )
    .unwrap();

    let globals = GlobalTags::new("host-a", Tags::from([("site".to_string(), "lab".to_string())]));
    let sampler = Sampler::new(
        Box::new(storage),
        Box::new(speedtest),
        sinks,
        globals,
        SamplerConfig::default().with_probe_timeout(Duration::from_secs(10)),
    );

    Harness {
        sampler,
        influx_lines,
        logstash,
        registry: metrics.registry,
        _provider: metrics.provider,
    }
}

async fn read_events(listener: &TcpListener, count: usize) -> Vec<Value> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    let mut events = Vec::new();
    while events.len() < count {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("Timed out waiting for logstash event")
            .unwrap()
            .unwrap();
        events.push(serde_json::from_str(&line).unwrap());
    }
    events
}

fn scrape(registry: &prometheus::Registry) -> String {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

// =============================================================================
// Cycle Tests
// =============================================================================

#[tokio::test]
async fn test_full_cycle_reaches_all_sinks() {
    let h = harness(true).await;

    let report = h.sampler.run_cycle(1).await.unwrap();

    for outcome in [&report.storage, &report.speedtest] {
        let PhaseOutcome::Published { delivered, failed, .. } = outcome else {
            panic!("phase not published: {outcome:?}");
        };
        assert_eq!(delivered, &vec!["influxdb", "otel", "logstash"]);
        assert!(failed.is_empty(), "{failed:?}");
    }

    let lines = h.influx_lines.lock().unwrap().clone();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("wasabi,bucket=b1,endpoint=http://127.0.0.1:"));
    assert!(lines[0].contains(",hostname=host-a,site=lab "));
    assert!(lines[0].contains("upload_speed_mbs="));
    assert!(lines[1].starts_with("ookla,country=Netherlands,hostname=host-a,server_name=Amsterdam,site=lab "));
    assert!(lines[1].contains("ping_ms="));

    let text = scrape(&h.registry);
    assert!(text.contains("wasabi_upload_time_s"), "{text}");
    assert!(text.contains("ookla_upload_speed_mbs"), "{text}");
    assert!(text.contains(r#"lat="52.37""#), "{text}");

    let events = read_events(&h.logstash, 2).await;
    assert_eq!(events[0]["measurement"], "wasabi");
    assert_eq!(events[0]["labels"]["bucket"], "b1");
    assert_eq!(events[1]["measurement"], "ookla");
    assert_eq!(events[1]["labels"]["site"], "lab");
    assert_eq!(events[1]["lon"], 4.89);
}

#[tokio::test]
async fn test_speedtest_outage_only_skips_ookla() {
    let h = harness(false).await;

    let report = h.sampler.run_cycle(1).await.unwrap();

    assert!(report.storage.is_published());
    assert!(matches!(
        &report.speedtest,
        PhaseOutcome::ProbeFailed { kind, .. } if kind == "no_server"
    ));

    let lines = h.influx_lines.lock().unwrap().clone();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("wasabi,"));
    let text = scrape(&h.registry);
    assert!(text.contains("wasabi_download_speed_mbs"), "{text}");
    assert!(!text.contains("ookla_"), "{text}");

    // The next cycle still runs.
    let report = h.sampler.run_cycle(2).await.unwrap();
    assert_eq!(report.cycle, 2);
    assert!(report.storage.is_published());
    assert_eq!(h.influx_lines.lock().unwrap().len(), 2);
}
