//! Netpulse Binary Entry Point
//!
//! This binary runs the sampling loop with the configured probes and sinks.
//! Core functionality is provided by the `netpulse` library crate.

use clap::Parser;
use netpulse::{
    config::{AppConfig, parse_duration},
    probe::{speedtest::SpeedtestProbe, storage::StorageProbe},
    sampler::Sampler,
    server::{AppState, create_router},
    sink::{
        SinkSet,
        influx::InfluxSink,
        logstash::{LogstashHandle, LogstashLayer, LogstashSink},
        otel::OtelSink,
    },
    tags::GlobalTags,
    telemetry,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Upper bound on draining the Logstash queue at exit.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Netpulse - Network Throughput Sampler
#[derive(Parser, Debug)]
#[command(name = "netpulse", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "NETPULSE_CONFIG"
    )]
    config: String,

    /// Pause between cycles, in seconds or as a duration like "90s" (overrides config file)
    #[arg(short, long, env = "SLEEP_TIME", value_parser = parse_interval)]
    interval: Option<Duration>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// Plain integers are seconds; anything else is a humantime duration.
fn parse_interval(s: &str) -> Result<Duration, String> {
    match s.trim().parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => parse_duration(s),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(interval) = cli.interval {
        config.sampler.interval = interval;
    }

    let globals = match &config.hostname {
        Some(hostname) => GlobalTags::new(hostname.clone(), config.global_tags.clone()),
        None => GlobalTags::detect(config.global_tags.clone()),
    };

    // Start the log shipper before tracing so log records can reach it
    let logstash = config
        .sinks
        .logstash
        .as_ref()
        .map(|cfg| {
            let (handle, _shipper) = LogstashHandle::spawn(cfg, globals.hostname());
            (cfg.ship_logs, handle)
        });
    let log_layer = logstash
        .as_ref()
        .filter(|(ship_logs, _)| *ship_logs)
        .map(|(_, handle)| LogstashLayer::new(handle.clone()));

    // Initialize tracing
    let tracer = telemetry::init_tracing(log_layer, config.tracing.as_ref())?;

    tracing::info!("Netpulse - Network Throughput Sampler");
    tracing::info!("Loaded configuration from: {}", cli.config);

    // Initialize metrics
    let metrics = telemetry::init_metrics()?;

    if config.metrics_server.enabled {
        let app = create_router(AppState {
            registry: metrics.registry.clone(),
            hostname: globals.hostname().to_string(),
        });
        let addr: SocketAddr = format!(
            "{}:{}",
            config.metrics_server.bind, config.metrics_server.port
        )
        .parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Metrics server listening on: http://{}/metrics", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    // Build sinks
    let mut sinks = SinkSet::new();
    if let Some(influx) = &config.sinks.influxdb {
        sinks = sinks.with_sink(InfluxSink::new(influx)?);
    }
    if config.sinks.otel.enabled {
        sinks = sinks.with_sink(OtelSink::global());
    }
    if let Some((_, handle)) = &logstash {
        sinks = sinks.with_sink(LogstashSink::new(handle.clone()));
    }
    if sinks.is_empty() {
        tracing::warn!("No sinks configured, measurements will only be logged");
    }

    // Build probes
    let storage = StorageProbe::new(config.probes.storage.clone())?;
    let speedtest = SpeedtestProbe::new(config.probes.speedtest.clone())?;

    let sampler = Sampler::new(
        Box::new(storage),
        Box::new(speedtest),
        sinks,
        globals,
        config.sampler.clone(),
    );

    if cli.once {
        let report = sampler.run_once().await?;
        tracing::info!(
            storage = report.storage.is_published(),
            speedtest = report.speedtest.is_published(),
            "Single cycle complete"
        );
    } else {
        tracing::info!("Press Ctrl+C to shutdown");
        tokio::select! {
            result = sampler.run() => result?,
            _ = shutdown_signal() => {}
        }
    }

    if let Err(e) = metrics.shutdown() {
        tracing::warn!(error = %e, "Failed to shutdown meter provider");
    }
    if let Some(tracer) = &tracer {
        if let Err(e) = telemetry::shutdown_tracer(tracer) {
            tracing::warn!(error = %e, "Failed to shutdown tracer provider");
        }
    }
    if let Some((_, handle)) = &logstash {
        if let Err(e) = handle.flush(SHUTDOWN_DRAIN_TIMEOUT).await {
            tracing::warn!(error = %e, "Queued logstash events were not delivered");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
