//! # vepline
//!
//! Binary: loads settings, installs logging, assembles the annotation
//! pipeline and serves it over WebSocket and HTTP until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vepline_annotator::{ReliableAnnotator, ReliableConfig, VepClient};
use vepline_engine::Pipeline;
use vepline_server::ServerConfig;
use vepline_settings::{load_settings_from_path, settings_path, LogFormat};
use vepline_telemetry::{init_telemetry, PipelineMetrics};

/// Genetic sequence annotation server.
#[derive(Parser, Debug)]
#[command(name = "vepline", about = "Session-correlated genetic annotation server")]
struct Cli {
    /// Settings file (defaults to ~/.vepline/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Human-readable logs instead of JSON.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if cli.pretty {
        settings.telemetry.format = LogFormat::Pretty;
    }

    let telemetry = init_telemetry(&settings.telemetry);
    tracing::info!(
        settings = %path.display(),
        filter = telemetry.filter(),
        "starting vepline"
    );

    let client = VepClient::new(&settings.annotator).context("failed to build annotation client")?;
    let annotator = Arc::new(ReliableAnnotator::new(
        Arc::new(client),
        ReliableConfig::from(&settings.reliability),
    ));
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Arc::new(Pipeline::new(&settings, annotator, metrics));

    let cancel = CancellationToken::new();
    let tasks = pipeline
        .start(cancel.clone())
        .context("failed to start pipeline")?;

    let server = vepline_server::start(
        ServerConfig::from(&settings.server),
        pipeline.clone(),
        cancel.clone(),
    )
    .await
    .context("failed to start server")?;
    tracing::info!(addr = %server.addr, "vepline ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    let health = pipeline.health();
    tracing::info!(
        delivered = health.metrics.delivered,
        dropped = health.metrics.dropped,
        in_flight = health.in_flight_heartbeats,
        "pipeline stopped"
    );
    Ok(())
}
