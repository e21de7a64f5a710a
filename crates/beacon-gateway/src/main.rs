//! # beacon-gateway
//!
//! Beacon notification server binary: loads settings, wires the stream core
//! into the HTTP server, and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_server::classification::VesselTypeIndex;
use beacon_server::config::ServerConfig;
use beacon_server::metrics;
use beacon_server::server::BeaconServer;
use beacon_settings::BeaconSettings;
use clap::Parser;

/// How long shutdown waits for streams to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Beacon notification server.
#[derive(Parser, Debug)]
#[command(name = "beacon-gateway", about = "Beacon SSE notification server")]
struct Cli {
    /// Settings file (defaults to `~/.beacon/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent streams (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Apply command-line overrides on top of file and env settings.
    fn apply(&self, settings: &mut BeaconSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.stream.max_connections = max;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_settings(cli: &Cli) -> Result<BeaconSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(beacon_settings::settings_path);
    let mut settings = beacon_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn load_classifier(path: &Path) -> Option<VesselTypeIndex> {
    match VesselTypeIndex::load(path) {
        Ok(index) => Some(index),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "vessel type mapping unavailable, screening disabled");
            None
        }
    }
}

fn build_server(settings: &BeaconSettings) -> BeaconServer {
    let mut server = BeaconServer::new(ServerConfig::from(settings));

    match metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "prometheus recorder not installed, /metrics disabled"),
    }

    match settings.classification.vessel_type_mapping_path.as_deref() {
        Some(path) => {
            if let Some(index) = load_classifier(Path::new(path)) {
                server = server.with_classifier(index);
            }
        }
        None => tracing::info!("no vessel type mapping configured, screening disabled"),
    }
    server
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    beacon_core::logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let server = build_server(&settings);
    let background = server
        .spawn_background()
        .context("Failed to start background tasks")?;
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        max_connections = settings.stream.max_connections,
        "Beacon listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown_gracefully(background, Some(SHUTDOWN_TIMEOUT))
        .await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
