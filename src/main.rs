//! Prometheus exporter that runs configured probe commands on demand.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use probe_script_exporter::{ConfigStore, HttpServer, ProcessMetrics};

/// Run configured probe commands and export the results as Prometheus gauges.
#[derive(Parser, Debug)]
#[command(name = "probe-script-exporter")]
#[command(about = "Export probe command results as Prometheus gauges")]
#[command(version)]
struct Args {
    /// Folder holding YAML probe declaration files.
    #[arg(short = 'c', long, default_value = "/etc/probe-script-exporter")]
    config_dir: PathBuf,

    /// IP to listen on, overrides the config files. Empty means all
    /// available addresses.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overrides the config files.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Show verbose output.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // An inconsistent configuration refuses to serve; the loader returns
    // the error and only this entry point turns it into an exit.
    let mut config = ConfigStore::load_dir(&args.config_dir)?;
    config.apply_overrides(args.host, args.port);

    let listen_addr: SocketAddr = config
        .server
        .listen_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    info!(probes = config.probes.len(), "Starting probe script exporter");

    let config = Arc::new(config);
    let metrics = Arc::new(ProcessMetrics::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(config, metrics, listen_addr);
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!("Exporter stopped");
    Ok(())
}
