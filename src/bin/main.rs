//! paddock binary entry point.

use clap::Parser;
use paddock::{telemetry, Config, Daemon};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Service-discovery daemon feeding dnsmasq and HAProxy from container
/// and VM lifecycle events.
#[derive(Parser, Debug)]
#[command(name = "paddock")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to an optional configuration file (TOML). Environment
    /// variables (DNS_DOMAIN, DOCKER_SOCKET, ...) take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.clone()));
    }
    let config: Config = builder
        .add_source(config::Environment::default().separator("__").try_parsing(true))
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        dns_domain = %config.dns_domain,
        lb_domain = %config.lb_domain,
        docker_socket = %config.docker_socket,
        libvirt_socket = %config.libvirt_socket.display(),
        "Starting paddock"
    );

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        signal_cancel.cancel();
    });

    // Run daemon
    let daemon = Daemon::new(config);
    let result = daemon.run(cancel).await;

    if let Err(e) = result {
        error!("daemon error: {e}");
        return Err(e.into());
    }

    info!("paddock shutdown complete");
    Ok(())
}
