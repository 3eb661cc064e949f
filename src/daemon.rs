//! Daemon lifecycle: adapter wiring, startup enumeration and the event
//! loop.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::core::Core;
use crate::docker::DockerAdapter;
use crate::error::Error;
use crate::libvirt::LibvirtAdapter;
use crate::supervisor::{Supervisor, SystemSupervisor};
use crate::workload::{WorkloadEvent, WorkloadSnapshot};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit state gauges.
async fn metrics_loop(core: Arc<Core>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                core.emit_metrics();
                debug!(
                    dns_entries = core.dns_count(),
                    lb_entries = core.lb_count(),
                    synthetic = core.synthetic_count(),
                    "emitted state metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Detect the daemon's primary IPv4 address by asking the kernel which
/// local address would route towards the internet. No packet is sent.
fn detect_primary_ipv4() -> Result<String, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| Error::SelfAddress(e.to_string()))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| Error::SelfAddress(e.to_string()))?;
    let addr = socket
        .local_addr()
        .map_err(|e| Error::SelfAddress(e.to_string()))?;

    match addr.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip.to_string()),
        other => Err(Error::SelfAddress(format!("got non-IPv4 address {other}"))),
    }
}

/// The daemon's host name, as the runtime sees it.
fn own_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// The service-discovery daemon.
pub struct Daemon {
    config: Config,
    supervisor: Arc<dyn Supervisor>,
}

impl Daemon {
    /// Create a daemon with the production supervisor.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            supervisor: Arc::new(SystemSupervisor::new()),
        }
    }

    /// Create a daemon with a custom supervisor (used by tests).
    pub fn with_supervisor(config: Config, supervisor: Arc<dyn Supervisor>) -> Self {
        Self { config, supervisor }
    }

    /// Run until the token is cancelled (SIGINT/SIGTERM in production).
    ///
    /// Startup is where the fatal errors live: failing to detect the
    /// daemon's own address, failing to identify its own container while
    /// Docker is present, or an unreadable proxy template. Everything
    /// after that is logged and retried on subsequent events.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let self_ip = match &self.config.external_ip {
            Some(ip) => ip.clone(),
            None => detect_primary_ipv4()?,
        };
        let self_hostname = own_hostname();
        info!(ip = %self_ip, hostname = %self_hostname, "daemon identity");

        let docker =
            DockerAdapter::connect(&self.config.docker_socket, &self_ip, &self_hostname).await?;

        // The daemon needs its own source_id to own the synthetic DNS
        // namespace. With Docker present it must find its own container;
        // without Docker a local identity is enough.
        let self_snapshot = match &docker {
            Some(adapter) => adapter.self_identify().await?,
            None => WorkloadSnapshot {
                source_id: format!("local:{self_hostname}"),
                name: self_hostname.clone(),
                hostname: self_hostname.clone(),
                ip: self_ip.clone(),
                network: "host".to_string(),
                labels: Default::default(),
            },
        };
        let self_id = self_snapshot.source_id.clone();

        let core = Arc::new(Core::new(
            &self.config,
            Arc::clone(&self.supervisor),
            self_id.clone(),
            self_ip.clone(),
        )?);

        // The daemon announces itself first so its own name resolves.
        core.apply(WorkloadEvent::Start(self_snapshot));

        let (tx, mut rx) = mpsc::channel::<WorkloadEvent>(128);

        // Container adapter: enumerate on the main task, then stream.
        if let Some(adapter) = docker {
            let snapshots = adapter.enumerate().await?;
            info!(count = snapshots.len(), "initial container enumeration");
            for ws in snapshots {
                if ws.source_id != self_id {
                    core.apply(WorkloadEvent::Start(ws));
                }
            }

            let adapter = Arc::new(adapter);
            let events_tx = tx.clone();
            let events_cancel = cancel.clone();
            tokio::spawn(async move {
                adapter.run(events_tx, events_cancel).await;
            });
        }

        // VM adapter: the hypervisor client is blocking, so it owns a
        // dedicated thread (it announces running domains itself).
        if let Some(adapter) =
            LibvirtAdapter::detect(&self.config.libvirt_socket, self.config.libvirt_ip_timeout)
        {
            let events_tx = tx.clone();
            let events_cancel = cancel.clone();
            std::thread::spawn(move || {
                adapter.run(events_tx, events_cancel);
            });
        }

        // `tx` stays alive so the loop below keeps running even with zero
        // active adapters.

        // Make sure both downstream files exist even before any event.
        core.regenerate();

        let metrics_core = Arc::clone(&core);
        let metrics_cancel = cancel.clone();
        let metrics_handle = tokio::spawn(async move {
            metrics_loop(metrics_core, metrics_cancel).await;
        });

        info!("convergence loop running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => core.apply(event),
                        None => {
                            error!("all event producers gone");
                            break;
                        }
                    }
                }
            }
        }

        let _ = metrics_handle.await;
        info!("daemon stopped");
        Ok(())
    }
}
