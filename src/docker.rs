//! Container source adapter backed by the Docker daemon.
//!
//! Enumerates running containers at startup, then follows the global event
//! stream (`start`/`die`) and feeds normalized [`WorkloadEvent`]s to the
//! core. Inspection results are memoized per container and invalidated on
//! `die`.
//!
//! The adapter is optional: when the Docker socket does not exist the
//! daemon runs without it.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::metrics::{self, EventType};
use crate::workload::{WorkloadEvent, WorkloadSnapshot};

/// Delay before reconnecting after the event stream drops.
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Docker source adapter.
pub struct DockerAdapter {
    docker: Docker,
    self_ip: String,
    self_hostname: String,
    cache: Mutex<HashMap<String, ContainerInspectResponse>>,
}

impl DockerAdapter {
    /// Connect to the Docker daemon at `socket` (a `unix://` URL).
    ///
    /// Returns `Ok(None)` when the socket path does not exist, which turns
    /// the adapter into a no-op.
    pub async fn connect(
        socket: &str,
        self_ip: &str,
        self_hostname: &str,
    ) -> Result<Option<Self>, Error> {
        let path = socket.strip_prefix("unix://").unwrap_or(socket);
        if !Path::new(path).exists() {
            info!(socket = %socket, "Docker socket not present, container adapter disabled");
            return Ok(None);
        }

        let docker = Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)?;
        // Fail fast on an unreachable daemon rather than at first use.
        docker.ping().await?;

        Ok(Some(Self {
            docker,
            self_ip: self_ip.to_string(),
            self_hostname: self_hostname.to_string(),
            cache: Mutex::new(HashMap::new()),
        }))
    }

    /// Inspect a container, going through the memoization cache.
    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, Error> {
        if let Some(cached) = self.cache.lock().get(id) {
            metrics::record_inspect_cache(true);
            return Ok(cached.clone());
        }
        metrics::record_inspect_cache(false);

        let detail = self.docker.inspect_container(id, None).await?;
        self.cache.lock().insert(id.to_string(), detail.clone());
        Ok(detail)
    }

    /// Drop a container from the inspection cache.
    fn invalidate(&self, id: &str) {
        self.cache.lock().remove(id);
    }

    /// Convert an inspection result into a snapshot. Returns `None` when
    /// the container has no usable IPv4 address.
    fn snapshot_from_inspect(&self, detail: &ContainerInspectResponse) -> Option<WorkloadSnapshot> {
        let id = detail.id.as_deref()?;
        let name = detail
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or(id)
            .to_string();
        let config = detail.config.as_ref()?;
        let hostname = config.hostname.clone().unwrap_or_else(|| name.clone());
        let labels = config.labels.clone().unwrap_or_default();

        let (network, ip) = container_address(detail, &self.self_ip)?;

        Some(WorkloadSnapshot {
            source_id: format!("docker:{id}"),
            name,
            hostname,
            ip,
            network,
            labels,
        })
    }

    /// List all running containers as snapshots. Containers without an IP
    /// are logged and skipped.
    pub async fn enumerate(&self) -> Result<Vec<WorkloadSnapshot>, Error> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut snapshots = Vec::new();
        for summary in containers {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(detail) => match self.snapshot_from_inspect(&detail) {
                    Some(ws) => snapshots.push(ws),
                    None => {
                        warn!(container = %id, "container has no IPv4 address, skipping")
                    }
                },
                Err(e) => warn!(container = %id, "failed to inspect container: {e}"),
            }
        }
        Ok(snapshots)
    }

    /// Find the daemon's own container among the running ones by matching
    /// its host name and primary IPv4. Fatal when absent: without its own
    /// `source_id` the daemon cannot own the synthetic DNS namespace.
    pub async fn self_identify(&self) -> Result<WorkloadSnapshot, Error> {
        for ws in self.enumerate().await? {
            if ws.hostname == self.self_hostname && ws.ip == self.self_ip {
                info!(source_id = %ws.source_id, "identified own container");
                return Ok(ws);
            }
        }

        Err(Error::SelfIdentification {
            hostname: self.self_hostname.clone(),
            ip: self.self_ip.clone(),
        })
    }

    /// Follow the Docker event stream until cancelled, sending `Start` and
    /// `Stop` events. Reconnects (and re-enumerates, to resynchronize)
    /// when the stream ends unexpectedly.
    pub async fn run(&self, tx: mpsc::Sender<WorkloadEvent>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!("container event loop shutting down");
                return;
            }

            let opts = EventsOptions::<String> {
                filters: [
                    ("type", vec!["container"]),
                    ("event", vec!["start", "die"]),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };
            let mut stream = self.docker.events(Some(opts));

            info!("listening for container events");
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("container event loop shutting down");
                        return;
                    }

                    message = stream.next() => {
                        match message {
                            Some(Ok(event)) => {
                                if self.handle_event(event, &tx).await.is_err() {
                                    // Channel closed: the core is gone.
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                error!("container event stream error: {e}");
                                break;
                            }
                            None => {
                                warn!("container event stream ended");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;

            // Resynchronize: events may have been missed while detached.
            match self.enumerate().await {
                Ok(snapshots) => {
                    for ws in snapshots {
                        if tx.send(WorkloadEvent::Start(ws)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("re-enumeration after reconnect failed: {e}"),
            }
        }
    }

    async fn handle_event(
        &self,
        event: bollard::models::EventMessage,
        tx: &mpsc::Sender<WorkloadEvent>,
    ) -> Result<(), ()> {
        let Some(id) = event.actor.and_then(|a| a.id) else {
            return Ok(());
        };
        let action = event.action.unwrap_or_default();
        debug!(container = %id, action = %action, "container event");

        match action.as_str() {
            "start" => {
                // A restarted container can change its address; inspect fresh.
                self.invalidate(&id);
                match self.inspect(&id).await {
                    Ok(detail) => match self.snapshot_from_inspect(&detail) {
                        Some(ws) => {
                            metrics::record_event("docker", EventType::Start);
                            tx.send(WorkloadEvent::Start(ws)).await.map_err(|_| ())?;
                        }
                        None => {
                            metrics::record_event("docker", EventType::Dropped);
                            warn!(container = %id, "started container has no IPv4 address, skipping");
                        }
                    },
                    Err(e) => {
                        metrics::record_event("docker", EventType::Dropped);
                        warn!(container = %id, "failed to inspect started container: {e}");
                    }
                }
            }
            "die" => {
                self.invalidate(&id);
                metrics::record_event("docker", EventType::Stop);
                tx.send(WorkloadEvent::Stop(format!("docker:{id}")))
                    .await
                    .map_err(|_| ())?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// Pick the container's primary network and IPv4. A container in `host`
/// network mode reports the daemon's own address.
fn container_address(
    detail: &ContainerInspectResponse,
    self_ip: &str,
) -> Option<(String, String)> {
    let networks = detail.network_settings.as_ref()?.networks.as_ref()?;

    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();

    for name in names {
        if name == "host" {
            return Some(("host".to_string(), self_ip.to_string()));
        }
        if let Some(ip) = networks.get(name).and_then(|n| n.ip_address.as_ref()) {
            if !ip.is_empty() {
                return Some((name.clone(), ip.clone()));
            }
        }
    }
    None
}
