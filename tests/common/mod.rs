//! Shared test infrastructure for convergence tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use paddock::config::Config;
use paddock::core::Core;
use paddock::supervisor::Supervisor;
use paddock::workload::{WorkloadEvent, WorkloadSnapshot};

// --- Constants ---

pub const DNS_DOMAIN: &str = "my.local.env";
pub const LB_DOMAIN: &str = "my.local.env";
pub const SELF_ID: &str = "docker:selfcafe";
pub const SELF_IP: &str = "172.17.0.1";

/// Static proxy template used by every test.
pub const TEMPLATE: &str = "global\n    daemon\n\nfrontend http-in\n    bind *:80\n";

// --- RecordingSupervisor ---

/// A supervision call observed by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ReloadDns,
    RestartDns,
    ReloadProxy(PathBuf),
}

/// Records supervision commands instead of signalling processes.
#[derive(Default)]
pub struct RecordingSupervisor {
    calls: Mutex<Vec<Call>>,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == call)
            .count()
    }

    pub fn proxy_reloads(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::ReloadProxy(_)))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Supervisor for RecordingSupervisor {
    fn reload_dns(&self) -> std::io::Result<()> {
        self.calls.lock().unwrap().push(Call::ReloadDns);
        Ok(())
    }

    fn restart_dns(&self) -> std::io::Result<()> {
        self.calls.lock().unwrap().push(Call::RestartDns);
        Ok(())
    }

    fn reload_proxy(&self, config_path: &Path) -> std::io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::ReloadProxy(config_path.to_path_buf()));
        Ok(())
    }
}

// --- Core builder ---

/// A core wired to a temp directory and a recording supervisor.
pub struct TestCore {
    pub core: Core,
    pub supervisor: Arc<RecordingSupervisor>,
    pub dir: TempDir,
}

impl TestCore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let template_path = dir.path().join("haproxy.cfg.template");
        std::fs::write(&template_path, TEMPLATE).expect("write template");

        let config = Config {
            dns_domain: DNS_DOMAIN.to_string(),
            lb_domain: LB_DOMAIN.to_string(),
            haproxy_config_template: template_path,
            haproxy_config_file: dir.path().join("haproxy.cfg"),
            dnsmasq_hosts_file: dir.path().join("hosts"),
            dnsmasq_wildcards_file: dir.path().join("wildcards.conf"),
            ..Config::default()
        };

        let supervisor = Arc::new(RecordingSupervisor::new());
        let core = Core::new(
            &config,
            Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            SELF_ID.to_string(),
            SELF_IP.to_string(),
        )
        .expect("core creation");

        // Same as daemon startup: make the output files exist before any
        // event arrives.
        core.regenerate();

        Self {
            core,
            supervisor,
            dir,
        }
    }

    pub fn start(&self, ws: WorkloadSnapshot) {
        self.core.apply(WorkloadEvent::Start(ws));
    }

    pub fn stop(&self, source_id: &str) {
        self.core.apply(WorkloadEvent::Stop(source_id.to_string()));
    }

    pub fn hosts(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("hosts")).expect("read hosts")
    }

    pub fn wildcards(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("wildcards.conf")).expect("read wildcards")
    }

    pub fn proxy_config(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("haproxy.cfg")).expect("read proxy config")
    }

    pub fn template_path(&self) -> PathBuf {
        self.dir.path().join("haproxy.cfg.template")
    }
}

impl Default for TestCore {
    fn default() -> Self {
        Self::new()
    }
}

// --- Snapshot builders ---

pub fn container(id: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> WorkloadSnapshot {
    container_with_hostname(id, name, name, ip, labels)
}

pub fn container_with_hostname(
    id: &str,
    name: &str,
    hostname: &str,
    ip: &str,
    labels: &[(&str, &str)],
) -> WorkloadSnapshot {
    WorkloadSnapshot {
        source_id: format!("docker:{id}"),
        name: name.to_string(),
        hostname: hostname.to_string(),
        ip: ip.to_string(),
        network: "bridge".to_string(),
        labels: to_labels(labels),
    }
}

pub fn to_labels(labels: &[(&str, &str)]) -> HashMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
