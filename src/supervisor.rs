//! Downstream process control.
//!
//! The generators never signal dnsmasq or HAProxy themselves; they go
//! through this capability so tests can substitute a recorder and the
//! deployment can swap supervision systems without touching the core.

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::debug;

/// Opaque commands against the resolver and proxy processes.
///
/// `reload` must trigger a config re-read without dropping in-flight work;
/// `restart` fully respawns the resolver (needed when its wildcards file
/// changes, which dnsmasq only reads at startup).
pub trait Supervisor: Send + Sync {
    /// Ask the resolver to re-read its hosts file (SIGHUP-equivalent).
    fn reload_dns(&self) -> io::Result<()>;

    /// Fully restart the resolver.
    fn restart_dns(&self) -> io::Result<()>;

    /// Gracefully reload the proxy with the given config file.
    fn reload_proxy(&self, config_path: &Path) -> io::Result<()>;
}

/// Production supervisor: shells out to `supervisorctl` for the resolver
/// and to the `haproxy-reload` helper for the proxy. The helper owns the
/// graceful hand-off (keep the newest proxy process, SIGTERM the rest,
/// start a new one with `-sf <pid>`).
pub struct SystemSupervisor {
    dns_service: String,
    proxy_reload_helper: String,
}

impl SystemSupervisor {
    /// Create a supervisor for the default service names.
    pub fn new() -> Self {
        Self {
            dns_service: "dnsmasq".to_string(),
            proxy_reload_helper: "haproxy-reload".to_string(),
        }
    }

    fn run(mut command: Command) -> io::Result<()> {
        debug!(command = ?command, "running supervision command");
        let status = command.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "command {:?} exited with {}",
                command, status
            )))
        }
    }
}

impl Default for SystemSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor for SystemSupervisor {
    fn reload_dns(&self) -> io::Result<()> {
        let mut cmd = Command::new("supervisorctl");
        cmd.args(["signal", "HUP", &self.dns_service]);
        Self::run(cmd)
    }

    fn restart_dns(&self) -> io::Result<()> {
        let mut cmd = Command::new("supervisorctl");
        cmd.args(["restart", &self.dns_service]);
        Self::run(cmd)
    }

    fn reload_proxy(&self, config_path: &Path) -> io::Result<()> {
        let mut cmd = Command::new(&self.proxy_reload_helper);
        cmd.arg(config_path);
        Self::run(cmd)
    }
}
