//! DNS generator: projects the model onto the resolver's hosts and
//! wildcards files.
//!
//! The hosts file carries one line per entry, FQDN first so the resolver
//! uses it for reverse lookups. The wildcards file carries one
//! `address=/<host>/<ip>` line per name of every wildcard entry; dnsmasq
//! only reads it at startup, so a change there triggers a restart instead
//! of a reload.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::metrics::{self, ReloadTarget};
use crate::model::{DnsEntry, Model};
use crate::supervisor::Supervisor;

/// Strip a wildcard or dot prefix from an alias.
fn normalize_alias(alias: &str) -> &str {
    if let Some(s) = alias.strip_prefix("*.") {
        s
    } else if let Some(s) = alias.strip_prefix('.') {
        s
    } else if let Some(s) = alias.strip_prefix('*') {
        s
    } else {
        alias
    }
}

/// Qualified form of an alias, collapsing `alias.domain.domain`.
fn alias_fqdn(alias: &str, domain: &str) -> String {
    let suffix = format!(".{domain}");
    if alias.ends_with(&suffix) {
        alias.to_string()
    } else {
        format!("{alias}{suffix}")
    }
}

/// All names of an entry, FQDN first, deduplicated in order.
pub fn host_names(entry: &DnsEntry) -> Vec<String> {
    let mut names = vec![
        format!("{}.{}", entry.hostname, entry.domain),
        entry.hostname.clone(),
        format!("{}.{}", entry.name, entry.domain),
        entry.name.clone(),
    ];

    for alias in &entry.aliases {
        let alias = normalize_alias(alias);
        names.push(alias.to_string());
        names.push(alias_fqdn(alias, &entry.domain));
    }

    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
    names
}

/// Render the hosts file: `<ip> <name> [<name> ...]` per entry.
pub fn render_hosts(model: &Model) -> String {
    let mut out = String::new();
    for (_, entry) in model.dns_entries_sorted() {
        out.push_str(&entry.ip);
        for name in host_names(entry) {
            out.push(' ');
            out.push_str(&name);
        }
        out.push('\n');
    }
    out
}

/// Render the wildcards file: `address=/<host>/<ip>` per name of every
/// wildcard entry.
pub fn render_wildcards(model: &Model) -> String {
    let mut out = String::new();
    for (_, entry) in model.dns_entries_sorted() {
        if !entry.use_wildcard {
            continue;
        }
        for name in host_names(entry) {
            out.push_str("address=/");
            out.push_str(&name);
            out.push('/');
            out.push_str(&entry.ip);
            out.push('\n');
        }
    }
    out
}

/// Writes the two resolver files and signals the resolver on change.
pub struct DnsGenerator {
    hosts_path: PathBuf,
    wildcards_path: PathBuf,
    last_hosts: Option<String>,
    last_wildcards: Option<String>,
}

impl DnsGenerator {
    /// Create a generator writing to the given paths.
    pub fn new(hosts_path: PathBuf, wildcards_path: PathBuf) -> Self {
        Self {
            hosts_path,
            wildcards_path,
            last_hosts: None,
            last_wildcards: None,
        }
    }

    /// Regenerate both files from the model. Each file is rewritten (and
    /// the resolver signaled) only when its text differs from the last
    /// successfully written content; the two diffs are independent.
    ///
    /// Failures are logged, never propagated: the next event retries.
    pub fn generate(&mut self, model: &Model, supervisor: &dyn Supervisor) {
        let hosts = render_hosts(model);
        if self.last_hosts.as_deref() != Some(hosts.as_str()) {
            match self.write_and_reload(&hosts, supervisor) {
                Ok(()) => {
                    info!(
                        path = %self.hosts_path.display(),
                        entries = model.dns_count(),
                        "hosts file updated, resolver reloaded"
                    );
                    self.last_hosts = Some(hosts);
                }
                Err(e) => error!(path = %self.hosts_path.display(), "hosts update failed: {e}"),
            }
        } else {
            debug!("hosts file unchanged");
        }

        let wildcards = render_wildcards(model);
        if self.last_wildcards.as_deref() != Some(wildcards.as_str()) {
            match self.write_and_restart(&wildcards, supervisor) {
                Ok(()) => {
                    info!(
                        path = %self.wildcards_path.display(),
                        "wildcards file updated, resolver restarted"
                    );
                    self.last_wildcards = Some(wildcards);
                }
                Err(e) => {
                    error!(path = %self.wildcards_path.display(), "wildcards update failed: {e}")
                }
            }
        } else {
            debug!("wildcards file unchanged");
        }
    }

    fn write_and_reload(&self, text: &str, supervisor: &dyn Supervisor) -> std::io::Result<()> {
        fs::write(&self.hosts_path, text)?;
        supervisor.reload_dns()?;
        metrics::record_reload(ReloadTarget::DnsReload);
        Ok(())
    }

    fn write_and_restart(&self, text: &str, supervisor: &dyn Supervisor) -> std::io::Result<()> {
        fs::write(&self.wildcards_path, text)?;
        supervisor.restart_dns()?;
        metrics::record_reload(ReloadTarget::DnsRestart);
        Ok(())
    }
}
