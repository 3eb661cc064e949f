//! Workload snapshots and lifecycle events.
//!
//! Both source adapters (Docker, libvirt) normalize what they see into
//! [`WorkloadSnapshot`] values and feed [`WorkloadEvent`]s to the
//! convergence core. The label schema is closed: the six keys below are
//! recognized, everything else is ignored.

use std::collections::HashMap;

/// Label key for the workload's DNS domain.
pub const LABEL_DNS_DOMAIN: &str = "dns.domain";
/// Label key enabling wildcard records for the workload.
pub const LABEL_DNS_WILDCARD: &str = "dns.wildcard";
/// Label key holding comma-separated DNS aliases.
pub const LABEL_DNS_ALIASES: &str = "dns.aliases";
/// Label key for the domain of load-balanced hosts.
pub const LABEL_LB_DOMAIN: &str = "lb.domain";
/// Label key holding comma-separated `HOST:PORT` HTTP services.
pub const LABEL_LB_HTTP: &str = "lb.http";
/// Label key holding comma-separated `HOST[:FRONT]:BACK` TCP services.
pub const LABEL_LB_TCP: &str = "lb.tcp";

/// Uniform record produced by any source adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    /// Origin-qualified identifier (`docker:<hex>`, `libvirt:<uuid>`).
    /// Unique per live workload; primary key in the model.
    pub source_id: String,
    /// Administrative name.
    pub name: String,
    /// Workload-declared host name (may equal `name`).
    pub hostname: String,
    /// Primary IPv4 address as dotted-quad string.
    pub ip: String,
    /// Network-interface label (informational).
    pub network: String,
    /// Raw label map.
    pub labels: HashMap<String, String>,
}

impl WorkloadSnapshot {
    /// DNS domain for this workload, falling back to `default`.
    pub fn dns_domain<'a>(&'a self, default: &'a str) -> &'a str {
        self.labels
            .get(LABEL_DNS_DOMAIN)
            .map(|s| s.as_str())
            .unwrap_or(default)
    }

    /// Whether wildcard records were requested, falling back to `default`.
    pub fn dns_wildcard(&self, default: bool) -> bool {
        self.labels
            .get(LABEL_DNS_WILDCARD)
            .map(|v| truthy(v))
            .unwrap_or(default)
    }

    /// Parsed `dns.aliases` list (may be empty).
    pub fn dns_aliases(&self) -> Vec<String> {
        self.labels
            .get(LABEL_DNS_ALIASES)
            .map(|v| comma_list(v))
            .unwrap_or_default()
    }

    /// Domain for load-balanced hosts, falling back to `default`.
    pub fn lb_domain<'a>(&'a self, default: &'a str) -> &'a str {
        self.labels
            .get(LABEL_LB_DOMAIN)
            .map(|s| s.as_str())
            .unwrap_or(default)
    }

    /// Raw `lb.http` entries (unparsed `HOST:PORT` strings).
    pub fn lb_http(&self) -> Vec<String> {
        self.labels
            .get(LABEL_LB_HTTP)
            .map(|v| comma_list(v))
            .unwrap_or_default()
    }

    /// Raw `lb.tcp` entries (unparsed `HOST[:FRONT]:BACK` strings).
    pub fn lb_tcp(&self) -> Vec<String> {
        self.labels
            .get(LABEL_LB_TCP)
            .map(|v| comma_list(v))
            .unwrap_or_default()
    }
}

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Workload started (or was re-announced).
    Start,
    /// Workload stopped.
    Stop,
}

/// A lifecycle event routed to the convergence core.
#[derive(Debug, Clone)]
pub enum WorkloadEvent {
    /// A workload is up with the given snapshot.
    Start(WorkloadSnapshot),
    /// The workload with this `source_id` is gone.
    Stop(String),
}

/// Truthy label values: `1`, `true`, `yes` (case-insensitive).
pub fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Split a comma-separated label value, trimming whitespace and dropping
/// empty items.
pub fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
