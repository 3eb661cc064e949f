//! In-memory model of DNS and load-balancer entries.
//!
//! Two disjoint tables keyed by `source_id`, plus a synthetic key namespace
//! (`<self_id>_<host>`) for DNS entries induced by the load-balancer
//! generator. The model is pure data: all I/O and locking live in the
//! convergence core.

use std::collections::HashMap;

use crate::workload::WorkloadSnapshot;

/// A resolver entry for one workload (or one synthetic LB host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    /// Workload-declared host name.
    pub hostname: String,
    /// IPv4 address the names resolve to.
    pub ip: String,
    /// Network-interface label (informational).
    pub network: String,
    /// DNS domain the names live under.
    pub domain: String,
    /// Administrative name.
    pub name: String,
    /// Extra names on the hosts line.
    pub aliases: Vec<String>,
    /// Whether wildcard records are emitted for this entry.
    pub use_wildcard: bool,
    /// Number of holders asserting this entry. Only synthetic entries are
    /// ever shared; workload entries stay at 1.
    pub refcount: usize,
}

/// A load-balancer entry for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbEntry {
    /// Workload-declared host name (used as the backend server name).
    pub hostname: String,
    /// Backend IPv4 address.
    pub ip: String,
    /// Domain for the synthetic DNS names of this entry's hosts.
    pub domain: String,
    /// Raw `HOST:PORT` HTTP service declarations.
    pub http_entries: Vec<String>,
    /// Raw `HOST[:FRONT]:BACK` TCP service declarations.
    pub tcp_entries: Vec<String>,
}

/// The authoritative in-memory model.
#[derive(Debug, Default)]
pub struct Model {
    dns: HashMap<String, DnsEntry>,
    lb: HashMap<String, LbEntry>,
}

impl Model {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) both entries for a workload snapshot.
    ///
    /// `dns_domain`, `lb_domain` and `wildcard_default` supply the values
    /// used when the corresponding label is absent.
    pub fn register(
        &mut self,
        ws: &WorkloadSnapshot,
        dns_domain: &str,
        lb_domain: &str,
        wildcard_default: bool,
    ) {
        let dns = DnsEntry {
            hostname: ws.hostname.clone(),
            ip: ws.ip.clone(),
            network: ws.network.clone(),
            domain: ws.dns_domain(dns_domain).to_string(),
            name: ws.name.clone(),
            aliases: ws.dns_aliases(),
            use_wildcard: ws.dns_wildcard(wildcard_default),
            refcount: 1,
        };
        let lb = LbEntry {
            hostname: ws.hostname.clone(),
            ip: ws.ip.clone(),
            domain: ws.lb_domain(lb_domain).to_string(),
            http_entries: ws.lb_http(),
            tcp_entries: ws.lb_tcp(),
        };

        self.dns.insert(ws.source_id.clone(), dns);
        self.lb.insert(ws.source_id.clone(), lb);
    }

    /// Remove both entries for a workload. Returns true if anything was
    /// removed.
    pub fn deregister(&mut self, source_id: &str) -> bool {
        let had_dns = self.dns.remove(source_id).is_some();
        let had_lb = self.lb.remove(source_id).is_some();
        had_dns || had_lb
    }

    /// Add a reference-counted DNS entry under a synthetic key. If the key
    /// already exists the refcount is bumped and the stored entry kept.
    pub fn add_dns_ref(&mut self, key: &str, entry: DnsEntry) {
        match self.dns.get_mut(key) {
            Some(existing) => existing.refcount += 1,
            None => {
                self.dns.insert(key.to_string(), entry);
            }
        }
    }

    /// Drop one reference from a DNS entry, removing it when the refcount
    /// reaches zero.
    pub fn drop_dns_ref(&mut self, key: &str) {
        if let Some(entry) = self.dns.get_mut(key) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                self.dns.remove(key);
            }
        }
    }

    /// Remove every DNS entry whose key starts with `prefix`. Used by the
    /// LB generator to flush its synthetic namespace before rebuilding it.
    pub fn flush_dns_prefix(&mut self, prefix: &str) {
        self.dns.retain(|key, _| !key.starts_with(prefix));
    }

    /// DNS entries sorted by key, for deterministic rendering.
    pub fn dns_entries_sorted(&self) -> Vec<(&String, &DnsEntry)> {
        let mut entries: Vec<_> = self.dns.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// LB entries sorted by key, for deterministic rendering.
    pub fn lb_entries_sorted(&self) -> Vec<(&String, &LbEntry)> {
        let mut entries: Vec<_> = self.lb.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Look up a DNS entry by key.
    pub fn dns_entry(&self, key: &str) -> Option<&DnsEntry> {
        self.dns.get(key)
    }

    /// Number of DNS entries (workload + synthetic).
    pub fn dns_count(&self) -> usize {
        self.dns.len()
    }

    /// Number of LB entries.
    pub fn lb_count(&self) -> usize {
        self.lb.len()
    }

    /// Number of DNS entries under the given synthetic prefix.
    pub fn synthetic_count(&self, prefix: &str) -> usize {
        self.dns.keys().filter(|k| k.starts_with(prefix)).count()
    }
}
