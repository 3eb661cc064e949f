//! Metrics instrumentation for paddock.
//!
//! All metrics are prefixed with `paddock.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a workload lifecycle event.
pub fn record_event(source: &'static str, kind: EventType) {
    let kind_str = match kind {
        EventType::Start => "start",
        EventType::Stop => "stop",
        EventType::Dropped => "dropped",
    };

    counter!("paddock.event.count", "source" => source, "kind" => kind_str).increment(1);
}

/// Workload event types.
#[derive(Debug, Clone, Copy)]
pub enum EventType {
    /// Workload started (or restarted).
    Start,
    /// Workload stopped.
    Stop,
    /// Event observed but dropped (irrelevant lifecycle code, missing IP).
    Dropped,
}

/// Record a downstream reload.
pub fn record_reload(target: ReloadTarget) {
    let target_str = match target {
        ReloadTarget::DnsReload => "dns_reload",
        ReloadTarget::DnsRestart => "dns_restart",
        ReloadTarget::Proxy => "proxy",
    };

    counter!("paddock.reload.count", "target" => target_str).increment(1);
}

/// Downstream reload targets.
#[derive(Debug, Clone, Copy)]
pub enum ReloadTarget {
    /// Resolver told to re-read its hosts file.
    DnsReload,
    /// Resolver fully restarted (wildcards changed).
    DnsRestart,
    /// Proxy gracefully reloaded.
    Proxy,
}

/// Record the duration of a full generation cycle (both generators).
pub fn record_generate_duration(duration: std::time::Duration) {
    histogram!("paddock.generate.duration.seconds").record(duration.as_secs_f64());
}

/// Record model table sizes (call on change or periodically).
pub fn record_state_counts(dns_entries: usize, lb_entries: usize, synthetic_hosts: usize) {
    gauge!("paddock.state.dns_entries.count").set(dns_entries as f64);
    gauge!("paddock.state.lb_entries.count").set(lb_entries as f64);
    gauge!("paddock.state.synthetic_hosts.count").set(synthetic_hosts as f64);
}

/// Record a VM IP-resolution attempt outcome.
pub fn record_ip_resolution(outcome: IpResolutionOutcome) {
    let outcome_str = match outcome {
        IpResolutionOutcome::Agent => "agent",
        IpResolutionOutcome::Lease => "lease",
        IpResolutionOutcome::Timeout => "timeout",
    };

    counter!("paddock.ip_resolution.count", "outcome" => outcome_str).increment(1);
}

/// How a VM's IP was (or was not) obtained.
#[derive(Debug, Clone, Copy)]
pub enum IpResolutionOutcome {
    /// QEMU guest agent reported the address.
    Agent,
    /// DHCP lease table reported the address.
    Lease,
    /// No address within the configured timeout.
    Timeout,
}

/// Record a container inspection cache hit or miss.
pub fn record_inspect_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("paddock.inspect_cache.count", "result" => result).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
