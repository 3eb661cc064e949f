//! Convergence core: one lock, one model, two generators.
//!
//! Every lifecycle event from any adapter funnels through [`Core::apply`],
//! which holds the single mutex for the whole mutate-and-regenerate cycle.
//! The LB generator runs first so the synthetic DNS entries it maintains
//! are current before the DNS generator renders the hosts file.

use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dns::DnsGenerator;
use crate::error::Error;
use crate::lb::LbGenerator;
use crate::metrics;
use crate::model::Model;
use crate::supervisor::Supervisor;
use crate::workload::WorkloadEvent;

struct CoreInner {
    model: Model,
    dns: DnsGenerator,
    lb: LbGenerator,
}

/// The convergence engine. Cheap to clone via [`Arc`]; all state lives
/// behind one mutex.
pub struct Core {
    inner: Mutex<CoreInner>,
    supervisor: Arc<dyn Supervisor>,
    dns_domain: String,
    lb_domain: String,
    wildcard_default: bool,
    synthetic_prefix: String,
}

impl Core {
    /// Create the core for a daemon with identity `self_id` / `self_ip`.
    ///
    /// Fails when the proxy template cannot be read; a daemon that cannot
    /// assemble a proxy config has nothing to converge.
    pub fn new(
        config: &Config,
        supervisor: Arc<dyn Supervisor>,
        self_id: String,
        self_ip: String,
    ) -> Result<Self, Error> {
        fs::read_to_string(&config.haproxy_config_template).map_err(|source| Error::Template {
            path: config.haproxy_config_template.clone(),
            source,
        })?;

        let lb = LbGenerator::new(
            config.haproxy_config_template.clone(),
            config.haproxy_config_file.clone(),
            self_id,
            self_ip,
        );
        let synthetic_prefix = lb.synthetic_prefix();

        Ok(Self {
            inner: Mutex::new(CoreInner {
                model: Model::new(),
                dns: DnsGenerator::new(
                    config.dnsmasq_hosts_file.clone(),
                    config.dnsmasq_wildcards_file.clone(),
                ),
                lb,
            }),
            supervisor,
            dns_domain: config.dns_domain.clone(),
            lb_domain: config.lb_domain.clone(),
            wildcard_default: config.dns_wildcard,
            synthetic_prefix,
        })
    }

    /// Apply one lifecycle event: mutate the model and run both
    /// generators under the lock.
    pub fn apply(&self, event: WorkloadEvent) {
        let mut inner = self.inner.lock();

        match event {
            WorkloadEvent::Start(ws) => {
                if ws.ip.is_empty() {
                    warn!(source_id = %ws.source_id, name = %ws.name, "workload has no IP, skipping registration");
                    return;
                }
                info!(
                    source_id = %ws.source_id,
                    name = %ws.name,
                    hostname = %ws.hostname,
                    ip = %ws.ip,
                    "registering workload"
                );
                inner.model.register(
                    &ws,
                    &self.dns_domain,
                    &self.lb_domain,
                    self.wildcard_default,
                );
            }
            WorkloadEvent::Stop(source_id) => {
                if inner.model.deregister(&source_id) {
                    info!(source_id = %source_id, "deregistered workload");
                } else {
                    debug!(source_id = %source_id, "stop for unknown workload, ignoring");
                }
            }
        }

        let timer = metrics::Timer::start();
        let CoreInner { model, dns, lb } = &mut *inner;
        lb.generate(model, self.supervisor.as_ref());
        dns.generate(model, self.supervisor.as_ref());
        metrics::record_generate_duration(timer.elapsed());

        metrics::record_state_counts(
            model.dns_count(),
            model.lb_count(),
            model.synthetic_count(&self.synthetic_prefix),
        );
    }

    /// Run one generation cycle without mutating the model. Used at
    /// startup so empty output files exist before any event arrives.
    pub fn regenerate(&self) {
        let mut inner = self.inner.lock();
        let CoreInner { model, dns, lb } = &mut *inner;
        lb.generate(model, self.supervisor.as_ref());
        dns.generate(model, self.supervisor.as_ref());
    }

    /// Number of DNS entries (workload + synthetic).
    pub fn dns_count(&self) -> usize {
        self.inner.lock().model.dns_count()
    }

    /// Number of LB entries.
    pub fn lb_count(&self) -> usize {
        self.inner.lock().model.lb_count()
    }

    /// Number of synthetic DNS entries currently asserted.
    pub fn synthetic_count(&self) -> usize {
        self.inner
            .lock()
            .model
            .synthetic_count(&self.synthetic_prefix)
    }

    /// Emit current state gauges.
    pub fn emit_metrics(&self) {
        let inner = self.inner.lock();
        metrics::record_state_counts(
            inner.model.dns_count(),
            inner.model.lb_count(),
            inner.model.synthetic_count(&self.synthetic_prefix),
        );
    }
}
