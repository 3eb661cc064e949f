//! Load-balancer generator: projects the model onto the HAProxy
//! configuration.
//!
//! The config is rebuilt from scratch on every cycle: the static template
//! is re-read, the generated HTTP frontend rules, HTTP backends, TCP
//! frontends and TCP backends are appended in that order, and the proxy is
//! gracefully reloaded only when the assembled text changed.
//!
//! As a side effect, every aggregated HTTP/TCP host feeds a
//! reference-counted synthetic DNS entry back into the model so the
//! frontend names resolve to the daemon itself. The synthetic namespace is
//! flushed before aggregation, which is what makes removals converge.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::metrics::{self, ReloadTarget};
use crate::model::{DnsEntry, Model};
use crate::supervisor::Supervisor;

static HTTP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+):([0-9]+)$").expect("static regex"));
static TCP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+):([0-9]+):([0-9]+)$").expect("static regex"));

/// A parsed `lb.http` service declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpService {
    /// Virtual-host name (wildcard prefix stripped).
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// True when the declaration carried a leading `*.`.
    pub wildcard: bool,
}

/// A parsed `lb.tcp` service declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpService {
    /// Frontend name (wildcard prefix stripped).
    pub host: String,
    /// Port the proxy listens on.
    pub front_port: u16,
    /// Port the backend serves on.
    pub back_port: u16,
    /// True when the declaration carried a leading `*.`.
    pub wildcard: bool,
}

fn split_wildcard(host: &str) -> (String, bool) {
    match host.strip_prefix("*.") {
        Some(stripped) => (stripped.to_string(), true),
        None => (host.to_string(), false),
    }
}

/// Parse a `HOST:PORT` HTTP declaration.
pub fn parse_http(entry: &str) -> Option<HttpService> {
    let caps = HTTP_RE.captures(entry)?;
    let (host, wildcard) = split_wildcard(&caps[1]);
    let port = caps[2].parse().ok()?;
    Some(HttpService {
        host,
        port,
        wildcard,
    })
}

/// Parse a `HOST:FRONT:BACK` or `HOST:PORT` TCP declaration. The
/// triple-colon form is preferred when both could match.
pub fn parse_tcp(entry: &str) -> Option<TcpService> {
    if let Some(caps) = TCP_RE.captures(entry) {
        let (host, wildcard) = split_wildcard(&caps[1]);
        let front_port = caps[2].parse().ok()?;
        let back_port = caps[3].parse().ok()?;
        return Some(TcpService {
            host,
            front_port,
            back_port,
            wildcard,
        });
    }

    let caps = HTTP_RE.captures(entry)?;
    let (host, wildcard) = split_wildcard(&caps[1]);
    let port: u16 = caps[2].parse().ok()?;
    Some(TcpService {
        host,
        front_port: port,
        back_port: port,
        wildcard,
    })
}

/// One `server` line inside a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerLine {
    name: String,
    ip: String,
    port: u16,
}

/// All servers grouped under one TCP frontend port.
#[derive(Debug)]
struct TcpGroup {
    host: String,
    servers: Vec<ServerLine>,
}

/// A synthetic DNS host asserted by one LB entry mention.
#[derive(Debug)]
struct SyntheticHost {
    host: String,
    domain: String,
    wildcard: bool,
}

#[derive(Debug, Default)]
struct Aggregated {
    http: BTreeMap<String, Vec<ServerLine>>,
    tcp: BTreeMap<u16, TcpGroup>,
    synthetic: Vec<SyntheticHost>,
}

/// Walk the LB table and group services. Invalid declarations are logged
/// and skipped without dropping the rest of the workload.
fn aggregate(model: &Model) -> Aggregated {
    let mut agg = Aggregated::default();

    for (source_id, entry) in model.lb_entries_sorted() {
        for raw in &entry.http_entries {
            let Some(svc) = parse_http(raw) else {
                warn!(source_id = %source_id, entry = %raw, "invalid lb.http entry, skipping");
                continue;
            };
            agg.http.entry(svc.host.clone()).or_default().push(ServerLine {
                name: entry.hostname.clone(),
                ip: entry.ip.clone(),
                port: svc.port,
            });
            agg.synthetic.push(SyntheticHost {
                host: svc.host,
                domain: entry.domain.clone(),
                wildcard: svc.wildcard,
            });
        }

        for raw in &entry.tcp_entries {
            let Some(svc) = parse_tcp(raw) else {
                warn!(source_id = %source_id, entry = %raw, "invalid lb.tcp entry, skipping");
                continue;
            };
            let server = ServerLine {
                name: entry.hostname.clone(),
                ip: entry.ip.clone(),
                port: svc.back_port,
            };
            match agg.tcp.entry(svc.front_port) {
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    let group = slot.get_mut();
                    if group.host != svc.host {
                        warn!(
                            front_port = svc.front_port,
                            old = %group.host,
                            new = %svc.host,
                            "conflicting tcp hosts on one frontend port, keeping the newest"
                        );
                        group.host = svc.host.clone();
                    }
                    group.servers.push(server);
                }
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(TcpGroup {
                        host: svc.host.clone(),
                        servers: vec![server],
                    });
                }
            }
            agg.synthetic.push(SyntheticHost {
                host: svc.host,
                domain: entry.domain.clone(),
                wildcard: svc.wildcard,
            });
        }
    }

    agg
}

fn render_http_frontends(agg: &Aggregated) -> String {
    let mut out = String::new();
    for host in agg.http.keys() {
        out.push_str(&format!(
            "    acl is_{host} hdr_reg(host) ^(.*\\.|){host}(\\..+$|$)\n"
        ));
        out.push_str(&format!(
            "    use_backend backend_http_{host} if is_{host}\n"
        ));
    }
    out
}

fn render_http_backends(agg: &Aggregated) -> String {
    let mut out = String::new();
    for (host, servers) in &agg.http {
        out.push_str(&format!("\nbackend backend_http_{host}\n"));
        for server in servers {
            out.push_str(&format!(
                "    server {} {}:{} check port {}\n",
                server.name, server.ip, server.port, server.port
            ));
        }
    }
    out
}

fn render_tcp_frontends(agg: &Aggregated) -> String {
    let mut out = String::new();
    for (front_port, group) in &agg.tcp {
        let host = &group.host;
        out.push_str(&format!("\nfrontend frontend_tcp_{host}_{front_port}\n"));
        out.push_str(&format!("    bind *:{front_port}\n"));
        out.push_str("    mode tcp\n");
        out.push_str(&format!("    use_backend backend_tcp_{host}_{front_port}\n"));
    }
    out
}

fn render_tcp_backends(agg: &Aggregated) -> String {
    let mut out = String::new();
    for (front_port, group) in &agg.tcp {
        out.push_str(&format!(
            "\nbackend backend_tcp_{}_{}\n",
            group.host, front_port
        ));
        out.push_str("    mode tcp\n");
        out.push_str("    balance roundrobin\n");
        for server in &group.servers {
            out.push_str(&format!(
                "    server {} {}:{} check port {}\n",
                server.name, server.ip, server.port, server.port
            ));
        }
    }
    out
}

/// Assemble the full proxy configuration from the template text and the
/// aggregated services.
fn render_config(template: &str, agg: &Aggregated) -> String {
    let mut out = String::with_capacity(template.len() + 512);
    out.push_str(template);
    out.push_str(&render_http_frontends(agg));
    out.push_str(&render_http_backends(agg));
    out.push_str(&render_tcp_frontends(agg));
    out.push_str(&render_tcp_backends(agg));
    out
}

/// Rebuilds the proxy configuration and the synthetic DNS namespace.
pub struct LbGenerator {
    template_path: PathBuf,
    config_path: PathBuf,
    self_id: String,
    self_ip: String,
    last_config: Option<String>,
}

impl LbGenerator {
    /// Create a generator owned by the daemon with identity `self_id` /
    /// `self_ip` (synthetic hosts resolve to that address).
    pub fn new(
        template_path: PathBuf,
        config_path: PathBuf,
        self_id: String,
        self_ip: String,
    ) -> Self {
        Self {
            template_path,
            config_path,
            self_id,
            self_ip,
            last_config: None,
        }
    }

    /// Prefix of the synthetic DNS key namespace owned by this generator.
    pub fn synthetic_prefix(&self) -> String {
        format!("{}_", self.self_id)
    }

    /// Regenerate the proxy configuration from the model, refresh the
    /// synthetic DNS entries, and reload the proxy when the assembled text
    /// differs from the last successfully written content.
    ///
    /// Must run before the DNS generator so the refreshed synthetic
    /// entries make it into the hosts file of the same cycle.
    ///
    /// Failures are logged, never propagated: the next event retries.
    pub fn generate(&mut self, model: &mut Model, supervisor: &dyn Supervisor) {
        let prefix = self.synthetic_prefix();
        model.flush_dns_prefix(&prefix);

        let agg = aggregate(model);

        for synthetic in &agg.synthetic {
            let key = format!("{}{}", prefix, synthetic.host);
            model.add_dns_ref(
                &key,
                DnsEntry {
                    hostname: synthetic.host.clone(),
                    ip: self.self_ip.clone(),
                    network: "lb".to_string(),
                    domain: synthetic.domain.clone(),
                    name: synthetic.host.clone(),
                    aliases: Vec::new(),
                    use_wildcard: synthetic.wildcard,
                    refcount: 1,
                },
            );
        }

        let template = match fs::read_to_string(&self.template_path) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    path = %self.template_path.display(),
                    "cannot read proxy template: {e}"
                );
                return;
            }
        };

        let config = render_config(&template, &agg);
        if self.last_config.as_deref() == Some(config.as_str()) {
            debug!("proxy config unchanged");
            return;
        }

        match self.write_and_reload(&config, supervisor) {
            Ok(()) => {
                info!(
                    path = %self.config_path.display(),
                    http_hosts = agg.http.len(),
                    tcp_frontends = agg.tcp.len(),
                    "proxy config updated, proxy reloaded"
                );
                self.last_config = Some(config);
            }
            Err(e) => error!(path = %self.config_path.display(), "proxy update failed: {e}"),
        }
    }

    fn write_and_reload(&self, text: &str, supervisor: &dyn Supervisor) -> std::io::Result<()> {
        fs::write(&self.config_path, text)?;
        supervisor.reload_proxy(&self.config_path)?;
        metrics::record_reload(ReloadTarget::Proxy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadSnapshot;

    fn register(model: &mut Model, id: &str, name: &str, ip: &str, labels: &[(&str, &str)]) {
        let ws = WorkloadSnapshot {
            source_id: id.to_string(),
            name: name.to_string(),
            hostname: name.to_string(),
            ip: ip.to_string(),
            network: "bridge".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        model.register(&ws, "my.local.env", "my.local.env", false);
    }

    #[test]
    fn test_parse_http_valid() {
        assert_eq!(
            parse_http("tomcat:8080"),
            Some(HttpService {
                host: "tomcat".to_string(),
                port: 8080,
                wildcard: false,
            })
        );
    }

    #[test]
    fn test_parse_http_wildcard() {
        let svc = parse_http("*.tomcat:8080").unwrap();
        assert_eq!(svc.host, "tomcat");
        assert!(svc.wildcard);
    }

    #[test]
    fn test_parse_http_invalid() {
        assert!(parse_http("tomcat").is_none());
        assert!(parse_http("tomcat:http").is_none());
        assert!(parse_http("tomcat:80:90").is_none());
        assert!(parse_http("").is_none());
    }

    #[test]
    fn test_parse_tcp_prefers_triple_form() {
        assert_eq!(
            parse_tcp("redis:1234:6379"),
            Some(TcpService {
                host: "redis".to_string(),
                front_port: 1234,
                back_port: 6379,
                wildcard: false,
            })
        );
    }

    #[test]
    fn test_parse_tcp_single_port_means_same_backend_port() {
        let svc = parse_tcp("redis:6379").unwrap();
        assert_eq!(svc.front_port, 6379);
        assert_eq!(svc.back_port, 6379);
    }

    #[test]
    fn test_parse_tcp_invalid() {
        assert!(parse_tcp("redis").is_none());
        assert!(parse_tcp("redis:a:b").is_none());
    }

    #[test]
    fn test_http_aggregation_renders_acl_and_backend() {
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "tomcat-server",
            "172.17.0.2",
            &[("lb.http", "tomcat:8080")],
        );

        let agg = aggregate(&model);
        let frontends = render_http_frontends(&agg);
        assert!(frontends.contains("acl is_tomcat hdr_reg(host) ^(.*\\.|)tomcat(\\..+$|$)"));
        assert!(frontends.contains("use_backend backend_http_tomcat if is_tomcat"));

        let backends = render_http_backends(&agg);
        assert!(backends.contains("backend backend_http_tomcat"));
        assert!(backends.contains("server tomcat-server 172.17.0.2:8080 check port 8080"));
    }

    #[test]
    fn test_two_workloads_one_host_share_a_backend() {
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "tomcat-1",
            "172.17.0.2",
            &[("lb.http", "tomcat:8080")],
        );
        register(
            &mut model,
            "docker:b2",
            "tomcat-2",
            "172.17.0.3",
            &[("lb.http", "tomcat:8080")],
        );

        let agg = aggregate(&model);
        assert_eq!(agg.http.len(), 1);
        let backends = render_http_backends(&agg);
        assert_eq!(backends.matches("backend backend_http_tomcat").count(), 1);
        assert!(backends.contains("server tomcat-1 172.17.0.2:8080"));
        assert!(backends.contains("server tomcat-2 172.17.0.3:8080"));
    }

    #[test]
    fn test_tcp_group_renders_frontend_and_backend() {
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "redis-server",
            "172.17.0.2",
            &[("lb.tcp", "redis:1234:6379")],
        );

        let agg = aggregate(&model);
        let frontends = render_tcp_frontends(&agg);
        assert!(frontends.contains("frontend frontend_tcp_redis_1234"));
        assert!(frontends.contains("bind *:1234"));
        assert!(frontends.contains("mode tcp"));
        assert!(frontends.contains("use_backend backend_tcp_redis_1234"));

        let backends = render_tcp_backends(&agg);
        assert!(backends.contains("backend backend_tcp_redis_1234"));
        assert!(backends.contains("balance roundrobin"));
        assert!(backends.contains("server redis-server 172.17.0.2:6379 check port 6379"));
    }

    #[test]
    fn test_tcp_conflicting_hosts_last_wins() {
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "first",
            "172.17.0.2",
            &[("lb.tcp", "alpha:9000:6379")],
        );
        register(
            &mut model,
            "docker:b2",
            "second",
            "172.17.0.3",
            &[("lb.tcp", "beta:9000:6379")],
        );

        let agg = aggregate(&model);
        let group = agg.tcp.get(&9000).unwrap();
        assert_eq!(group.host, "beta");
        assert_eq!(group.servers.len(), 2);
    }

    #[test]
    fn test_invalid_entry_skipped_rest_kept() {
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "web",
            "172.17.0.2",
            &[("lb.http", "bogus,web:80")],
        );

        let agg = aggregate(&model);
        assert_eq!(agg.http.len(), 1);
        assert!(agg.http.contains_key("web"));
    }

    #[test]
    fn test_render_config_preserves_template_prefix() {
        let template = "global\n    daemon\n\nfrontend http-in\n    bind *:80\n";
        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "tomcat-server",
            "172.17.0.2",
            &[("lb.http", "tomcat:8080")],
        );

        let config = render_config(template, &aggregate(&model));
        assert!(config.starts_with(template));
    }

    #[test]
    fn test_generate_feeds_synthetic_dns() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("haproxy.cfg.template");
        let config_path = dir.path().join("haproxy.cfg");
        std::fs::write(&template_path, "global\n").unwrap();

        let mut model = Model::new();
        register(
            &mut model,
            "docker:a1",
            "tomcat-server",
            "172.17.0.2",
            &[("lb.http", "tomcat:8080")],
        );

        struct Noop;
        impl Supervisor for Noop {
            fn reload_dns(&self) -> std::io::Result<()> {
                Ok(())
            }
            fn restart_dns(&self) -> std::io::Result<()> {
                Ok(())
            }
            fn reload_proxy(&self, _: &std::path::Path) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut lb = LbGenerator::new(
            template_path,
            config_path,
            "docker:self".to_string(),
            "172.17.0.1".to_string(),
        );
        lb.generate(&mut model, &Noop);

        let entry = model.dns_entry("docker:self_tomcat").unwrap();
        assert_eq!(entry.ip, "172.17.0.1");
        assert_eq!(entry.domain, "my.local.env");
        assert_eq!(entry.refcount, 1);

        // A second workload on the same host bumps the refcount.
        register(
            &mut model,
            "docker:b2",
            "tomcat-2",
            "172.17.0.3",
            &[("lb.http", "tomcat:8080")],
        );
        lb.generate(&mut model, &Noop);
        assert_eq!(model.dns_entry("docker:self_tomcat").unwrap().refcount, 2);

        // Dropping the label flushes the synthetic host.
        model.deregister("docker:a1");
        model.deregister("docker:b2");
        lb.generate(&mut model, &Noop);
        assert!(model.dns_entry("docker:self_tomcat").is_none());
    }
}
