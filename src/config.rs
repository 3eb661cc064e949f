//! Configuration types for paddock.
//!
//! Every field maps onto a bare environment variable of the same name in
//! upper case (`DNS_DOMAIN`, `DOCKER_SOCKET`, ...) through the `config`
//! crate's environment source, with an optional TOML file merged in first.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default DNS domain for workloads without a `dns.domain` label.
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,

    /// Default wildcard behaviour for workloads without a `dns.wildcard` label.
    #[serde(default)]
    pub dns_wildcard: bool,

    /// Default domain for load-balanced hosts without an `lb.domain` label.
    #[serde(default = "default_lb_domain")]
    pub lb_domain: String,

    /// Docker daemon socket (`unix://` URL).
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    /// libvirt daemon socket path.
    #[serde(default = "default_libvirt_socket")]
    pub libvirt_socket: PathBuf,

    /// How long to poll for a VM's IPv4 address before giving up, in seconds.
    #[serde(default = "default_libvirt_ip_timeout")]
    pub libvirt_ip_timeout: f64,

    /// Override for the daemon's auto-detected primary IPv4 address.
    #[serde(default)]
    pub external_ip: Option<String>,

    /// Static HAProxy configuration prefix, re-read on every generation.
    #[serde(default = "default_haproxy_config_template")]
    pub haproxy_config_template: PathBuf,

    /// Generated HAProxy configuration file.
    #[serde(default = "default_haproxy_config_file")]
    pub haproxy_config_file: PathBuf,

    /// Generated dnsmasq hosts file.
    #[serde(default = "default_dnsmasq_hosts_file")]
    pub dnsmasq_hosts_file: PathBuf,

    /// Generated dnsmasq wildcards file (`address=/host/ip` lines).
    #[serde(default = "default_dnsmasq_wildcards_file")]
    pub dnsmasq_wildcards_file: PathBuf,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_domain: default_dns_domain(),
            dns_wildcard: false,
            lb_domain: default_lb_domain(),
            docker_socket: default_docker_socket(),
            libvirt_socket: default_libvirt_socket(),
            libvirt_ip_timeout: default_libvirt_ip_timeout(),
            external_ip: None,
            haproxy_config_template: default_haproxy_config_template(),
            haproxy_config_file: default_haproxy_config_file(),
            dnsmasq_hosts_file: default_dnsmasq_hosts_file(),
            dnsmasq_wildcards_file: default_dnsmasq_wildcards_file(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "paddock=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<std::net::SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_dns_domain() -> String {
    "local".to_string()
}

fn default_lb_domain() -> String {
    "local".to_string()
}

fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_libvirt_socket() -> PathBuf {
    PathBuf::from("/var/run/libvirt/libvirt-sock")
}

fn default_libvirt_ip_timeout() -> f64 {
    30.0
}

fn default_haproxy_config_template() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg.template")
}

fn default_haproxy_config_file() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_dnsmasq_hosts_file() -> PathBuf {
    PathBuf::from("/etc/dnsmasq/hosts")
}

fn default_dnsmasq_wildcards_file() -> PathBuf {
    PathBuf::from("/etc/dnsmasq/wildcards.conf")
}

fn default_log_level() -> String {
    "info".to_string()
}
