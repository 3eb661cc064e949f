//! Virtual-machine source adapter backed by libvirt.
//!
//! The hypervisor client is blocking, so everything runs on dedicated
//! threads: one watcher thread derives domain lifecycle events, and each
//! `Start` spawns a short-lived worker that polls for the VM's IPv4
//! address (QEMU guest agent when the domain declares an agent channel,
//! the DHCP lease table otherwise) before handing the snapshot to the
//! core. The model lock is never held while polling.
//!
//! The adapter is optional: when the libvirt socket does not exist the
//! daemon runs without it.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::Error;
use crate::metrics::{self, EventType, IpResolutionOutcome};
use crate::workload::{EventKind, WorkloadEvent, WorkloadSnapshot};

/// Metadata URI carrying workload labels in the domain XML.
pub const METADATA_URI: &str = "http://github.com/lionelnicolas/dalidock";

/// Poll interval for IP resolution.
const IP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Poll interval of the lifecycle watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Stable names of the domain lifecycle event codes.
const EVENT_NAMES: [&str; 9] = [
    "Defined",
    "Undefined",
    "Started",
    "Suspended",
    "Resumed",
    "Stopped",
    "Shutdown",
    "PMSuspended",
    "Crashed",
];

const EVENT_DEFINED: u32 = 0;
const EVENT_STARTED: u32 = 2;
const EVENT_STOPPED: u32 = 5;

/// Name of a lifecycle event code, if known.
pub fn event_name(event: u32) -> Option<&'static str> {
    EVENT_NAMES.get(event as usize).copied()
}

/// Translate a lifecycle event into a workload event kind.
///
/// `Started` maps to `Start`, `Stopped` to `Stop`, and `Defined` to
/// `Start` when the domain is currently running (covers live metadata
/// edits). Everything else is dropped.
pub fn translate(event: u32, running: bool) -> Option<EventKind> {
    match event {
        EVENT_STARTED => Some(EventKind::Start),
        EVENT_STOPPED => Some(EventKind::Stop),
        EVENT_DEFINED if running => Some(EventKind::Start),
        _ => None,
    }
}

/// What the adapter needs from a domain's XML description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainXmlInfo {
    /// True when a QEMU guest-agent channel is declared.
    pub has_agent: bool,
    /// MAC address of the first interface.
    pub mac: Option<String>,
    /// Network (or bridge) name of the first interface.
    pub network: Option<String>,
}

/// Extract the agent channel, first-interface MAC and network from a
/// domain XML description.
pub fn parse_domain_xml(xml: &str) -> DomainXmlInfo {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("unparseable domain XML: {e}");
            return DomainXmlInfo::default();
        }
    };

    let mut info = DomainXmlInfo::default();

    for node in doc.descendants() {
        match node.tag_name().name() {
            "channel" => {
                let is_agent = node
                    .children()
                    .filter(|c| c.tag_name().name() == "target")
                    .any(|t| t.attribute("name") == Some("org.qemu.guest_agent.0"));
                if is_agent {
                    info.has_agent = true;
                }
            }
            "interface" if info.mac.is_none() => {
                for child in node.children() {
                    match child.tag_name().name() {
                        "mac" => {
                            info.mac = child.attribute("address").map(str::to_string);
                        }
                        "source" => {
                            info.network = child
                                .attribute("network")
                                .or_else(|| child.attribute("bridge"))
                                .map(str::to_string);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    info
}

/// Parse the labels metadata element (`<labels key="value" .../>`).
pub fn parse_labels_xml(xml: &str) -> HashMap<String, String> {
    let doc = match roxmltree::Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("unparseable labels metadata: {e}");
            return HashMap::new();
        }
    };

    doc.root_element()
        .attributes()
        .map(|a| (a.name().to_string(), a.value().to_string()))
        .collect()
}

/// One interface with its IPv4 addresses, as reported by the hypervisor.
#[derive(Debug, Clone)]
struct IfaceAddrs {
    hwaddr: String,
    ipv4: Vec<String>,
}

/// Pick the first IPv4 of the interface matching `mac` (case-insensitive).
fn pick_ipv4(interfaces: &[IfaceAddrs], mac: &str) -> Option<String> {
    interfaces
        .iter()
        .find(|iface| iface.hwaddr.eq_ignore_ascii_case(mac))
        .and_then(|iface| iface.ipv4.first().cloned())
}

fn collect_interfaces(domain: &Domain, source: u32) -> Vec<IfaceAddrs> {
    match domain.interface_addresses(source, 0) {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|iface| IfaceAddrs {
                hwaddr: iface.hwaddr,
                ipv4: iface
                    .addrs
                    .into_iter()
                    .filter(|addr| addr.typed as u32 == sys::VIR_IP_ADDR_TYPE_IPV4)
                    .map(|addr| addr.addr)
                    .collect(),
            })
            .collect(),
        Err(e) => {
            // Agent not yet responsive or domain mid-transition; keep
            // polling quietly.
            debug!("interface query failed: {e}");
            Vec::new()
        }
    }
}

/// Virtual-machine source adapter.
pub struct LibvirtAdapter {
    uri: String,
    ip_timeout: Duration,
}

impl LibvirtAdapter {
    /// Probe the libvirt socket. Returns `None` (adapter disabled) when
    /// the socket path does not exist.
    pub fn detect(socket: &Path, ip_timeout_secs: f64) -> Option<Self> {
        if !socket.exists() {
            info!(socket = %socket.display(), "libvirt socket not present, VM adapter disabled");
            return None;
        }

        let uri = if socket == Path::new("/var/run/libvirt/libvirt-sock") {
            "qemu:///system".to_string()
        } else {
            format!("qemu+unix:///system?socket={}", socket.display())
        };

        Some(Self {
            uri,
            ip_timeout: Duration::from_secs_f64(ip_timeout_secs),
        })
    }

    /// Run the adapter until cancelled: announce running domains, then
    /// watch for lifecycle changes. Blocking; call from a dedicated
    /// thread.
    pub fn run(&self, tx: mpsc::Sender<WorkloadEvent>, cancel: CancellationToken) {
        let conn = match Connect::open(Some(self.uri.as_str())) {
            Ok(conn) => conn,
            Err(e) => {
                error!(uri = %self.uri, "cannot connect to libvirt: {e}");
                return;
            }
        };
        info!(uri = %self.uri, "connected to libvirt");

        // uuid -> observation, as of the previous tick.
        let mut known: HashMap<String, DomainObservation> = HashMap::new();

        match observe_domains(&conn) {
            Ok(domains) => {
                for (uuid, obs) in &domains {
                    if obs.running {
                        self.spawn_ip_worker(uuid.clone(), tx.clone());
                    }
                }
                known = domains;
            }
            Err(e) => error!("initial domain enumeration failed: {e}"),
        }

        info!("watching for domain lifecycle events");
        while !cancel.is_cancelled() {
            std::thread::sleep(WATCH_INTERVAL);

            let current = match observe_domains(&conn) {
                Ok(domains) => domains,
                Err(e) => {
                    warn!("domain enumeration failed: {e}");
                    continue;
                }
            };

            for (uuid, obs) in &current {
                if let Some(event) = transition_event(known.get(uuid), obs) {
                    self.dispatch(event, uuid, obs.running, &tx);
                }
            }
            for (uuid, prev) in &known {
                if prev.running && !current.contains_key(uuid) {
                    self.dispatch(EVENT_STOPPED, uuid, false, &tx);
                }
            }

            known = current;
        }

        info!("VM adapter shutting down");
    }

    /// Route one lifecycle event code through the translation table.
    fn dispatch(&self, event: u32, uuid: &str, running: bool, tx: &mpsc::Sender<WorkloadEvent>) {
        let name = event_name(event).unwrap_or("Unknown");
        debug!(uuid = %uuid, event = %name, "domain lifecycle event");

        match translate(event, running) {
            Some(EventKind::Start) => {
                metrics::record_event("libvirt", EventType::Start);
                self.spawn_ip_worker(uuid.to_string(), tx.clone());
            }
            Some(EventKind::Stop) => {
                metrics::record_event("libvirt", EventType::Stop);
                if tx
                    .blocking_send(WorkloadEvent::Stop(format!("libvirt:{uuid}")))
                    .is_err()
                {
                    warn!("event channel closed");
                }
            }
            None => {
                metrics::record_event("libvirt", EventType::Dropped);
            }
        }
    }

    /// Spawn the per-start worker that polls for the VM's address and
    /// announces the snapshot once it has one.
    fn spawn_ip_worker(&self, uuid: String, tx: mpsc::Sender<WorkloadEvent>) {
        let uri = self.uri.clone();
        let timeout = self.ip_timeout;

        std::thread::spawn(move || {
            if let Some(ws) = resolve_snapshot(&uri, &uuid, timeout) {
                if tx.blocking_send(WorkloadEvent::Start(ws)).is_err() {
                    warn!("event channel closed");
                }
            }
        });
    }
}

/// One tick's view of a domain: its running state and a fingerprint of
/// its persistent configuration, so a redefine of a live domain is
/// observable as a `Defined` event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DomainObservation {
    running: bool,
    config_fingerprint: u64,
}

/// Fingerprint of a domain XML description.
fn xml_fingerprint(xml: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    xml.hash(&mut hasher);
    hasher.finish()
}

/// Lifecycle event code for one domain between two observations.
///
/// A domain that comes up yields `Started`, one that goes down yields
/// `Stopped`, and one that stays running with a changed persistent config
/// yields `Defined` (a redefine of a live domain, e.g. updated labels).
fn transition_event(prev: Option<&DomainObservation>, current: &DomainObservation) -> Option<u32> {
    let was_running = prev.map(|p| p.running).unwrap_or(false);

    if current.running && !was_running {
        Some(EVENT_STARTED)
    } else if !current.running && was_running {
        Some(EVENT_STOPPED)
    } else if current.running
        && prev.is_some_and(|p| p.config_fingerprint != current.config_fingerprint)
    {
        Some(EVENT_DEFINED)
    } else {
        None
    }
}

/// Observe all defined domains with their running state and config
/// fingerprint. The inactive XML is used so runtime-only churn in the
/// live description does not look like a redefine.
fn observe_domains(conn: &Connect) -> Result<HashMap<String, DomainObservation>, Error> {
    let domains = conn.list_all_domains(0)?;

    let mut map = HashMap::new();
    for domain in domains {
        let uuid = domain.get_uuid_string()?;
        let running = domain.is_active().unwrap_or(false);
        let config_fingerprint = domain
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map(|xml| xml_fingerprint(&xml))
            .unwrap_or(0);
        map.insert(
            uuid,
            DomainObservation {
                running,
                config_fingerprint,
            },
        );
    }
    Ok(map)
}

/// Build the full snapshot for a started domain, polling for its IPv4.
/// Returns `None` (and logs) when no address appears within `timeout`.
fn resolve_snapshot(uri: &str, uuid: &str, timeout: Duration) -> Option<WorkloadSnapshot> {
    let conn = match Connect::open(Some(uri)) {
        Ok(conn) => conn,
        Err(e) => {
            error!(uuid = %uuid, "cannot connect to libvirt: {e}");
            return None;
        }
    };
    let domain = match Domain::lookup_by_uuid_string(&conn, uuid) {
        Ok(domain) => domain,
        Err(e) => {
            // The domain may already be gone again.
            debug!(uuid = %uuid, "domain lookup failed: {e}");
            return None;
        }
    };

    let name = domain.get_name().ok()?;
    let xml = match domain.get_xml_desc(0) {
        Ok(xml) => xml,
        Err(e) => {
            warn!(domain = %name, "cannot read domain XML: {e}");
            return None;
        }
    };
    let xml_info = parse_domain_xml(&xml);

    let Some(mac) = xml_info.mac.clone() else {
        warn!(domain = %name, "domain has no network interface, skipping");
        return None;
    };

    let labels = match domain.get_metadata(sys::VIR_DOMAIN_METADATA_ELEMENT as i32, Some(METADATA_URI), 0) {
        Ok(xml) => parse_labels_xml(&xml),
        Err(e) => {
            // Most domains simply carry no labels element.
            debug!(domain = %name, "no labels metadata: {e}");
            HashMap::new()
        }
    };

    let source = if xml_info.has_agent {
        sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT
    } else {
        sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE
    };

    let deadline = Instant::now() + timeout;
    let ip = loop {
        let interfaces = collect_interfaces(&domain, source);
        if let Some(ip) = pick_ipv4(&interfaces, &mac) {
            metrics::record_ip_resolution(if xml_info.has_agent {
                IpResolutionOutcome::Agent
            } else {
                IpResolutionOutcome::Lease
            });
            break ip;
        }

        if Instant::now() >= deadline {
            metrics::record_ip_resolution(IpResolutionOutcome::Timeout);
            warn!(
                domain = %name,
                timeout_secs = timeout.as_secs_f64(),
                "no IPv4 address within timeout, dropping workload"
            );
            return None;
        }
        std::thread::sleep(IP_POLL_INTERVAL);
    };

    info!(
        domain = %name,
        ip = %ip,
        via = if xml_info.has_agent { "agent" } else { "lease" },
        "resolved VM address"
    );

    Some(WorkloadSnapshot {
        source_id: format!("libvirt:{uuid}"),
        name: name.clone(),
        hostname: name,
        ip,
        network: xml_info.network.unwrap_or_default(),
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_table() {
        assert_eq!(event_name(0), Some("Defined"));
        assert_eq!(event_name(2), Some("Started"));
        assert_eq!(event_name(5), Some("Stopped"));
        assert_eq!(event_name(8), Some("Crashed"));
        assert_eq!(event_name(9), None);
    }

    #[test]
    fn test_translate_started_and_stopped() {
        assert_eq!(translate(2, true), Some(EventKind::Start));
        assert_eq!(translate(5, false), Some(EventKind::Stop));
    }

    #[test]
    fn test_translate_defined_only_when_running() {
        assert_eq!(translate(0, true), Some(EventKind::Start));
        assert_eq!(translate(0, false), None);
    }

    #[test]
    fn test_translate_drops_other_events() {
        for code in [1, 3, 4, 6, 7, 8] {
            assert_eq!(translate(code, true), None, "code {code}");
        }
    }

    fn obs(running: bool, config_fingerprint: u64) -> DomainObservation {
        DomainObservation {
            running,
            config_fingerprint,
        }
    }

    #[test]
    fn test_transition_started_and_stopped() {
        assert_eq!(
            transition_event(Some(&obs(false, 1)), &obs(true, 1)),
            Some(EVENT_STARTED)
        );
        assert_eq!(transition_event(None, &obs(true, 1)), Some(EVENT_STARTED));
        assert_eq!(
            transition_event(Some(&obs(true, 1)), &obs(false, 1)),
            Some(EVENT_STOPPED)
        );
    }

    #[test]
    fn test_transition_redefine_while_running_yields_defined() {
        assert_eq!(
            transition_event(Some(&obs(true, 1)), &obs(true, 2)),
            Some(EVENT_DEFINED)
        );
        // Which the translation rules turn into a re-registration.
        assert_eq!(translate(EVENT_DEFINED, true), Some(EventKind::Start));
    }

    #[test]
    fn test_transition_steady_states_are_silent() {
        assert_eq!(transition_event(Some(&obs(true, 1)), &obs(true, 1)), None);
        assert_eq!(transition_event(Some(&obs(false, 1)), &obs(false, 1)), None);
        // A redefine of a stopped domain waits for its next start.
        assert_eq!(transition_event(Some(&obs(false, 1)), &obs(false, 2)), None);
        assert_eq!(transition_event(None, &obs(false, 1)), None);
    }

    #[test]
    fn test_xml_fingerprint_tracks_content() {
        let a = "<domain><name>vm1</name></domain>";
        let b = "<domain><name>vm2</name></domain>";
        assert_eq!(xml_fingerprint(a), xml_fingerprint(a));
        assert_ne!(xml_fingerprint(a), xml_fingerprint(b));
    }

    #[test]
    fn test_parse_domain_xml_agent_and_interface() {
        let xml = r#"
            <domain type='kvm'>
              <name>vm1</name>
              <devices>
                <interface type='network'>
                  <mac address='52:54:00:aa:bb:cc'/>
                  <source network='default'/>
                </interface>
                <channel type='unix'>
                  <target type='virtio' name='org.qemu.guest_agent.0'/>
                </channel>
              </devices>
            </domain>"#;

        let info = parse_domain_xml(xml);
        assert!(info.has_agent);
        assert_eq!(info.mac.as_deref(), Some("52:54:00:aa:bb:cc"));
        assert_eq!(info.network.as_deref(), Some("default"));
    }

    #[test]
    fn test_parse_domain_xml_bridge_no_agent() {
        let xml = r#"
            <domain type='kvm'>
              <devices>
                <interface type='bridge'>
                  <mac address='52:54:00:11:22:33'/>
                  <source bridge='virbr0'/>
                </interface>
                <channel type='unix'>
                  <target type='virtio' name='org.example.other'/>
                </channel>
              </devices>
            </domain>"#;

        let info = parse_domain_xml(xml);
        assert!(!info.has_agent);
        assert_eq!(info.network.as_deref(), Some("virbr0"));
    }

    #[test]
    fn test_parse_domain_xml_first_interface_wins() {
        let xml = r#"
            <domain>
              <devices>
                <interface type='network'>
                  <mac address='52:54:00:00:00:01'/>
                  <source network='first'/>
                </interface>
                <interface type='network'>
                  <mac address='52:54:00:00:00:02'/>
                  <source network='second'/>
                </interface>
              </devices>
            </domain>"#;

        let info = parse_domain_xml(xml);
        assert_eq!(info.mac.as_deref(), Some("52:54:00:00:00:01"));
        assert_eq!(info.network.as_deref(), Some("first"));
    }

    #[test]
    fn test_parse_labels_xml() {
        let xml = r#"<labels dns.domain="my.local.env" lb.http="web:80"/>"#;
        let labels = parse_labels_xml(xml);
        assert_eq!(labels.get("dns.domain").unwrap(), "my.local.env");
        assert_eq!(labels.get("lb.http").unwrap(), "web:80");
    }

    #[test]
    fn test_parse_labels_xml_empty_element() {
        let labels = parse_labels_xml("<labels/>");
        assert!(labels.is_empty());
    }

    #[test]
    fn test_pick_ipv4_filters_by_mac() {
        let interfaces = vec![
            IfaceAddrs {
                hwaddr: "52:54:00:00:00:01".to_string(),
                ipv4: vec!["192.168.122.10".to_string()],
            },
            IfaceAddrs {
                hwaddr: "52:54:00:00:00:02".to_string(),
                ipv4: vec!["192.168.122.20".to_string()],
            },
        ];

        assert_eq!(
            pick_ipv4(&interfaces, "52:54:00:00:00:02").as_deref(),
            Some("192.168.122.20")
        );
        assert_eq!(
            pick_ipv4(&interfaces, "52:54:00:00:00:01").as_deref(),
            Some("192.168.122.10")
        );
        assert!(pick_ipv4(&interfaces, "52:54:00:00:00:03").is_none());
    }

    #[test]
    fn test_pick_ipv4_mac_case_insensitive() {
        let interfaces = vec![IfaceAddrs {
            hwaddr: "52:54:00:AA:BB:CC".to_string(),
            ipv4: vec!["192.168.122.10".to_string()],
        }];
        assert!(pick_ipv4(&interfaces, "52:54:00:aa:bb:cc").is_some());
    }
}
