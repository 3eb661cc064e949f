//! Paddock - A service-discovery daemon for containers and virtual machines.
//!
//! This crate watches two workload sources (the Docker daemon and a libvirt
//! hypervisor) and continuously projects their state into two text
//! configurations: a hosts/wildcards database for a local dnsmasq resolver
//! and an HTTP/TCP frontend configuration for a local HAProxy instance.
//! When a workload starts, its names become resolvable and its declared
//! services become routable; when it stops, the entries vanish and both
//! downstream processes are reloaded.
//!
//! ## Features
//!
//! - Real-time updates from Docker container events and libvirt domain
//!   lifecycle changes
//! - Label-driven DNS names, aliases and wildcard records per workload
//! - Label-driven HTTP virtual hosts and TCP frontends, aggregated across
//!   workloads publishing the same service name
//! - Reloads fired only when the generated files actually change
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           paddock                              │
//! │                                                                │
//! │  ┌───────────────┐                                             │
//! │  │ Docker events │──┐    ┌──────────────┐   ┌──────────────┐   │
//! │  └───────────────┘  │    │  Convergence │──▶│ DNS generator│──▶ hosts +
//! │  ┌───────────────┐  ├───▶│  core        │   └──────────────┘    wildcards
//! │  │ libvirt events│──┘    │  (one mutex) │   ┌──────────────┐   │
//! │  └───────────────┘       │              │──▶│ LB generator │──▶ haproxy.cfg
//! │        │                 └──────────────┘   └──────────────┘   │
//! │        │ per-VM IP resolution                      │           │
//! │        └─ (guest agent / DHCP leases)    reload on byte diff   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Workload labels
//!
//! ```text
//! dns.domain=my.local.env          DNS domain for this workload
//! dns.wildcard=true                also emit wildcard records
//! dns.aliases=web,api              extra names on the hosts line
//! lb.domain=my.local.env           domain for load-balanced hosts
//! lb.http=tomcat:8080              HTTP virtual host -> backend port
//! lb.tcp=redis:1234:6379           TCP frontend port -> backend port
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use paddock::{Config, Daemon};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let cancel = CancellationToken::new();
//!
//!     Daemon::new(config).run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod daemon;
pub mod dns;
pub mod docker;
pub mod error;
pub mod lb;
pub mod libvirt;
pub mod metrics;
pub mod model;
pub mod supervisor;
pub mod telemetry;
pub mod workload;

// Re-export main types
pub use config::{Config, TelemetryConfig};
pub use core::Core;
pub use daemon::Daemon;
pub use error::Error;
pub use supervisor::{Supervisor, SystemSupervisor};
pub use workload::{EventKind, WorkloadEvent, WorkloadSnapshot};
