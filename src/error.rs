//! Error types for paddock.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the discovery daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (file writes, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Docker API error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// libvirt error
    #[error("libvirt error: {0}")]
    Libvirt(#[from] virt::error::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// The daemon could not find its own container among the running ones.
    /// Without its own identity it cannot own the synthetic DNS entries
    /// that make load-balanced hosts resolve to it.
    #[error("could not identify own container (hostname {hostname}, ip {ip})")]
    SelfIdentification {
        /// The daemon's host name used for matching.
        hostname: String,
        /// The daemon's primary IPv4 used for matching.
        ip: String,
    },

    /// The HAProxy template could not be read at startup.
    #[error("cannot read proxy template {}: {source}", path.display())]
    Template {
        /// Path of the template file.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The daemon's own IPv4 address could not be determined.
    #[error("could not detect own IPv4 address: {0}")]
    SelfAddress(String),
}
