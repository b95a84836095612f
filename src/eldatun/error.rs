//! Error taxonomy shared by the client session/pool/connector and the server handler (§7).
//!
//! One `thiserror` enum per component boundary, matching spec.md's taxonomy name-for-name.
//! `UpstreamIO` exists as a variant for completeness but per §7's propagation policy it is
//! never surfaced past the splicer — it is logged and swallowed there.

use thiserror::Error;

use crate::eldatun::control::ProtocolError;

/// Errors surfaced by the connector (E), client session (D), and pool (F).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("session refused a new sub-stream: cap hit or closed")]
    LimitExceeded,
    #[error("remote dial failed: {0}")]
    RemoteDial(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("no active connections in pool")]
    NoActiveConnections,
    #[error("upstream io error: {0}")]
    UpstreamIo(std::io::Error),
}

/// Errors surfaced by the per-sub-stream handler (H).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("network {0:?} not allowed")]
    NetworkNotAllowed(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub const ALLOWED_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"];

pub fn is_udp_like(network: &str) -> bool {
    matches!(network, "udp" | "udp4" | "udp6")
}

pub fn network_allowed(network: &str) -> bool {
    ALLOWED_NETWORKS.contains(&network)
}
