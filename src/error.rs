//! Crate-wide error type.
//!
//! Mirrors the error-kind taxonomy in spec §7: framing errors are fatal to
//! the connection, parse errors are recoverable and caller-decided, dial
//! and queue errors are reported back through the dialogue/proxy and leave
//! the connection open.

use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("packet parse error (type {packet_type}): {reason}")]
    Parse { packet_type: i32, reason: String },

    #[error("dial error connecting to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial timed out connecting to {addr}")]
    DialTimeout { addr: String },

    #[error("outbound queue full")]
    QueueFull,

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn parse(packet_type: i32, reason: impl Into<String>) -> Self {
        ProxyError::Parse {
            packet_type,
            reason: reason.into(),
        }
    }

    pub fn framing(reason: impl Into<String>) -> Self {
        ProxyError::Framing(reason.into())
    }
}

/// A log-friendly tag for a connection's peer address, used as a tracing
/// field on nearly every span in `server`, `dialogue`, and `proxy`.
pub fn peer_tag(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
