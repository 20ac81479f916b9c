//! Error types shared across the proxy.

use std::net::SocketAddr;

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors produced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("client TLS handshake failed: {0}")]
    ClientTls(String),

    #[error("client offered no SNI hostname")]
    MissingSni,

    #[error("client address conflict: {0}")]
    AddressConflict(SocketAddr),

    #[error("virtual listener closed")]
    ListenerClosed,

    #[error("no destination recorded for client address {0}")]
    NoDestination(SocketAddr),

    #[error("upstream request to {target} failed: {reason}")]
    UpstreamConnection { target: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid config value {field}={value}: {reason}")]
    InvalidConfig {
        field: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading/saving errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config write error: {0}")]
    Write(String),
}

impl ProxyError {
    /// Whether this error is an expected per-connection condition rather
    /// than something that should take the server down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::ClientTls(_)
                | ProxyError::MissingSni
                | ProxyError::AddressConflict(_)
                | ProxyError::NoDestination(_)
                | ProxyError::UpstreamConnection { .. }
                | ProxyError::Http(_)
        )
    }
}
