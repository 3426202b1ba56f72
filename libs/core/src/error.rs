//! Error types for the routing engine.

use thiserror::Error;

use crate::pdu::Destination;

/// Errors surfaced by the core-access façade and the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The core run this handle belonged to is not (or no longer) active.
    #[error("core is not active")]
    Inactive,

    /// A PDU was injected at an interceptor index past the end of the chain.
    #[error("interceptor {index} does not exist in the {destination} chain of {len}")]
    UnknownInterceptor {
        destination: Destination,
        index: usize,
        len: usize,
    },

    /// A module references a factory code that is not registered.
    #[error("no {kind} factory registered under '{factory}' (module '{module}')")]
    UnknownFactory {
        kind: &'static str,
        factory: String,
        module: String,
    },

    /// An interceptor failed while handling a PDU.
    #[error(transparent)]
    Interceptor(#[from] InterceptorError),

    /// A proxy failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Errors raised by interceptors.
#[derive(Debug, Error)]
pub enum InterceptorError {
    /// The interceptor rejected the PDU or could not prepare.
    #[error("interceptor '{code}' failed: {reason}")]
    Failed { code: String, reason: String },

    /// Internal error.
    #[error("interceptor error: {0}")]
    Other(#[from] anyhow::Error),
}

impl InterceptorError {
    /// Shorthand for [`InterceptorError::Failed`].
    pub fn failed(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by proxies.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The module configuration is invalid.
    #[error("invalid proxy configuration: {0}")]
    Config(String),

    /// Socket level failure.
    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material or handshake failure.
    #[error("proxy TLS error: {0}")]
    Tls(String),

    /// Operation requires a state the proxy is not in.
    #[error("proxy '{0}' is not prepared")]
    NotPrepared(String),

    /// Internal error.
    #[error("proxy error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Errors raised by connections.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket level failure.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake failure.
    #[error("connection TLS error: {0}")]
    Tls(String),

    /// The connection was stopped while an operation was pending.
    #[error("connection closed")]
    Closed,
}
