//! Error types for the tunnel and its orchestration.

use crate::cluster::ClusterError;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across module boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Tunnel errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VpnError {
    /// TUN device creation or I/O failed.
    #[error("TUN device error: {0}")]
    TunDevice(#[source] ErrorContext),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Node address could not be parsed or uses an unknown scheme.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// Dial was attempted through a chain without a node.
    #[error("empty chain")]
    EmptyChain,

    /// Malformed frame or packet on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requested on a network type the component does not handle.
    #[error("{0} unsupported")]
    Unsupported(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[source] ErrorContext),

    /// Cluster control API failure.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// IP address lease error.
    #[error("IP assignment error: {0}")]
    IpAssignment(String),

    /// Tunnel session ended (recoverable via reconnect).
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A session is already active in this process.
    #[error("already connected")]
    AlreadyConnected,

    /// Waiting for a resource exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl VpnError {
    /// Create a TUN device error with context only.
    pub fn tun_device(message: impl Into<String>) -> Self {
        Self::TunDevice(ErrorContext::new(message))
    }

    /// Create a TUN device error with preserved source.
    pub fn tun_device_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::TunDevice(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Create a TLS error with preserved source.
    pub fn tls_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Tls(ErrorContext::with_source(message, source))
    }

    /// Returns true if this error is potentially recoverable by redialing.
    ///
    /// **Recoverable (transient):**
    /// - `ConnectionLost` - tunnel ended (peer restart, port-forward drop)
    /// - `Network` - I/O errors (connection reset, refused, timeout)
    /// - `Timeout` - dial or readiness deadline
    /// - `Tls` - handshake interrupted mid-stream
    /// - `Cluster(Conflict)` - optimistic update lost a race
    ///
    /// **Non-recoverable (permanent):**
    /// - `Config`, `InvalidNode`, `EmptyChain`, `Unsupported` - won't change
    ///   without user action
    /// - `TunDevice` - device read/write failure or permission denied
    /// - `IpAssignment` - pool exhausted
    pub fn is_recoverable(&self) -> bool {
        match self {
            VpnError::ConnectionLost(_)
            | VpnError::Network(_)
            | VpnError::Timeout(_)
            | VpnError::Tls(_) => true,
            VpnError::Cluster(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias for tunnel operations.
pub type VpnResult<T> = Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(VpnError::Network(io).is_recoverable());
        assert!(VpnError::ConnectionLost("eof".into()).is_recoverable());
        assert!(VpnError::Cluster(ClusterError::Conflict("cm".into())).is_recoverable());

        assert!(!VpnError::EmptyChain.is_recoverable());
        assert!(!VpnError::tun_device("read failed").is_recoverable());
        assert!(!VpnError::Cluster(ClusterError::NotFound("pod".into())).is_recoverable());
    }

    #[test]
    fn test_unsupported_message() {
        let err = VpnError::Unsupported("tcp4".into());
        assert_eq!(err.to_string(), "tcp4 unsupported");
    }

    #[test]
    fn test_context_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = VpnError::config_with_source("load failed", io);
        let source = StdError::source(&err).expect("context");
        assert!(source.source().is_some());
    }
}
