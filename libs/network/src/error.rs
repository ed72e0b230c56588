//! Transport Error Types
//!
//! Error handling for socket setup, framed message exchange and connection
//! teardown. `Communication` is the base transport fault; `ConnectionClosed`
//! and `Timeout` refine it.

use std::net::SocketAddr;
use tether_codec::CodecError;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Communication error: {message}")]
    Communication {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Peer closed the connection, or it was closed locally
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Framing, HMAC or size violations reported by the codec
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation not allowed in the connection's current state
    #[error("Invalid connection state: {message}")]
    State { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a communication error
    pub fn communication(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Communication {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a communication error with source
    pub fn communication_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Communication {
            message: message.into(),
            remote_addr: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Map a socket read/write failure: EOF-like kinds mean the peer went away
    pub fn from_stream(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
                Self::connection_closed(format!("{}: {}", context, err))
            }
            _ => Self::communication_with_source(context.to_string(), err),
        }
    }

    /// True for every transport fault (the communication family)
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            TransportError::Communication { .. }
                | TransportError::ConnectionClosed { .. }
                | TransportError::Timeout { .. }
                | TransportError::Io { .. }
        )
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed { .. } | TransportError::Communication { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Communication { .. } => "communication",
            TransportError::ConnectionClosed { .. } => "connection_closed",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Codec(e) => e.category(),
            TransportError::State { .. } => "state",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Io { .. } => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_map_to_closed() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            TransportError::from_stream("read header", eof),
            TransportError::ConnectionClosed { .. }
        ));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            TransportError::from_stream("write", other),
            TransportError::Communication { .. }
        ));
    }

    #[test]
    fn communication_family() {
        assert!(TransportError::timeout("recv", 10).is_communication());
        assert!(TransportError::connection_closed("bye").is_communication());
        assert!(!TransportError::from(CodecError::message_too_large(2, 1)).is_communication());
        assert_eq!(TransportError::from(CodecError::message_too_large(2, 1)).category(), "size");
    }
}
