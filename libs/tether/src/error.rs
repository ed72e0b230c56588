//! Runtime Error Types
//!
//! One taxonomy for everything a caller of the runtime can see. The
//! communication family (`Communication`, `ConnectionClosed`, `Timeout`)
//! covers transport faults; `Remote` carries an error raised inside a
//! remote method, with the remote kind and traceback preserved.

use std::fmt;
use tether_codec::{CodecError, ErrorEnvelope};
use tether_network::TransportError;
use thiserror::Error;

/// Remote error kind for daemon-level refusals
pub const DAEMON_ERROR: &str = "DaemonError";
/// Remote error kind for name service failures
pub const NAMING_ERROR: &str = "NamingError";
/// Remote error kind for calls to methods that are not exposed
pub const ATTRIBUTE_ERROR: &str = "AttributeError";
/// Remote error kind for requests the daemon cannot serve as sent
pub const PROTOCOL_ERROR: &str = "ProtocolError";
/// Remote error kind for unknown, expired or foreign item streams
pub const STREAM_ERROR: &str = "StreamError";

/// Main runtime error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Base transport fault
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Peer went away or the connection was closed locally
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Wire-level violation: bad header, HMAC, sequence number
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Naming error: {message}")]
    Naming { message: String },

    /// Daemon refused the call (unknown object, missing authentication)
    #[error("Daemon error: {message}")]
    Daemon { message: String },

    #[error("Serialization error: {message}")]
    Serialize { message: String },

    #[error("Message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed URI '{uri}': {reason}")]
    MalformedUri { uri: String, reason: String },

    /// Local misuse of the API; never reaches the wire
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// Error raised by the remote method
    #[error("Remote error: {0}")]
    Remote(RemoteError),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn naming(message: impl Into<String>) -> Self {
        Self::Naming {
            message: message.into(),
        }
    }

    pub fn daemon(message: impl Into<String>) -> Self {
        Self::Daemon {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn malformed_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Re-raise an error envelope received from a daemon
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        match envelope.kind.as_str() {
            DAEMON_ERROR => Self::Daemon {
                message: envelope.message,
            },
            NAMING_ERROR => Self::Naming {
                message: envelope.message,
            },
            PROTOCOL_ERROR => Self::Protocol {
                message: envelope.message,
            },
            _ => Self::Remote(RemoteError::from(envelope)),
        }
    }

    /// True for the communication family
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Error::Communication { .. } | Error::ConnectionClosed { .. } | Error::Timeout { .. }
        )
    }

    /// Remote error kind, when the error came from the other side
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            Error::Remote(remote) => Some(&remote.kind),
            _ => None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Communication { .. } => "communication",
            Error::ConnectionClosed { .. } => "connection_closed",
            Error::Timeout { .. } => "timeout",
            Error::Protocol { .. } => "protocol",
            Error::Naming { .. } => "naming",
            Error::Daemon { .. } => "daemon",
            Error::Serialize { .. } => "serialize",
            Error::MessageTooLarge { .. } => "message_too_large",
            Error::MalformedUri { .. } => "malformed_uri",
            Error::Usage { .. } => "usage",
            Error::Remote(_) => "remote",
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MessageTooLarge { size, max } => Error::MessageTooLarge { size, max },
            e if e.is_serialization() => Error::Serialize {
                message: e.to_string(),
            },
            e => Error::Protocol {
                message: e.to_string(),
            },
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Codec(e) => e.into(),
            TransportError::ConnectionClosed { message } => Error::ConnectionClosed { message },
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => Error::Timeout {
                operation,
                timeout_ms,
            },
            TransportError::State { message } => Error::Protocol { message },
            TransportError::Configuration { message, .. } => Error::Usage { message },
            e @ (TransportError::Communication { .. } | TransportError::Io { .. }) => {
                Error::Communication {
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Error raised by a remote method, as carried over the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error kind name, e.g. `ValueError`
    pub kind: String,
    pub message: String,
    /// Frame descriptions, outermost first
    pub traceback: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Method is not exposed on the target
    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ATTRIBUTE_ERROR, message)
    }

    pub fn daemon(message: impl Into<String>) -> Self {
        Self::new(DAEMON_ERROR, message)
    }

    pub fn naming(message: impl Into<String>) -> Self {
        Self::new(NAMING_ERROR, message)
    }

    /// Missing or ill-typed call argument
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// Append a traceback frame
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.traceback.push(frame.into());
        self
    }

    /// Prepend an outer traceback frame
    pub fn with_frame_first(mut self, frame: impl Into<String>) -> Self {
        self.traceback.insert(0, frame.into());
        self
    }

    /// Traceback text as the remote side formatted it
    pub fn formatted_traceback(&self) -> String {
        let mut text = String::from("Remote traceback (most recent call last):\n");
        for frame in &self.traceback {
            text.push_str("  ");
            text.push_str(frame);
            text.push('\n');
        }
        text.push_str(&self.to_string());
        text
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorEnvelope> for RemoteError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self {
            kind: envelope.kind,
            message: envelope.message,
            traceback: envelope.traceback,
        }
    }
}

impl From<RemoteError> for ErrorEnvelope {
    fn from(err: RemoteError) -> Self {
        ErrorEnvelope {
            kind: err.kind,
            message: err.message,
            traceback: err.traceback,
        }
    }
}

/// Map a local runtime error into an envelope, e.g. when a remote method
/// itself made a failing call
impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        match err {
            Error::Remote(remote) => remote,
            Error::Daemon { message } => RemoteError::daemon(message),
            Error::Naming { message } => RemoteError::naming(message),
            other => RemoteError::new(error_kind_name(&other), other.to_string()),
        }
    }
}

fn error_kind_name(err: &Error) -> &'static str {
    match err {
        Error::Communication { .. } => "CommunicationError",
        Error::ConnectionClosed { .. } => "ConnectionClosedError",
        Error::Timeout { .. } => "TimeoutError",
        Error::Protocol { .. } => PROTOCOL_ERROR,
        Error::Naming { .. } => NAMING_ERROR,
        Error::Daemon { .. } => DAEMON_ERROR,
        Error::Serialize { .. } => "SerializeError",
        Error::MessageTooLarge { .. } => "MessageTooLargeError",
        Error::MalformedUri { .. } => "MalformedUriError",
        Error::Usage { .. } => "UsageError",
        Error::Remote(_) => "RemoteError",
    }
}
