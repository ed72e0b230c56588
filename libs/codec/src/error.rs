//! Codec-level errors for message framing and payload serialization
//!
//! Framing faults (bad magic, version, checksum, HMAC) are protocol
//! violations; payload faults (unknown serializer, refused type tag) are
//! serialization errors. Oversized bodies get their own variant so callers
//! can report them without parsing a message string.

use thiserror::Error;

/// Errors raised while encoding or decoding a message
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Protocol magic marker validation failed
    #[error("Invalid magic marker: expected {expected:?}, got {actual:?} (indicates: {diagnosis})")]
    InvalidMagic {
        expected: [u8; 4],
        actual: [u8; 4],
        diagnosis: String,
    },

    /// Protocol version is not supported by this codec
    #[error("Unsupported protocol version {version}: supported version is {supported}")]
    UnsupportedVersion { version: u16, supported: u16 },

    /// Header checksum does not match the header fields
    #[error("Header checksum mismatch: expected {expected:#010x}, calculated {calculated:#010x}")]
    ChecksumMismatch { expected: u32, calculated: u32 },

    /// Message type number is not recognized
    #[error("Unknown message type {msg_type}")]
    UnknownMessageType { msg_type: u16 },

    /// Body exceeds the configured maximum
    #[error("Message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Annotation blocks are malformed
    #[error("Invalid annotation at offset {offset}: {reason}")]
    InvalidAnnotation { offset: usize, reason: String },

    /// HMAC missing, unexpected or wrong
    #[error("Message authentication failed: {reason}")]
    Authentication { reason: String },

    /// Serializer id is unknown or not on the accepted list
    #[error("Serializer {id} is not accepted (accepted: {accepted})")]
    SerializerNotAccepted { id: u16, accepted: String },

    /// Payload could not be encoded or decoded
    #[error("Serialization failed ({serializer}): {message}")]
    Serialize { serializer: String, message: String },

    /// Custom value carries a type tag without a registered codec
    #[error("No codec registered for type tag '{tag}'")]
    UnknownTypeTag { tag: String },
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create InvalidMagic error with a guess at what went wrong
    pub fn invalid_magic(expected: [u8; 4], actual: [u8; 4]) -> Self {
        let diagnosis = if actual == [0; 4] {
            "uninitialized buffer"
        } else if actual.iter().all(u8::is_ascii_alphabetic) {
            "peer speaks a different protocol"
        } else {
            "data corruption or framing error"
        };

        Self::InvalidMagic {
            expected,
            actual,
            diagnosis: diagnosis.to_string(),
        }
    }

    pub fn message_too_large(size: usize, max: usize) -> Self {
        Self::MessageTooLarge { size, max }
    }

    pub fn invalid_annotation(offset: usize, reason: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            offset,
            reason: reason.into(),
        }
    }

    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn serialize(serializer: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialize {
            serializer: serializer.into(),
            message: message.to_string(),
        }
    }

    pub fn unknown_type_tag(tag: impl Into<String>) -> Self {
        Self::UnknownTypeTag { tag: tag.into() }
    }

    /// True for faults in the payload rather than the frame
    pub fn is_serialization(&self) -> bool {
        matches!(
            self,
            CodecError::Serialize { .. }
                | CodecError::SerializerNotAccepted { .. }
                | CodecError::UnknownTypeTag { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CodecError::MessageTooSmall { .. }
            | CodecError::InvalidMagic { .. }
            | CodecError::UnsupportedVersion { .. }
            | CodecError::ChecksumMismatch { .. }
            | CodecError::UnknownMessageType { .. }
            | CodecError::InvalidAnnotation { .. } => "framing",
            CodecError::MessageTooLarge { .. } => "size",
            CodecError::Authentication { .. } => "security",
            _ => "serialization",
        }
    }
}
