//! # Tether Wire Codec
//!
//! ## Purpose
//!
//! Byte-exact framing of Tether messages, independent of the payload
//! serializer:
//! - fixed 44-byte header with magic, version, type, flags, sequence number,
//!   serializer id, annotation and body lengths, correlation id, checksum
//! - annotation blocks (4-byte ASCII tag + length + bytes)
//! - optional HMAC-SHA256 digest over header, annotations and body
//! - payload serializers (JSON, bincode) behind an accepted-id allow-list
//! - class codec registry for application types
//!
//! ## Architecture Role
//!
//! ```text
//! tether (daemon/proxy) → [codec] → network (framed connections)
//!        ↑                   ↓
//!   Payload / Value     Message frames
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket handling (belongs in `tether-network`)
//! - Dispatch, registries or proxies (belongs in `tether`)

pub mod annotations;
pub mod class_registry;
pub mod error;
pub mod message;
pub mod payload;
pub mod security;
pub mod serializer;
pub mod value;

pub use annotations::{AnnotationTag, Annotations};
pub use class_registry::ClassRegistry;
pub use error::{CodecError, Result};
pub use message::{Message, MessageCodec, MessageFlags, MessageHeader, MessageType, WireFormat};
pub use payload::{
    CallBody, ErrorEnvelope, HandshakeReply, HandshakeRequest, ObjectMetadata, Outcome, Payload,
};
pub use security::MessageAuthenticator;
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer, SerializerRegistry};
pub use value::Value;
