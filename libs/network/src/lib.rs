//! Network Infrastructure
//!
//! Transport layer for the Tether runtime: endpoints, TCP and Unix-domain
//! listeners, and framed [`Connection`]s that exchange codec messages.

pub mod connection;
pub mod error;
pub mod transports;

// Re-export commonly used types
pub use connection::{generate_connection_id, Connection, ConnectionState, ConnectionStats};
pub use error::{Result, TransportError};
pub use transports::{BoxedStream, Endpoint, Listener, PeerAddr, UNIX_LOCATION_PREFIX};
