//! # Tether Configuration
//!
//! Immutable configuration for the remote-object runtime. A single
//! [`ProtocolConfig`] value is built once (defaults, optional TOML file,
//! `TETHER_*` environment overrides), validated, and then shared as an
//! `Arc` by daemons, proxies, codecs and connections.
//!
//! ## Usage
//!
//! ```rust
//! use tether_config::{ProtocolConfig, ServerType};
//!
//! let config = ProtocolConfig::default()
//!     .with_comm_timeout(2.5)
//!     .with_server_type(ServerType::Multiplexed);
//! config.validate().unwrap();
//! assert_eq!(config.ns_port, tether_config::DEFAULT_NS_PORT);
//! ```

pub mod protocol;
pub mod protocol_config;

// Re-export commonly used types
pub use protocol::*;
pub use protocol_config::{load_config, ProtocolConfig, ServerType};
