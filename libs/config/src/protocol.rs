//! Protocol constants
//!
//! Well-known object ids, default ports and the names used for the
//! stock payload serializers. Everything here is fixed at compile time;
//! tunable values live on [`crate::ProtocolConfig`].

/// Object id of the built-in object every daemon registers for itself
pub const DAEMON_OBJECT_ID: &str = "Tether.Daemon";

/// Registration name (and object id) of the name server
pub const NAMESERVER_NAME: &str = "Tether.NameServer";

/// Default name server port, used when a NAME or METADATA location omits one
pub const DEFAULT_NS_PORT: u16 = 9090;

/// Default daemon port (0 lets the OS pick one)
pub const DEFAULT_DAEMON_PORT: u16 = 0;

/// Default bind host for daemons and the name server
pub const DEFAULT_HOST: &str = "localhost";

/// Prefix for environment variable overrides (`TETHER_COMM_TIMEOUT=2.5`)
pub const ENV_PREFIX: &str = "TETHER";

/// Payload serializer names understood by the codec
pub mod serializers {
    pub const JSON: &str = "json";
    pub const BINCODE: &str = "bincode";

    /// All stock serializers, in preference order
    pub const ALL: &[&str] = &[JSON, BINCODE];
}
