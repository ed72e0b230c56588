//! Daemon Hooks
//!
//! Extension points a daemon calls at fixed moments in a connection's life.
//! Every method has a default, so implementors override only what they need.

use crate::context::CallContext;
use tether_codec::{Annotations, Value};
use tether_network::PeerAddr;

/// Identity of a client connection as seen by hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: PeerAddr,
}

/// Accepted handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeAccept {
    /// Data returned to the client in CONNECT_OK
    pub response: Value,
    /// Unlocks methods that require authentication
    pub authenticated: bool,
}

impl HandshakeAccept {
    pub fn new(response: impl Into<Value>) -> Self {
        Self {
            response: response.into(),
            authenticated: false,
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

pub trait DaemonHooks: Send + Sync + 'static {
    /// Inspect the client's handshake data; `Err` rejects the connection
    /// with the given reason
    fn validate_handshake(
        &self,
        _conn: &ConnectionInfo,
        _data: &Value,
    ) -> Result<HandshakeAccept, String> {
        Ok(HandshakeAccept::new("hello"))
    }

    /// Called once after a client connection is torn down
    fn client_disconnect(&self, _conn: &ConnectionInfo) {}

    /// Extra annotations for every normal reply
    fn response_annotations(&self, _ctx: &CallContext) -> Annotations {
        Annotations::new()
    }
}

/// Accepts every handshake and adds nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl DaemonHooks for DefaultHooks {}
