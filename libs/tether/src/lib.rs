//! # Tether Remote Object Runtime
//!
//! ## Purpose
//!
//! Lets a client hold a local [`Proxy`] for an object living in a server
//! process, turning method calls into framed messages and back:
//! - four URI schemes (DIRECT, NAME, LOCATION, METADATA) and a [`Resolver`]
//! - a [`Daemon`] with threaded or multiplexed request loops
//! - instance modes (single, session, percall) next to pinned instances
//! - oneway, batched, streamed and asynchronous calls
//! - per-connection resource tracking and cleanup
//! - an in-memory name server
//!
//! ## Architecture Role
//!
//! ```text
//! Proxy → Resolver → Connection (handshake) → codec → network
//!                                                       ↓
//! target object ← lifecycle manager ← registry ← Daemon dispatch
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tether::{
//!     args, CallContext, Capabilities, Daemon, Expose, Invocation, ProtocolConfig, Proxy,
//!     RemoteError, RemoteObject, Reply, Target,
//! };
//!
//! struct Calculator;
//!
//! #[async_trait]
//! impl RemoteObject for Calculator {
//!     async fn invoke(&self, _ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
//!         match call.method.as_str() {
//!             "add" => Ok(Reply::value(call.i64_arg(0, "a")? + call.i64_arg(1, "b")?)),
//!             other => Err(RemoteError::attribute(other.to_string())),
//!         }
//!     }
//! }
//!
//! impl Expose for Calculator {
//!     fn capabilities() -> Capabilities {
//!         Capabilities::new().method("add")
//!     }
//! }
//!
//! # async fn demo() -> tether::Result<()> {
//! let daemon = Daemon::bind(ProtocolConfig::default()).await?;
//! let uri = daemon.register(Target::instance(Calculator), Some("calculator"))?;
//! daemon.spawn();
//!
//! let proxy = Proxy::new(uri, daemon.config().clone())?;
//! assert_eq!(proxy.call("add", args![2, 3]).await?.as_i64(), Some(5));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod daemon;
pub mod error;
pub mod lifecycle;
pub mod naming;
pub mod object;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod uri;

// Re-export commonly used types
pub use context::{CallContext, Resource, ResourceHandle, ResourceTracker};
pub use daemon::{ConnectionInfo, Daemon, DaemonBuilder, DaemonHooks, DefaultHooks, HandshakeAccept};
pub use error::{Error, RemoteError, Result};
pub use lifecycle::InstanceMode;
pub use naming::{locate_ns, start_ns, start_ns_on, MemoryStorage, NameServer, NameServerClient, NameServerHandle, NameStorage};
pub use object::{Capabilities, Expose, Invocation, ItemStream, MethodSpec, RemoteObject, Reply, Target};
pub use proxy::{Batch, BatchResults, FutureCall, FutureResult, Proxy, ProxyStats, RemoteStream};
pub use resolver::Resolver;
pub use uri::{Scheme, Uri};

pub use tether_codec::{args, AnnotationTag, Annotations, ClassRegistry, Value};
pub use tether_config::{ProtocolConfig, ServerType, DAEMON_OBJECT_ID, NAMESERVER_NAME};
pub use tether_network::Endpoint;
