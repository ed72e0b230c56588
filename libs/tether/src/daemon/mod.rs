//! Daemon
//!
//! Hosts registered objects behind one listening endpoint. A daemon owns
//! its registry, the instance lifecycle manager, the item stream table and
//! one [`ServerConnection`] per client. [`Daemon::request_loop`] runs the
//! accept/dispatch loop until [`Daemon::shutdown`] is called.
//!
//! ```rust,no_run
//! # async fn demo(target: tether::Target) -> tether::Result<()> {
//! use tether::{Daemon, ProtocolConfig};
//!
//! let daemon = Daemon::bind(ProtocolConfig::default()).await?;
//! let uri = daemon.register(target, Some("example.greeting"))?;
//! println!("serving {}", uri);
//! daemon.request_loop().await
//! # }
//! ```

mod daemon_object;
mod dispatch;
mod hooks;
mod server;
mod streams;
mod workers;

pub use hooks::{ConnectionInfo, DaemonHooks, DefaultHooks, HandshakeAccept};

use crate::context::{CallContext, ResourceTracker};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleManager, SessionInstances};
use crate::object::Target;
use crate::proxy::Proxy;
use crate::registry::Registry;
use crate::uri::Uri;
use daemon_object::DaemonObject;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use streams::StreamTable;
use tether_codec::{ClassRegistry, Message, MessageCodec, SerializerRegistry, Value};
use tether_config::{ProtocolConfig, ServerType, DAEMON_OBJECT_ID};
use tether_network::{Connection, Endpoint, Listener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use workers::WorkerPool;

/// Server side of one client connection
pub(crate) struct ServerConnection {
    pub(crate) conn: Connection,
    authenticated: AtomicBool,
    pub(crate) resources: ResourceTracker,
    pub(crate) sessions: SessionInstances,
    torn_down: AtomicBool,
}

impl ServerConnection {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            authenticated: AtomicBool::new(false),
            resources: ResourceTracker::new(),
            sessions: SessionInstances::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.conn.id()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.conn.id(),
            peer: self.conn.peer().clone(),
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// Context for a call carried by `request`
    pub(crate) fn context(&self, request: &Message) -> CallContext {
        CallContext::new(
            self.id(),
            self.conn.peer().clone(),
            self.is_authenticated(),
            self.resources.clone(),
        )
        .with_request(request.correlation_id, request.flags, request.annotations.clone())
    }

    /// First caller wins; later calls are no-ops
    fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

pub(crate) struct DaemonInner {
    pub(crate) config: Arc<ProtocolConfig>,
    pub(crate) location: Endpoint,
    listener: Mutex<Option<Listener>>,
    pub(crate) registry: Registry,
    pub(crate) lifecycle: LifecycleManager,
    pub(crate) serializers: SerializerRegistry,
    pub(crate) codec: MessageCodec,
    pub(crate) hooks: Arc<dyn DaemonHooks>,
    pub(crate) streams: StreamTable,
    pub(crate) workers: WorkerPool,
    pub(crate) connections: DashMap<u64, Arc<ServerConnection>>,
    combined: Mutex<Vec<Daemon>>,
    shutdown: watch::Sender<bool>,
    started: Instant,
}

impl DaemonInner {
    /// Resolves once shutdown has been requested
    pub(crate) fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Periodic maintenance run by the request loop
    pub(crate) fn housekeeping(&self) {
        let expired = self.streams.expire(Instant::now());
        if expired > 0 {
            debug!(expired, location = %self.location, "Expired item streams");
        }
    }

    pub(crate) fn uri_for(&self, object_id: &str) -> Result<Uri> {
        let resolved = self
            .registry
            .resolve(object_id)
            .ok_or_else(|| Error::daemon(format!("unknown object '{}'", object_id)))?;
        Ok(Uri::direct(resolved, self.location.clone()))
    }

    /// Snapshot served by the daemon object's `info` method
    pub(crate) fn info(&self) -> Value {
        let server_type = match self.config.server_type {
            ServerType::Threaded => "threaded",
            ServerType::Multiplexed => "multiplexed",
        };
        let mut info = BTreeMap::new();
        info.insert("location".to_string(), Value::Str(self.location.to_string()));
        info.insert("server_type".to_string(), Value::from(server_type));
        info.insert("objects".to_string(), Value::Int(self.registry.len() as i64));
        info.insert("connections".to_string(), Value::Int(self.connections.len() as i64));
        info.insert("streams".to_string(), Value::Int(self.streams.len() as i64));
        info.insert("workers".to_string(), Value::Int(self.workers.size() as i64));
        info.insert("busy_workers".to_string(), Value::Int(self.workers.busy() as i64));
        info.insert(
            "uptime".to_string(),
            Value::Float(self.started.elapsed().as_secs_f64()),
        );
        info.insert(
            "serializers".to_string(),
            Value::List(
                self.config
                    .serializers_accepted
                    .iter()
                    .map(|name| Value::Str(name.clone()))
                    .collect(),
            ),
        );
        Value::Map(info)
    }
}

/// Builder for a [`Daemon`] with non-default endpoint, hooks or classes
pub struct DaemonBuilder {
    config: ProtocolConfig,
    endpoint: Option<Endpoint>,
    hooks: Option<Arc<dyn DaemonHooks>>,
    classes: Option<Arc<ClassRegistry>>,
}

impl DaemonBuilder {
    /// Listen here instead of the configured host and port
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn hooks(mut self, hooks: impl DaemonHooks) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Custom classes the daemon's serializers understand
    pub fn classes(mut self, classes: Arc<ClassRegistry>) -> Self {
        self.classes = Some(classes);
        self
    }

    /// Validate the configuration and bind the listening socket
    pub async fn bind(self) -> Result<Daemon> {
        self.config
            .validate()
            .map_err(|e| Error::usage(format!("invalid configuration: {:#}", e)))?;

        let config = Arc::new(self.config);
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| Endpoint::tcp(config.host.clone(), config.port));
        let listener = Listener::bind(&endpoint).await?;
        let location = listener.endpoint().clone();

        let mut serializers = SerializerRegistry::with_accepted(&config.serializers_accepted)?;
        if let Some(classes) = self.classes {
            serializers = serializers.with_classes(classes);
        }
        let codec = MessageCodec::new(config.max_message_size, config.hmac_key_bytes())?;

        let inner = Arc::new(DaemonInner {
            location,
            listener: Mutex::new(Some(listener)),
            registry: Registry::new(),
            lifecycle: LifecycleManager::new(),
            serializers,
            codec,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(DefaultHooks)),
            streams: StreamTable::new(config.stream_lifetime(), config.stream_linger()),
            workers: WorkerPool::new(config.threadpool_size),
            connections: DashMap::new(),
            combined: Mutex::new(Vec::new()),
            shutdown: watch::channel(false).0,
            started: Instant::now(),
            config,
        });
        inner.registry.insert(
            DAEMON_OBJECT_ID,
            Target::instance(DaemonObject::new(Arc::downgrade(&inner))),
        )?;

        info!(
            location = %inner.location,
            server_type = ?inner.config.server_type,
            hmac = inner.codec.has_hmac(),
            "Daemon bound"
        );
        Ok(Daemon { inner })
    }
}

/// Handle to a running or bound daemon; clones share the same daemon
#[derive(Clone)]
pub struct Daemon {
    pub(crate) inner: Arc<DaemonInner>,
}

impl Daemon {
    pub fn builder(config: ProtocolConfig) -> DaemonBuilder {
        DaemonBuilder {
            config,
            endpoint: None,
            hooks: None,
            classes: None,
        }
    }

    /// Bind with the configured host and port and default hooks
    pub async fn bind(config: ProtocolConfig) -> Result<Self> {
        Self::builder(config).bind().await
    }

    /// Actual listening location, with the real port for ephemeral binds
    pub fn location(&self) -> &Endpoint {
        &self.inner.location
    }

    pub fn config(&self) -> &Arc<ProtocolConfig> {
        &self.inner.config
    }

    /// Register an object; without an id a unique one is generated
    pub fn register(&self, target: Target, object_id: Option<&str>) -> Result<Uri> {
        let object_id = match object_id {
            Some("") => return Err(Error::usage("object id must not be empty")),
            Some(id) => id.to_string(),
            None => format!("obj_{}", uuid::Uuid::new_v4().simple()),
        };
        let mode = target.mode();
        self.inner.registry.insert(&object_id, target)?;
        let uri = Uri::direct(object_id.clone(), self.inner.location.clone());
        info!(object_id = %object_id, ?mode, uri = %uri, "Registered object");
        Ok(uri)
    }

    /// Remove a registration; false if the id was not registered
    pub fn unregister(&self, object_id: &str) -> Result<bool> {
        if object_id == DAEMON_OBJECT_ID {
            return Err(Error::daemon("the daemon object cannot be unregistered"));
        }
        let removed = self.inner.registry.remove(object_id).is_some();
        if removed {
            self.inner.lifecycle.forget(object_id);
            info!(object_id, "Unregistered object");
        }
        Ok(removed)
    }

    /// Make `local_name` resolvable through LOCATION URIs
    pub fn alias(&self, local_name: &str, object_id: &str) -> Result<()> {
        self.inner.registry.alias(local_name, object_id)
    }

    /// DIRECT URI for a registered object id or alias
    pub fn uri_for(&self, object_id: &str) -> Result<Uri> {
        self.inner.uri_for(object_id)
    }

    /// Proxy to one of this daemon's objects
    pub fn proxy_for(&self, object_id: &str) -> Result<Proxy> {
        Proxy::new(self.uri_for(object_id)?, self.inner.config.clone())
    }

    /// Registered object ids, sorted
    pub fn registered(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Open item streams, lingering ones included
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn info(&self) -> Value {
        self.inner.info()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Serve `other`'s connections from this daemon's multiplexed loop.
    /// Must be called before [`Daemon::request_loop`].
    pub fn combine(&self, other: &Daemon) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(Error::usage("cannot combine a daemon with itself"));
        }
        let multiplexed = |daemon: &Daemon| daemon.inner.config.server_type == ServerType::Multiplexed;
        if !multiplexed(self) || !multiplexed(other) {
            return Err(Error::usage("only multiplexed daemons can be combined"));
        }
        self.inner.combined.lock().push(other.clone());
        info!(location = %self.inner.location, other = %other.inner.location, "Combined daemon loops");
        Ok(())
    }

    /// Run the request loop in a background task
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let daemon = self.clone();
        tokio::spawn(async move { daemon.request_loop().await })
    }

    /// Stop the loop, close every connection and drop all registrations
    /// except the daemon object. Idempotent.
    pub async fn shutdown(&self) {
        let combined = std::mem::take(&mut *self.inner.combined.lock());
        self.stop().await;
        for other in combined {
            other.stop().await;
        }
    }

    async fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!(location = %self.inner.location, "Daemon shutting down");

        self.inner.listener.lock().take();
        self.close_connections().await;
        self.inner.workers.close();
        let streams = self.inner.streams.clear();
        let objects = self.inner.registry.clear_except(DAEMON_OBJECT_ID);
        self.inner.lifecycle.clear();
        info!(location = %self.inner.location, streams, objects, "Daemon stopped");
    }

    pub(crate) fn take_listener(&self) -> Result<Listener> {
        self.inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::usage("request loop already running or daemon shut down"))
    }

    async fn close_connections(&self) {
        let connections: Vec<Arc<ServerConnection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in connections {
            self.teardown(&conn).await;
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("location", &self.inner.location)
            .field("objects", &self.inner.registry.len())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}
