//! Proxy
//!
//! Client-side stand-in for a remote object. A proxy connects lazily on
//! its first call, resolving symbolic URIs on the way, and then keeps one
//! connection whose request/reply exchanges are strictly serialized.
//!
//! ```rust,no_run
//! # async fn demo() -> tether::Result<()> {
//! use std::sync::Arc;
//! use tether::{args, ProtocolConfig, Proxy, Uri};
//!
//! let config = Arc::new(ProtocolConfig::default());
//! let proxy = Proxy::new(Uri::parse("NAME:example.calculator")?, config)?;
//! let sum = proxy.call("add", args![2, 3]).await?;
//! assert_eq!(sum.as_i64(), Some(5));
//! # Ok(())
//! # }
//! ```

mod batch;
mod future;
mod stream;

pub use batch::{Batch, BatchResults};
pub use future::{FutureCall, FutureResult};
pub use stream::RemoteStream;

use crate::error::{Error, RemoteError, Result};
use crate::object::{GET_ATTRIBUTE, SET_ATTRIBUTE};
use crate::resolver::Resolver;
use crate::uri::Uri;
use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_codec::{
    AnnotationTag, Annotations, CallBody, ClassRegistry, HandshakeRequest, Message, MessageCodec,
    MessageFlags, MessageType, ObjectMetadata, Payload, SerializerRegistry, Value,
};
use tether_config::{ProtocolConfig, DAEMON_OBJECT_ID};
use tether_network::{Connection, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-side check of the daemon's handshake response
pub type HandshakeValidator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Snapshot of a proxy's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Completed request/reply exchanges
    pub round_trips: u64,
    /// Connections re-established after a drop
    pub reconnects: u64,
    /// Successful handshakes
    pub connects: u64,
}

#[derive(Debug, Default)]
struct ProxyMetrics {
    round_trips: AtomicU64,
    reconnects: AtomicU64,
    connects: AtomicU64,
}

#[derive(Clone)]
struct ProxyOptions {
    timeout: Option<Duration>,
    oneway: BTreeSet<String>,
    annotations: Annotations,
    handshake: Value,
    validator: Option<HandshakeValidator>,
    autoreconnect: bool,
}

#[derive(Default)]
struct ProxyState {
    connection: Option<Connection>,
    /// DIRECT URI the connection points at
    resolved: Option<Uri>,
    metadata: Option<ObjectMetadata>,
    seq: u16,
}

impl ProxyState {
    fn disconnect(&mut self) {
        self.connection = None;
        self.resolved = None;
        self.metadata = None;
    }
}

/// What the current connection is bound to, as seen by request builders
pub(crate) struct Bound<'a> {
    pub(crate) object_id: &'a str,
    pub(crate) metadata: Option<&'a ObjectMetadata>,
}

impl Bound<'_> {
    /// Refuse locally what the daemon's metadata says it does not expose
    pub(crate) fn ensure_method(&self, method: &str) -> Result<()> {
        match self.metadata {
            Some(meta) if !meta.methods.contains(method) => Err(Error::Remote(RemoteError::attribute(format!(
                "remote object '{}' has no exposed method '{}'",
                self.object_id, method
            )))),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_attribute(&self, name: &str) -> Result<()> {
        match self.metadata {
            Some(meta) if !meta.attrs.contains(name) => Err(Error::Remote(RemoteError::attribute(format!(
                "remote object '{}' has no exposed attribute '{}'",
                self.object_id, name
            )))),
            _ => Ok(()),
        }
    }
}

/// One outgoing request
pub(crate) struct Outgoing {
    /// `None` sends a PING
    payload: Option<Payload>,
    flags: MessageFlags,
    /// Correlation id the reply must carry, error replies included
    reply_correlation: Option<Uuid>,
}

impl Outgoing {
    pub(crate) fn call(call: CallBody, oneway: bool) -> Self {
        Self {
            payload: Some(Payload::Call(call)),
            flags: MessageFlags {
                oneway,
                ..MessageFlags::default()
            },
            reply_correlation: None,
        }
    }

    pub(crate) fn batch(calls: Vec<CallBody>, oneway: bool) -> Self {
        Self {
            payload: Some(Payload::Batch(calls)),
            flags: MessageFlags {
                oneway,
                batch: true,
                ..MessageFlags::default()
            },
            reply_correlation: None,
        }
    }

    /// Pull the next item of the stream opened by the call `correlation_id`
    pub(crate) fn stream_pull(call: CallBody, correlation_id: Uuid) -> Self {
        Self {
            reply_correlation: Some(correlation_id),
            ..Self::call(call, false)
        }
    }

    fn ping() -> Self {
        Self {
            payload: None,
            flags: MessageFlags::default(),
            reply_correlation: None,
        }
    }
}

/// A received reply and its decoded body
pub(crate) struct Exchange {
    pub(crate) message: Message,
    pub(crate) payload: Payload,
}

pub struct Proxy {
    uri: Uri,
    config: Arc<ProtocolConfig>,
    serializers: SerializerRegistry,
    serializer_id: u16,
    state: Mutex<ProxyState>,
    options: RwLock<ProxyOptions>,
    response_annotations: SyncMutex<Annotations>,
    metrics: ProxyMetrics,
}

impl Proxy {
    pub fn new(uri: Uri, config: impl Into<Arc<ProtocolConfig>>) -> Result<Self> {
        let config = config.into();
        let serializers = SerializerRegistry::new();
        let serializer_id = serializers.by_name(&config.serializer)?.id();
        let options = ProxyOptions {
            timeout: config.comm_timeout_duration(),
            oneway: BTreeSet::new(),
            annotations: Annotations::new(),
            handshake: Value::from("hello"),
            validator: None,
            autoreconnect: false,
        };
        Ok(Self {
            uri,
            config,
            serializers,
            serializer_id,
            state: Mutex::new(ProxyState::default()),
            options: RwLock::new(options),
            response_annotations: SyncMutex::new(Annotations::new()),
            metrics: ProxyMetrics::default(),
        })
    }

    /// Proxy for an object reference received in a reply
    pub fn from_value(value: &Value, config: impl Into<Arc<ProtocolConfig>>) -> Result<Self> {
        let reference = value
            .as_proxy()
            .ok_or_else(|| Error::usage(format!("expected an object reference, got {}", value.type_name())))?;
        Self::parse(reference, config)
    }

    /// Parse `uri` with the configured name-service port
    pub fn parse(uri: &str, config: impl Into<Arc<ProtocolConfig>>) -> Result<Self> {
        let config = config.into();
        let uri = Uri::parse_with_ns_port(uri, config.ns_port)?;
        Self::new(uri, config)
    }

    /// Custom classes this proxy can send and receive
    pub fn with_classes(mut self, classes: Arc<ClassRegistry>) -> Self {
        self.serializers = self.serializers.with_classes(classes);
        self
    }

    /// URI the proxy was created with
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn config(&self) -> &Arc<ProtocolConfig> {
        &self.config
    }

    /// DIRECT URI of the current connection, if connected
    pub async fn resolved_uri(&self) -> Option<Uri> {
        self.state.lock().await.resolved.clone()
    }

    /// Call a remote method with positional arguments
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(method, args, BTreeMap::new()).await
    }

    /// Call a remote method with positional and keyword arguments.
    /// Oneway methods return `Null` as soon as the request is written.
    pub async fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let marked_oneway = self.options.read().oneway.contains(method);
        let reply = self
            .exchange(|bound: &Bound<'_>| {
                bound.ensure_method(method)?;
                let oneway = marked_oneway || bound.metadata.is_some_and(|meta| meta.oneway.contains(method));
                let call = CallBody {
                    object_id: bound.object_id.to_string(),
                    method: method.to_string(),
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                };
                Ok(Outgoing::call(call, oneway))
            })
            .await?;

        let Some(exchange) = reply else {
            return Ok(Value::Null);
        };
        if exchange.message.flags.item_stream {
            if let Some(stream_id) = stream_id_of(&exchange) {
                if let Err(e) = self.close_stream(&stream_id).await {
                    debug!(error = %e, "Failed to close unexpected item stream");
                }
            }
            return Err(Error::usage(format!(
                "method '{}' returned an item stream; use call_stream",
                method
            )));
        }
        data_of(exchange)
    }

    /// Call a method that returns an item stream
    pub async fn call_stream(&self, method: &str, args: Vec<Value>) -> Result<RemoteStream<'_>> {
        let reply = self
            .exchange(|bound: &Bound<'_>| {
                bound.ensure_method(method)?;
                Ok(Outgoing::call(CallBody::new(bound.object_id, method, args.clone()), false))
            })
            .await?
            .ok_or_else(|| Error::protocol("no reply to a stream call"))?;

        if !reply.message.flags.item_stream {
            return Err(Error::usage(format!("method '{}' did not return an item stream", method)));
        }
        let stream_id = stream_id_of(&reply)
            .ok_or_else(|| Error::protocol("item stream reply without a stream id"))?;
        Ok(RemoteStream::new(self, stream_id, reply.message.correlation_id))
    }

    /// Read an attribute the object exposes
    pub async fn get_attr(&self, name: &str) -> Result<Value> {
        let reply = self
            .exchange(|bound: &Bound<'_>| {
                bound.ensure_attribute(name)?;
                let call = CallBody::new(bound.object_id, GET_ATTRIBUTE, vec![Value::from(name)]);
                Ok(Outgoing::call(call, false))
            })
            .await?
            .ok_or_else(|| Error::protocol("no reply to an attribute read"))?;
        data_of(reply)
    }

    /// Write an attribute the object exposes as writable
    pub async fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.exchange(|bound: &Bound<'_>| {
            bound.ensure_attribute(name)?;
            let call = CallBody::new(bound.object_id, SET_ATTRIBUTE, vec![Value::from(name), value.clone()]);
            Ok(Outgoing::call(call, false))
        })
        .await
        .map(|_| ())
    }

    /// Queue several calls and send them in one round trip
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    /// Prepare an asynchronous call on an independent connection
    pub fn future(&self, method: &str) -> FutureCall {
        FutureCall::new(self.clone_unconnected(), method)
    }

    /// Round trip without invoking anything
    pub async fn ping(&self) -> Result<()> {
        self.exchange(|_: &Bound<'_>| Ok(Outgoing::ping())).await.map(|_| ())
    }

    /// Connect and handshake now instead of on the first call
    pub async fn bind(&self) -> Result<()> {
        let options = self.options.read().clone();
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state, &options).await
    }

    /// Close the connection; the next call reconnects
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.connection.take() {
            connection.close().await;
            debug!(uri = %self.uri, "Proxy released");
        }
        state.disconnect();
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Metadata received during the handshake
    pub async fn metadata(&self) -> Option<ObjectMetadata> {
        self.state.lock().await.metadata.clone()
    }

    /// Per-call timeout; `None` waits forever
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.options.write().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.read().timeout
    }

    /// Re-establish dropped connections transparently, up to `max_retries`
    /// times per call; a budget of 0 never retries
    pub fn set_autoreconnect(&self, enabled: bool) {
        self.options.write().autoreconnect = enabled;
    }

    /// Treat `method` as oneway even without daemon metadata
    pub fn set_oneway(&self, method: &str, oneway: bool) {
        let mut options = self.options.write();
        if oneway {
            options.oneway.insert(method.to_string());
        } else {
            options.oneway.remove(method);
        }
    }

    /// Annotation sent with every request
    pub fn set_annotation(&self, tag: AnnotationTag, data: impl Into<Bytes>) -> Result<()> {
        if tag == AnnotationTag::HMAC {
            return Err(Error::usage("the HMAC annotation is reserved"));
        }
        self.options.write().annotations.insert(tag, data);
        Ok(())
    }

    /// Annotations of the most recent reply
    pub fn response_annotations(&self) -> Annotations {
        self.response_annotations.lock().clone()
    }

    /// Data sent in the next handshake
    pub fn set_handshake(&self, data: impl Into<Value>) {
        self.options.write().handshake = data.into();
    }

    /// Check the daemon's handshake response; `Err` rejects the connection
    pub fn set_handshake_validator<F>(&self, validator: F)
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.options.write().validator = Some(Arc::new(validator));
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            round_trips: self.metrics.round_trips.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            connects: self.metrics.connects.load(Ordering::Relaxed),
        }
    }

    /// Same target and options, but its own connection and counters
    pub fn clone_unconnected(&self) -> Proxy {
        Proxy {
            uri: self.uri.clone(),
            config: self.config.clone(),
            serializers: self.serializers.clone(),
            serializer_id: self.serializer_id,
            state: Mutex::new(ProxyState::default()),
            options: RwLock::new(self.options.read().clone()),
            response_annotations: SyncMutex::new(Annotations::new()),
            metrics: ProxyMetrics::default(),
        }
    }

    pub(crate) async fn close_stream(&self, stream_id: &str) -> Result<()> {
        let stream_id = Value::from(stream_id);
        self.exchange(|_: &Bound<'_>| {
            Ok(Outgoing::call(CallBody::new(DAEMON_OBJECT_ID, "close_stream", vec![stream_id.clone()]), true))
        })
        .await
        .map(|_| ())
    }

    /// One request/reply exchange, reconnecting on dropped connections when
    /// autoreconnect is on
    pub(crate) async fn exchange<F>(&self, build: F) -> Result<Option<Exchange>>
    where
        F: Fn(&Bound<'_>) -> Result<Outgoing> + Send + Sync,
    {
        let options = self.options.read().clone();
        let retries = if options.autoreconnect {
            self.config.max_retries
        } else {
            0
        };
        let mut attempt = 0;
        let mut state = self.state.lock().await;
        loop {
            match self.exchange_once(&mut state, &options, &build).await {
                Err(Error::ConnectionClosed { message }) if attempt < retries => {
                    attempt += 1;
                    state.disconnect();
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(uri = %self.uri, attempt, %message, "Connection lost, reconnecting");
                }
                other => return other,
            }
        }
    }

    async fn exchange_once<F>(
        &self,
        state: &mut ProxyState,
        options: &ProxyOptions,
        build: &F,
    ) -> Result<Option<Exchange>>
    where
        F: Fn(&Bound<'_>) -> Result<Outgoing> + Send + Sync,
    {
        self.ensure_connected(state, options).await?;
        let outgoing = {
            let object_id = state.resolved.as_ref().map(Uri::object).unwrap_or_default();
            build(&Bound {
                object_id,
                metadata: state.metadata.as_ref(),
            })?
        };
        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;

        let message = match &outgoing.payload {
            Some(payload) => {
                let body = self.serializers.encode(self.serializer_id, payload)?;
                Message::new(MessageType::Invoke, seq, self.serializer_id, body)
            }
            None => Message::new(MessageType::Ping, seq, self.serializer_id, Bytes::new()),
        }
        .with_flags(outgoing.flags)
        .with_correlation_id(Uuid::new_v4())
        .with_annotations(options.annotations.clone());

        let Some(connection) = state.connection.as_ref() else {
            return Err(Error::connection_closed("not connected"));
        };
        if let Err(e) = connection.send(&message).await {
            if connection.is_closed() {
                state.disconnect();
            }
            return Err(e.into());
        }
        if outgoing.flags.oneway {
            return Ok(None);
        }

        let reply = match connection.recv_timeout(options.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                // The reply may still arrive later and would desync the stream
                state.disconnect();
                return Err(e.into());
            }
        };
        self.metrics.round_trips.fetch_add(1, Ordering::Relaxed);

        if reply.msg_type != MessageType::Result {
            state.disconnect();
            return Err(Error::protocol(format!("expected RESULT, got {:?}", reply.msg_type)));
        }
        if reply.seq != seq {
            state.disconnect();
            return Err(Error::protocol(format!(
                "invalid sequence number: expected {}, got {}",
                seq, reply.seq
            )));
        }
        if let Some(expected) = outgoing.reply_correlation {
            if reply.correlation_id != expected {
                return Err(Error::protocol(format!(
                    "stream item belongs to another call: expected {}, got {}",
                    expected, reply.correlation_id
                )));
            }
        }
        *self.response_annotations.lock() = reply.annotations.clone();

        let payload = match outgoing.payload {
            Some(_) => self.serializers.decode(reply.serializer_id, &reply.body)?,
            None => Payload::Data(Value::Null),
        };
        if reply.flags.exception {
            return match payload {
                Payload::Error(envelope) => Err(Error::from_envelope(envelope)),
                other => Err(Error::protocol(format!(
                    "exception reply carries a {} payload",
                    other.kind()
                ))),
            };
        }
        Ok(Some(Exchange {
            message: reply,
            payload,
        }))
    }

    async fn ensure_connected(&self, state: &mut ProxyState, options: &ProxyOptions) -> Result<()> {
        if state.connection.as_ref().is_some_and(|c| !c.is_closed()) {
            return Ok(());
        }
        state.disconnect();

        let target = if self.uri.is_direct() {
            self.uri.clone()
        } else {
            Resolver::new(self.config.clone()).resolve(&self.uri).await?
        };
        let location = target
            .location()
            .ok_or_else(|| Error::protocol(format!("resolved URI {} has no location", target)))?;

        let codec = MessageCodec::new(self.config.max_message_size, self.config.hmac_key_bytes())?;
        let connection = Connection::connect(location, codec, options.timeout)
            .await?
            .with_wire_logging(self.config.log_wire);
        let metadata = self.handshake(&connection, target.object(), options).await?;

        self.metrics.connects.fetch_add(1, Ordering::Relaxed);
        info!(uri = %self.uri, target = %target, connection_id = connection.id(), "Proxy connected");
        state.connection = Some(connection);
        state.resolved = Some(target);
        state.metadata = metadata;
        Ok(())
    }

    async fn handshake(
        &self,
        connection: &Connection,
        object_id: &str,
        options: &ProxyOptions,
    ) -> Result<Option<ObjectMetadata>> {
        let rejected = |reason: String| {
            Error::communication(format!("connection to {} rejected: {}", connection.peer(), reason))
        };

        let request = Payload::Handshake(HandshakeRequest {
            handshake: options.handshake.clone(),
            object: Some(object_id.to_string()),
        });
        let body = self.serializers.encode(self.serializer_id, &request)?;
        let flags = MessageFlags {
            meta_on_connect: self.config.metadata,
            ..MessageFlags::default()
        };
        let message = Message::new(MessageType::Connect, 0, self.serializer_id, body)
            .with_flags(flags)
            .with_correlation_id(Uuid::new_v4());
        connection
            .send(&message)
            .await
            .map_err(|e| rejected(e.to_string()))?;

        let reply = match connection.recv_timeout(options.timeout).await {
            Ok(reply) => reply,
            Err(e @ TransportError::Timeout { .. }) => return Err(e.into()),
            Err(e) => return Err(rejected(e.to_string())),
        };

        match reply.msg_type {
            MessageType::ConnectOk => {
                let Payload::HandshakeReply(accepted) = self
                    .serializers
                    .decode(reply.serializer_id, &reply.body)
                    .map_err(|e| rejected(e.to_string()))?
                else {
                    return Err(Error::protocol("CONNECT_OK without a handshake reply"));
                };
                if let Some(validator) = &options.validator {
                    validator(&accepted.handshake).map_err(&rejected)?;
                }
                connection.mark_ready()?;
                Ok(accepted.meta)
            }
            MessageType::ConnectFail => {
                let reason = match self.serializers.decode(reply.serializer_id, &reply.body) {
                    Ok(Payload::Error(envelope)) => envelope.message,
                    Ok(other) => format!("unexpected {} payload", other.kind()),
                    Err(e) => e.to_string(),
                };
                connection.close().await;
                Err(rejected(reason))
            }
            other => Err(Error::protocol(format!("unexpected {:?} reply to CONNECT", other))),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("uri", &self.uri)
            .field("serializer_id", &self.serializer_id)
            .field("stats", &self.stats())
            .finish()
    }
}

fn stream_id_of(exchange: &Exchange) -> Option<String> {
    let tagged = exchange.message.annotations.get(&AnnotationTag::STREAM);
    match tagged {
        Some(data) => String::from_utf8(data.to_vec()).ok(),
        None => match &exchange.payload {
            Payload::Data(Value::Str(id)) => Some(id.clone()),
            _ => None,
        },
    }
}

fn data_of(exchange: Exchange) -> Result<Value> {
    match exchange.payload {
        Payload::Data(value) => Ok(value),
        other => Err(Error::protocol(format!("unexpected {} payload in reply", other.kind()))),
    }
}
