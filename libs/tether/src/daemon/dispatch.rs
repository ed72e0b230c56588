//! Call Dispatch
//!
//! Turns an INVOKE message into a method invocation and the invocation's
//! outcome into a RESULT message. Lookup, exposure and authentication
//! checks all happen before the target object sees the call.

use super::server::Flow;
use super::{Daemon, ServerConnection};
use crate::context::CallContext;
use crate::error::{RemoteError, PROTOCOL_ERROR};
use crate::uri::Uri;
use crate::object::{self, Invocation, MethodSpec, RemoteObject, Reply, GET_ATTRIBUTE, SET_ATTRIBUTE};
use std::collections::HashMap;
use std::sync::Arc;
use tether_codec::{
    AnnotationTag, Annotations, CallBody, ErrorEnvelope, JsonSerializer, Message, MessageFlags,
    MessageType, Outcome, Payload, Value,
};
use tether_config::{ServerType, DAEMON_OBJECT_ID};
use tether_network::TransportError;
use tracing::{debug, trace, warn};

/// Daemon object method whose pulls run on the worker pool in multiplexed mode
const STREAM_PULL: &str = "get_next_stream_item";

impl Daemon {
    pub(crate) fn default_serializer_id(&self) -> u16 {
        self.inner
            .serializers
            .by_name(&self.inner.config.serializer)
            .map(|serializer| serializer.id())
            .unwrap_or(JsonSerializer::ID)
    }

    pub(crate) async fn handle_invoke(&self, conn: &Arc<ServerConnection>, message: Message) -> Flow {
        let payload = match self
            .inner
            .serializers
            .decode(message.serializer_id, &message.body)
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection_id = conn.id(), error = %e, "Undecodable call");
                if message.flags.oneway {
                    return Flow::Continue;
                }
                let error = RemoteError::new("SerializeError", e.to_string());
                return self.send_error(conn, &message, error).await;
            }
        };

        match payload {
            Payload::Call(call) => {
                let offload = self.inner.config.server_type == ServerType::Multiplexed
                    && call.object_id == DAEMON_OBJECT_ID
                    && call.method == STREAM_PULL;
                if offload {
                    let daemon = self.clone();
                    let conn = conn.clone();
                    self.inner.workers.spawn(async move {
                        daemon.dispatch_call(&conn, &message, call).await;
                    });
                    return Flow::Continue;
                }
                self.dispatch_call(conn, &message, call).await
            }
            Payload::Batch(calls) if message.flags.batch => self.dispatch_batch(conn, message, calls).await,
            other => {
                let error = RemoteError::new(
                    PROTOCOL_ERROR,
                    format!("INVOKE cannot carry a {} payload", other.kind()),
                );
                self.send_error(conn, &message, error).await
            }
        }
    }

    /// Run the exposure and authentication checks and pick the instance
    fn prepare(
        &self,
        conn: &ServerConnection,
        call: &CallBody,
    ) -> Result<(Arc<dyn RemoteObject>, MethodSpec), RemoteError> {
        let (target, spec) = self.check(conn, call)?;
        let instance = self
            .inner
            .lifecycle
            .instance(&call.object_id, &target, &conn.sessions);
        Ok((instance, spec))
    }

    fn check(
        &self,
        conn: &ServerConnection,
        call: &CallBody,
    ) -> Result<(Arc<crate::object::Target>, MethodSpec), RemoteError> {
        let target = self
            .inner
            .registry
            .get(&call.object_id)
            .ok_or_else(|| RemoteError::daemon(format!("unknown object '{}'", call.object_id)))?;
        let capabilities = target.capabilities();
        let spec = match call.method.as_str() {
            GET_ATTRIBUTE | SET_ATTRIBUTE => {
                let writing = call.method == SET_ATTRIBUTE;
                let name = call.args.first().and_then(Value::as_str).ok_or_else(|| {
                    RemoteError::type_error(format!("{}() needs an attribute name", call.method))
                })?;
                if !capabilities.is_attribute(name) {
                    return Err(RemoteError::attribute(format!(
                        "remote object '{}' has no exposed attribute '{}'",
                        call.object_id, name
                    )));
                }
                if writing && !capabilities.is_writable(name) {
                    return Err(RemoteError::attribute(format!(
                        "attribute '{}' of remote object '{}' is read-only",
                        name, call.object_id
                    )));
                }
                MethodSpec::default()
            }
            method => capabilities.lookup(method).ok_or_else(|| {
                RemoteError::attribute(format!(
                    "remote object '{}' has no exposed method '{}'",
                    call.object_id, call.method
                ))
            })?,
        };
        if spec.requires_auth && !conn.is_authenticated() {
            return Err(RemoteError::daemon(format!(
                "method '{}' requires an authenticated connection",
                call.method
            )));
        }
        Ok((target, spec))
    }

    pub(crate) async fn dispatch_call(&self, conn: &Arc<ServerConnection>, message: &Message, call: CallBody) -> Flow {
        trace!(connection_id = conn.id(), object_id = %call.object_id, method = %call.method, "Dispatching call");
        let (instance, spec) = match self.prepare(conn, &call) {
            Ok(prepared) => prepared,
            Err(error) if message.flags.oneway => {
                warn!(object_id = %call.object_id, method = %call.method, %error, "Rejected oneway call");
                return Flow::Continue;
            }
            Err(error) => return self.send_error(conn, message, error).await,
        };

        let ctx = conn.context(message);
        let frame = self.frame(&call);
        let invocation = Invocation {
            method: call.method,
            args: call.args,
            kwargs: call.kwargs,
        };

        if message.flags.oneway || spec.oneway {
            self.run_oneway(instance, ctx, invocation, frame).await;
            if message.flags.oneway {
                return Flow::Continue;
            }
            // Declared oneway but the client is waiting
            return self
                .reply(conn, message, MessageType::Result, MessageFlags::default(), &Payload::Data(Value::Null), Annotations::new())
                .await;
        }

        let outcome = object::invoke(instance.as_ref(), &ctx, invocation).await;
        self.finish_call(conn, message, &ctx, outcome, frame).await
    }

    async fn finish_call(
        &self,
        conn: &Arc<ServerConnection>,
        message: &Message,
        ctx: &CallContext,
        outcome: Result<Reply, RemoteError>,
        frame: String,
    ) -> Flow {
        let overrides = ctx.take_reply_overrides();
        let mut annotations = self.inner.hooks.response_annotations(ctx);
        annotations.extend(&overrides.annotations);
        let mut flags = MessageFlags {
            stream_end: overrides.stream_end,
            ..MessageFlags::default()
        };

        let reply = match outcome {
            Ok(Reply::Value(mut value)) => {
                self.autoproxy(&mut value);
                let mut reply = self.reply_message(message, MessageType::Result, flags, &Payload::Data(value), annotations);
                if let Some(correlation_id) = overrides.correlation_id {
                    reply.correlation_id = correlation_id;
                }
                reply
            }
            Ok(Reply::Stream(stream)) => {
                if !self.inner.config.iter_streaming {
                    let error = RemoteError::new(PROTOCOL_ERROR, "item streaming is disabled");
                    return self.send_error(conn, message, error.with_frame(frame)).await;
                }
                let stream_id = self.inner.streams.open(conn.id(), message.correlation_id, stream);
                annotations.insert(AnnotationTag::STREAM, stream_id.clone().into_bytes());
                flags.item_stream = true;
                self.reply_message(message, MessageType::Result, flags, &Payload::Data(Value::Str(stream_id)), annotations)
            }
            Err(error) => {
                let error = error.with_frame_first(frame);
                debug!(connection_id = conn.id(), kind = %error.kind, message = %error.message, "Replying with error");
                let flags = MessageFlags {
                    exception: true,
                    ..MessageFlags::default()
                };
                let payload = Payload::Error(ErrorEnvelope::from(error));
                let mut reply = self.reply_message(message, MessageType::Result, flags, &payload, Annotations::new());
                if let Some(correlation_id) = overrides.correlation_id {
                    reply.correlation_id = correlation_id;
                }
                reply
            }
        };
        self.send(conn, &reply).await
    }

    async fn run_oneway(
        &self,
        instance: Arc<dyn RemoteObject>,
        ctx: CallContext,
        invocation: Invocation,
        frame: String,
    ) {
        let task = async move {
            match object::invoke(instance.as_ref(), &ctx, invocation).await {
                Ok(Reply::Value(_)) => {}
                Ok(Reply::Stream(_)) => warn!(call = %frame, "Oneway call returned a stream; dropped"),
                Err(error) => warn!(call = %frame, %error, "Oneway call failed"),
            }
        };
        if self.inner.config.oneway_threaded {
            self.inner.workers.spawn(task);
        } else {
            task.await;
        }
    }

    async fn dispatch_batch(&self, conn: &Arc<ServerConnection>, message: Message, calls: Vec<CallBody>) -> Flow {
        if calls.is_empty() {
            let error = RemoteError::new(PROTOCOL_ERROR, "empty batch");
            return self.send_error(conn, &message, error).await;
        }
        debug!(connection_id = conn.id(), calls = calls.len(), oneway = message.flags.oneway, "Dispatching batch");

        if message.flags.oneway {
            let daemon = self.clone();
            let conn = conn.clone();
            let task = async move {
                let (outcomes, _) = daemon.execute_batch(&conn, &message, calls).await;
                if let Some(Outcome::Err(error)) = outcomes.last() {
                    warn!(%error, "Oneway batch stopped early");
                }
            };
            if self.inner.config.oneway_threaded {
                self.inner.workers.spawn(task);
            } else {
                task.await;
            }
            return Flow::Continue;
        }

        let (outcomes, annotations) = self.execute_batch(conn, &message, calls).await;
        let flags = MessageFlags {
            batch: true,
            ..MessageFlags::default()
        };
        self.reply(conn, &message, MessageType::Result, flags, &Payload::Outcomes(outcomes), annotations)
            .await
    }

    /// Run calls in order, stopping after the first failure. Calls to the
    /// same object share one instance for the whole batch.
    async fn execute_batch(
        &self,
        conn: &Arc<ServerConnection>,
        message: &Message,
        calls: Vec<CallBody>,
    ) -> (Vec<Outcome>, Annotations) {
        let mut instances: HashMap<String, Arc<dyn RemoteObject>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut annotations = Annotations::new();

        for call in calls {
            let frame = self.frame(&call);
            let instance = match self.check(conn, &call) {
                Ok((target, _)) => instances
                    .entry(call.object_id.clone())
                    .or_insert_with(|| {
                        self.inner
                            .lifecycle
                            .instance(&call.object_id, &target, &conn.sessions)
                    })
                    .clone(),
                Err(error) => {
                    outcomes.push(Outcome::Err(error.into()));
                    break;
                }
            };

            let ctx = conn.context(message);
            let invocation = Invocation {
                method: call.method,
                args: call.args,
                kwargs: call.kwargs,
            };
            let outcome = object::invoke(instance.as_ref(), &ctx, invocation).await;
            annotations.extend(&ctx.take_reply_overrides().annotations);
            match outcome {
                Ok(Reply::Value(mut value)) => {
                    self.autoproxy(&mut value);
                    outcomes.push(Outcome::Ok(value));
                }
                Ok(Reply::Stream(_)) => {
                    let error = RemoteError::new(PROTOCOL_ERROR, "item streams cannot be returned inside a batch");
                    outcomes.push(Outcome::Err(error.with_frame(frame).into()));
                    break;
                }
                Err(error) => {
                    outcomes.push(Outcome::Err(error.with_frame_first(frame).into()));
                    break;
                }
            }
        }
        (outcomes, annotations)
    }

    /// Turn bare references to this daemon's objects into their URIs
    fn autoproxy(&self, value: &mut Value) {
        if !self.inner.config.autoproxy {
            return;
        }
        value.for_each_proxy_mut(&mut |reference| {
            if Uri::parse(reference.as_str()).is_ok() {
                return;
            }
            if let Ok(uri) = self.inner.uri_for(reference.as_str()) {
                trace!(object_id = %reference, uri = %uri, "Autoproxied reply value");
                *reference = uri.to_string();
            }
        });
    }

    /// Traceback frame describing the dispatched call
    fn frame(&self, call: &CallBody) -> String {
        if !self.inner.config.detailed_traceback {
            return format!("dispatch {}.{}", call.object_id, call.method);
        }
        let args: Vec<String> = call
            .args
            .iter()
            .map(|arg| format!("{:?}", arg))
            .chain(call.kwargs.iter().map(|(name, arg)| format!("{}={:?}", name, arg)))
            .collect();
        format!("dispatch {}.{}({})", call.object_id, call.method, args.join(", "))
    }

    pub(crate) async fn send_error(&self, conn: &Arc<ServerConnection>, request: &Message, error: RemoteError) -> Flow {
        debug!(connection_id = conn.id(), kind = %error.kind, message = %error.message, "Replying with error");
        let flags = MessageFlags {
            exception: true,
            ..MessageFlags::default()
        };
        let payload = Payload::Error(ErrorEnvelope::from(error));
        self.reply(conn, request, MessageType::Result, flags, &payload, Annotations::new())
            .await
    }

    pub(crate) async fn reply(
        &self,
        conn: &Arc<ServerConnection>,
        request: &Message,
        msg_type: MessageType,
        flags: MessageFlags,
        payload: &Payload,
        annotations: Annotations,
    ) -> Flow {
        let reply = self.reply_message(request, msg_type, flags, payload, annotations);
        self.send(conn, &reply).await
    }

    /// Encode with the request's serializer; values that cannot be encoded
    /// turn the reply into a SerializeError
    fn reply_message(
        &self,
        request: &Message,
        msg_type: MessageType,
        mut flags: MessageFlags,
        payload: &Payload,
        annotations: Annotations,
    ) -> Message {
        let (serializer_id, body) = match self.encode(request.serializer_id, payload) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(%error, "Failed to serialize reply");
                flags = MessageFlags {
                    exception: true,
                    ..MessageFlags::default()
                };
                let envelope = Payload::Error(ErrorEnvelope {
                    kind: "SerializeError".to_string(),
                    message: error.to_string(),
                    traceback: Vec::new(),
                });
                // Envelopes carry no custom values
                self.encode(request.serializer_id, &envelope)
                    .unwrap_or_else(|_| (request.serializer_id, Vec::new()))
            }
        };
        let mut reply = Message::reply_to(request, msg_type, body)
            .with_flags(flags)
            .with_annotations(annotations);
        reply.serializer_id = serializer_id;
        reply
    }

    fn encode(&self, preferred: u16, payload: &Payload) -> tether_codec::Result<(u16, Vec<u8>)> {
        match self.inner.serializers.encode(preferred, payload) {
            Ok(body) => Ok((preferred, body)),
            Err(e) if e.is_serialization() && preferred != JsonSerializer::ID => {
                let fallback = self.inner.serializers.encode(JsonSerializer::ID, payload);
                fallback.map(|body| (JsonSerializer::ID, body)).map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a reply; oversized replies are answered with an error instead
    pub(crate) async fn send(&self, conn: &Arc<ServerConnection>, reply: &Message) -> Flow {
        match conn.conn.send(reply).await {
            Ok(()) => Flow::Continue,
            Err(TransportError::Codec(e)) if !reply.flags.exception => {
                warn!(connection_id = conn.id(), error = %e, "Reply could not be framed");
                let error = RemoteError::new(PROTOCOL_ERROR, e.to_string());
                let payload = Payload::Error(ErrorEnvelope::from(error));
                let flags = MessageFlags {
                    exception: true,
                    ..MessageFlags::default()
                };
                let fallback = self.reply_message(reply, reply.msg_type, flags, &payload, Annotations::new());
                match conn.conn.send(&fallback).await {
                    Ok(()) => Flow::Continue,
                    Err(_) => Flow::Close,
                }
            }
            Err(e) => {
                debug!(connection_id = conn.id(), error = %e, "Failed to send reply");
                Flow::Close
            }
        }
    }
}
