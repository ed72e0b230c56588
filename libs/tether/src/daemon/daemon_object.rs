//! Daemon Object
//!
//! Built-in object registered under `Tether.Daemon` on every daemon. It
//! answers introspection requests, resolves LOCATION names and serves item
//! stream pulls.

use super::DaemonInner;
use crate::context::CallContext;
use crate::error::RemoteError;
use crate::object::{Capabilities, Expose, Invocation, RemoteObject, Reply};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Weak;
use tether_codec::{AnnotationTag, Value};
use tracing::debug;

pub(crate) struct DaemonObject {
    daemon: Weak<DaemonInner>,
}

impl DaemonObject {
    pub(crate) fn new(daemon: Weak<DaemonInner>) -> Self {
        Self { daemon }
    }

    async fn next_stream_item(
        &self,
        daemon: &DaemonInner,
        ctx: &CallContext,
        stream_id: &str,
    ) -> Result<Reply, RemoteError> {
        let entry = daemon.streams.claim(stream_id, ctx.connection_id())?;
        ctx.set_reply_correlation(entry.correlation_id);

        let item = entry.stream.lock().await.next().await;
        match item {
            Some(Ok(value)) => {
                let subseq = entry.next_subseq();
                ctx.set_response_annotation(AnnotationTag::SUBSEQ, subseq.to_be_bytes().to_vec());
                Ok(Reply::Value(value))
            }
            Some(Err(error)) => {
                daemon.streams.remove(stream_id);
                Err(error)
            }
            None => {
                daemon.streams.remove(stream_id);
                debug!(stream_id, "Item stream exhausted");
                ctx.mark_stream_end();
                Ok(Reply::none())
            }
        }
    }
}

impl Expose for DaemonObject {
    fn capabilities() -> Capabilities {
        Capabilities::new()
            .method("ping")
            .method("registered")
            .method("info")
            .method("get_metadata")
            .method("resolve")
            .method("get_next_stream_item")
            .oneway("close_stream")
    }
}

#[async_trait]
impl RemoteObject for DaemonObject {
    async fn invoke(&self, ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
        let daemon = self
            .daemon
            .upgrade()
            .ok_or_else(|| RemoteError::daemon("daemon is shutting down"))?;

        match call.method.as_str() {
            "ping" => Ok(Reply::none()),
            "registered" => {
                let ids = daemon.registry.ids().into_iter().map(Value::Str).collect::<Vec<_>>();
                Ok(Reply::value(ids))
            }
            "info" => Ok(Reply::Value(daemon.info())),
            "get_metadata" => {
                let object_id = call.str_arg(0, "object_id")?;
                let target = daemon
                    .registry
                    .get(object_id)
                    .ok_or_else(|| RemoteError::daemon(format!("unknown object '{}'", object_id)))?;
                Ok(Reply::Value(target.capabilities().metadata().to_value()))
            }
            "resolve" => {
                let local_name = call.str_arg(0, "local_name")?;
                let object_id = daemon.registry.resolve(local_name).ok_or_else(|| {
                    RemoteError::daemon(format!("unknown local name '{}'", local_name))
                })?;
                Ok(Reply::value(object_id))
            }
            "get_next_stream_item" => {
                let stream_id = call.str_arg(0, "stream_id")?;
                self.next_stream_item(&daemon, ctx, stream_id).await
            }
            "close_stream" => {
                let stream_id = call.str_arg(0, "stream_id")?;
                if daemon.streams.remove(stream_id) {
                    debug!(stream_id, "Item stream closed by client");
                }
                Ok(Reply::none())
            }
            other => Err(RemoteError::attribute(format!("no such daemon method '{}'", other))),
        }
    }
}
