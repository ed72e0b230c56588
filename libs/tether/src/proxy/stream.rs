//! Client side of an item stream. Items are pulled one round trip at a
//! time over the proxy's connection and checked for order.

use super::{Bound, Outgoing, Proxy};
use crate::error::{Error, Result};
use tether_codec::{AnnotationTag, CallBody, Payload, Value};
use tether_config::DAEMON_OBJECT_ID;
use uuid::Uuid;

pub struct RemoteStream<'a> {
    proxy: &'a Proxy,
    id: String,
    correlation_id: Uuid,
    last_subseq: u32,
    finished: bool,
}

impl<'a> RemoteStream<'a> {
    pub(crate) fn new(proxy: &'a Proxy, id: String, correlation_id: Uuid) -> Self {
        Self {
            proxy,
            id,
            correlation_id,
            last_subseq: 0,
            finished: false,
        }
    }

    /// Daemon-side stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next item; `None` once the stream is exhausted. Any error ends the stream.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if self.finished {
            return None;
        }
        let item = self.pull().await;
        match item {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Value>> {
        let stream_id = Value::from(self.id.as_str());
        let correlation_id = self.correlation_id;
        let reply = self
            .proxy
            .exchange(|_: &Bound<'_>| {
                let call = CallBody::new(DAEMON_OBJECT_ID, "get_next_stream_item", vec![stream_id.clone()]);
                Ok(Outgoing::stream_pull(call, correlation_id))
            })
            .await?
            .ok_or_else(|| Error::protocol("no reply to a stream pull"))?;

        if reply.message.flags.stream_end {
            return Ok(None);
        }
        let subseq = reply
            .message
            .annotations
            .get_u32(&AnnotationTag::SUBSEQ)
            .ok_or_else(|| Error::protocol("stream item without a sub-sequence number"))?;
        if subseq <= self.last_subseq {
            return Err(Error::protocol(format!(
                "stream item out of order: {} after {}",
                subseq, self.last_subseq
            )));
        }
        self.last_subseq = subseq;

        match reply.payload {
            Payload::Data(value) => Ok(Some(value)),
            other => Err(Error::protocol(format!(
                "unexpected {} payload in stream item",
                other.kind()
            ))),
        }
    }

    /// Drain the remaining items
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Stop early and free the daemon-side stream
    pub async fn close(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.proxy.close_stream(&self.id).await
    }
}

impl std::fmt::Debug for RemoteStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("received", &self.last_subseq)
            .field("finished", &self.finished)
            .finish()
    }
}
