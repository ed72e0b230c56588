//! Request Loops
//!
//! Threaded mode spawns one task per client connection; each task reads,
//! dispatches and replies in order. Multiplexed mode polls every
//! connection of one or more combined daemons from a single task and hands
//! only oneway calls and stream pulls to the bounded worker pool.

use super::{Daemon, ServerConnection};
use crate::error::{Error, Result};
use futures::future::{select_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tether_codec::{
    Annotations, ErrorEnvelope, HandshakeReply, Message, MessageFlags, MessageType, Payload,
};
use tether_config::ServerType;
use tether_network::{BoxedStream, ConnectionState, Listener, PeerAddr, TransportError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error kind sent in CONNECT_FAIL replies
const HANDSHAKE_ERROR: &str = "HandshakeError";

/// What the loop does with a connection after one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

type PendingRead = BoxFuture<'static, (usize, Arc<ServerConnection>, tether_network::Result<Message>)>;

fn next_read(daemon: usize, conn: Arc<ServerConnection>) -> PendingRead {
    Box::pin(async move {
        let received = conn.conn.recv().await;
        (daemon, conn, received)
    })
}

impl Daemon {
    /// Serve clients until shutdown. Only one loop may run per daemon.
    pub async fn request_loop(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::usage("daemon was shut down"));
        }
        let listener = self.take_listener()?;
        match self.inner.config.server_type {
            ServerType::Threaded => self.threaded_loop(listener).await,
            ServerType::Multiplexed => {
                let others: Vec<Daemon> = self.inner.combined.lock().clone();
                let mut daemons = vec![self.clone()];
                let mut listeners = vec![listener];
                for other in others {
                    listeners.push(other.take_listener()?);
                    daemons.push(other);
                }
                multiplexed_loop(daemons, listeners).await
            }
        }
    }

    async fn threaded_loop(&self, listener: Listener) -> Result<()> {
        let shutdown = self.inner.shutdown_signal();
        tokio::pin!(shutdown);
        let mut housekeeping = interval(self.inner.config.poll_interval());
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(location = %self.inner.location, "Threaded request loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = housekeeping.tick() => self.inner.housekeeping(),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = self.adopt(stream, peer);
                        let daemon = self.clone();
                        tokio::spawn(async move { daemon.serve_connection(conn).await });
                    }
                    Err(e) => warn!(error = %e, location = %self.inner.location, "Failed to accept connection"),
                },
            }
        }
        info!(location = %self.inner.location, "Threaded request loop stopped");
        Ok(())
    }

    /// Track a freshly accepted socket
    fn adopt(&self, stream: BoxedStream, peer: PeerAddr) -> Arc<ServerConnection> {
        let conn = tether_network::Connection::new(stream, peer, self.inner.codec.clone())
            .with_wire_logging(self.inner.config.log_wire);
        let conn = Arc::new(ServerConnection::new(conn));
        self.inner.connections.insert(conn.id(), conn.clone());
        debug!(connection_id = conn.id(), peer = %conn.conn.peer(), "Client connected");
        conn
    }

    async fn serve_connection(&self, conn: Arc<ServerConnection>) {
        let shutdown = self.inner.shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            let received = tokio::select! {
                received = conn.conn.recv() => received,
                _ = &mut shutdown => break,
            };
            if self.process(&conn, received).await == Flow::Close {
                break;
            }
        }
        self.teardown(&conn).await;
    }

    /// Handle one received frame (or receive failure)
    pub(crate) async fn process(
        &self,
        conn: &Arc<ServerConnection>,
        received: tether_network::Result<Message>,
    ) -> Flow {
        let message = match received {
            Ok(message) => message,
            Err(TransportError::ConnectionClosed { .. }) => return Flow::Close,
            Err(e) => {
                warn!(connection_id = conn.id(), peer = %conn.conn.peer(), error = %e, "Dropping client after receive failure");
                if conn.conn.state() == ConnectionState::Handshaking {
                    self.reject_handshake(conn, None, &e.to_string()).await;
                }
                return Flow::Close;
            }
        };

        match conn.conn.state() {
            ConnectionState::Handshaking => self.handshake(conn, message).await,
            ConnectionState::Ready => match message.msg_type {
                MessageType::Invoke => self.handle_invoke(conn, message).await,
                MessageType::Ping => {
                    let reply = Message::reply_to(&message, MessageType::Result, bytes::Bytes::new());
                    self.send(conn, &reply).await
                }
                other => {
                    warn!(connection_id = conn.id(), msg_type = ?other, "Unexpected message type");
                    Flow::Close
                }
            },
            ConnectionState::Unbound | ConnectionState::Closed => Flow::Close,
        }
    }

    async fn handshake(&self, conn: &Arc<ServerConnection>, message: Message) -> Flow {
        if message.msg_type != MessageType::Connect {
            let reason = format!("expected CONNECT, got {:?}", message.msg_type);
            self.reject_handshake(conn, Some(&message), &reason).await;
            return Flow::Close;
        }

        let request = match self
            .inner
            .serializers
            .decode(message.serializer_id, &message.body)
        {
            Ok(Payload::Handshake(request)) => request,
            Ok(other) => {
                let reason = format!("unexpected {} payload in CONNECT", other.kind());
                self.reject_handshake(conn, Some(&message), &reason).await;
                return Flow::Close;
            }
            Err(e) => {
                self.reject_handshake(conn, Some(&message), &e.to_string()).await;
                return Flow::Close;
            }
        };

        let info = conn.info();
        let accept = match self.inner.hooks.validate_handshake(&info, &request.handshake) {
            Ok(accept) => accept,
            Err(reason) => {
                warn!(connection_id = info.id, peer = %info.peer, %reason, "Handshake rejected");
                self.reject_handshake(conn, Some(&message), &reason).await;
                return Flow::Close;
            }
        };

        let meta = match (&request.object, message.flags.meta_on_connect && self.inner.config.metadata) {
            (Some(object_id), true) => match self.inner.registry.get(object_id) {
                Some(target) => Some(target.capabilities().metadata()),
                None => {
                    let reason = format!("unknown object '{}'", object_id);
                    self.reject_handshake(conn, Some(&message), &reason).await;
                    return Flow::Close;
                }
            },
            _ => None,
        };

        conn.set_authenticated(accept.authenticated || self.inner.codec.has_hmac());
        if let Err(e) = conn.conn.mark_ready() {
            warn!(connection_id = info.id, error = %e, "Handshake on a connection that is not handshaking");
            return Flow::Close;
        }

        let flags = MessageFlags {
            meta_on_connect: meta.is_some(),
            ..MessageFlags::default()
        };
        let payload = Payload::HandshakeReply(HandshakeReply {
            handshake: accept.response,
            meta,
        });
        debug!(
            connection_id = info.id,
            peer = %info.peer,
            authenticated = conn.is_authenticated(),
            "Handshake accepted"
        );
        self.reply(conn, &message, MessageType::ConnectOk, flags, &payload, Annotations::new())
            .await
    }

    /// Send CONNECT_FAIL and close the connection
    async fn reject_handshake(&self, conn: &Arc<ServerConnection>, request: Option<&Message>, reason: &str) {
        let payload = Payload::Error(ErrorEnvelope {
            kind: HANDSHAKE_ERROR.to_string(),
            message: reason.to_string(),
            traceback: Vec::new(),
        });
        let fallback;
        let request = match request {
            Some(request) => request,
            None => {
                fallback = Message::new(MessageType::Connect, 0, self.default_serializer_id(), bytes::Bytes::new())
                    .with_correlation_id(Uuid::nil());
                &fallback
            }
        };
        let flags = MessageFlags {
            exception: true,
            ..MessageFlags::default()
        };
        self.reply(conn, request, MessageType::ConnectFail, flags, &payload, Annotations::new())
            .await;
        conn.conn.close().await;
    }

    /// Close a client connection and release everything tied to it, once
    pub(crate) async fn teardown(&self, conn: &Arc<ServerConnection>) {
        conn.conn.close().await;
        if !conn.begin_teardown() {
            return;
        }
        self.inner.connections.remove(&conn.id());
        let resources = conn.resources.release_all();
        let sessions = conn.sessions.clear();
        let streams = self.inner.streams.connection_closed(conn.id());
        let info = conn.info();
        self.inner.hooks.client_disconnect(&info);
        debug!(
            connection_id = info.id,
            peer = %info.peer,
            resources,
            sessions,
            streams,
            "Client disconnected"
        );
    }
}

async fn multiplexed_loop(daemons: Vec<Daemon>, listeners: Vec<Listener>) -> Result<()> {
    let Some(primary) = daemons.first() else {
        return Ok(());
    };
    let mut housekeeping = interval(primary.inner.config.poll_interval());
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = select_all(
        daemons
            .iter()
            .map(|daemon| Box::pin(daemon.inner.shutdown_signal())),
    );
    let mut reads: FuturesUnordered<PendingRead> = FuturesUnordered::new();

    info!(
        location = %primary.inner.location,
        daemons = daemons.len(),
        "Multiplexed request loop started"
    );
    loop {
        let accepts = select_all(
            listeners
                .iter()
                .enumerate()
                .map(|(index, listener)| Box::pin(async move { (index, listener.accept().await) })),
        );
        tokio::select! {
            _ = &mut shutdown => break,
            _ = housekeeping.tick() => {
                for daemon in &daemons {
                    daemon.inner.housekeeping();
                }
            }
            ((index, accepted), _, _) = accepts => match accepted {
                Ok((stream, peer)) => {
                    let conn = daemons[index].adopt(stream, peer);
                    reads.push(next_read(index, conn));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            Some((index, conn, received)) = reads.next(), if !reads.is_empty() => {
                let daemon = &daemons[index];
                match daemon.process(&conn, received).await {
                    Flow::Continue => reads.push(next_read(index, conn)),
                    Flow::Close => daemon.teardown(&conn).await,
                }
            }
        }
    }

    drop(reads);
    for daemon in &daemons {
        daemon.close_connections().await;
    }
    info!(location = %primary.inner.location, "Multiplexed request loop stopped");
    Ok(())
}
