//! Framed Connection
//!
//! One socket, split into independently locked read and write halves so a
//! reader task and reply-sending workers never block each other. Tracks the
//! `UNBOUND → HANDSHAKING → READY → CLOSED` lifecycle; the handshake itself
//! is driven by the layer above.

use crate::transports::{self, with_timeout, BoxedStream, Endpoint, PeerAddr};
use crate::{Result, TransportError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tether_codec::{Message, MessageCodec, WireFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique connection id
pub fn generate_connection_id() -> u64 {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket yet
    Unbound,
    /// Socket open, handshake not yet accepted
    Handshaking,
    /// Handshake accepted, calls may flow
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unbound => "unbound",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub id: u64,
    pub peer: PeerAddr,
    pub state: ConnectionState,
    pub connected_duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Framed message connection
pub struct Connection {
    id: u64,
    peer: PeerAddr,
    codec: MessageCodec,
    log_wire: bool,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    state: RwLock<ConnectionState>,
    connected_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Connection {
    /// Wrap a connected stream; the connection starts in `Handshaking`
    pub fn new(stream: BoxedStream, peer: PeerAddr, codec: MessageCodec) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: generate_connection_id(),
            peer,
            codec,
            log_wire: false,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state: RwLock::new(ConnectionState::Handshaking),
            connected_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    /// Open a socket to `endpoint`
    pub async fn connect(endpoint: &Endpoint, codec: MessageCodec, timeout: Option<Duration>) -> Result<Self> {
        let (stream, peer) = transports::connect(endpoint, timeout).await?;
        let connection = Self::new(stream, peer, codec);
        debug!(id = connection.id, endpoint = %endpoint, "Connection opened");
        Ok(connection)
    }

    /// Trace-log every frame in hex
    pub fn with_wire_logging(mut self, enabled: bool) -> Self {
        self.log_wire = enabled;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// `Handshaking → Ready`
    pub fn mark_ready(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Handshaking => {
                *state = ConnectionState::Ready;
                Ok(())
            }
            other => Err(TransportError::state(format!(
                "cannot complete handshake in state {}",
                other
            ))),
        }
    }

    fn mark_closed(&self) -> bool {
        let mut state = self.state.write();
        let was_open = *state != ConnectionState::Closed;
        *state = ConnectionState::Closed;
        was_open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::connection_closed(format!(
                "connection {} to {} is closed",
                self.id, self.peer
            )));
        }
        Ok(())
    }

    /// Encode and write one message
    ///
    /// An oversized body fails before anything is written and leaves the
    /// connection usable.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.ensure_open()?;
        let frame = self.codec.encode(message)?;

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.mark_closed();
            return Err(TransportError::from_stream("Failed to write message", e));
        }
        drop(writer);

        let total = self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed) + frame.len() as u64;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            peer = %self.peer,
            msg_type = ?message.msg_type,
            seq = message.seq,
            bytes = frame.len(),
            total_sent = total,
            "Sent message"
        );
        if self.log_wire {
            trace!(peer = %self.peer, frame = %hex::encode(&frame), "wire out");
        }
        Ok(())
    }

    /// Read and decode one message
    ///
    /// A bad header closes the connection since frame boundaries are lost. A
    /// complete frame that fails decoding (HMAC, annotations) is reported
    /// without closing, so the caller can still answer before closing.
    pub async fn recv(&self) -> Result<Message> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;

        let mut frame = vec![0u8; WireFormat::HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut frame).await {
            self.mark_closed();
            return Err(TransportError::from_stream("Failed to read message header", e));
        }

        let header = match self.codec.decode_header(&frame) {
            Ok(header) => header,
            Err(e) => {
                self.mark_closed();
                return Err(e.into());
            }
        };

        frame.resize(WireFormat::HEADER_SIZE + header.payload_len(), 0);
        if let Err(e) = reader.read_exact(&mut frame[WireFormat::HEADER_SIZE..]).await {
            self.mark_closed();
            return Err(TransportError::from_stream("Failed to read message data", e));
        }
        drop(reader);

        let total = self.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed)
            + frame.len() as u64;
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if self.log_wire {
            trace!(peer = %self.peer, frame = %hex::encode(&frame), "wire in");
        }

        let message = self.codec.decode(&frame)?;
        debug!(
            peer = %self.peer,
            msg_type = ?message.msg_type,
            seq = message.seq,
            bytes = frame.len(),
            total_received = total,
            "Received message"
        );
        Ok(message)
    }

    /// Receive with an optional deadline
    pub async fn recv_timeout(&self, timeout: Option<Duration>) -> Result<Message> {
        with_timeout("receive", timeout, self.recv()).await
    }

    /// Close the connection; returns false when it was already closed
    pub async fn close(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        // Peer may already be gone
        let _ = writer.shutdown().await;
        debug!(id = self.id, peer = %self.peer, "Connection closed");
        true
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            peer: self.peer.clone(),
            state: self.state(),
            connected_duration: self.connected_at.elapsed(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
