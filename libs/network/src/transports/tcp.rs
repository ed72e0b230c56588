//! TCP Transport
//!
//! Listener setup, accept and connect for TCP streams. Every stream gets
//! `TCP_NODELAY` since messages are small request/response frames.

use super::with_timeout;
use crate::{Result, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bind a TCP listener
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await.map_err(|e| {
        TransportError::communication_with_source(
            format!("Failed to bind TCP listener on {}:{}", host, port),
            e,
        )
    })?;
    if let Ok(local) = listener.local_addr() {
        info!("TCP server listening on {}", local);
    }
    Ok(listener)
}

/// Accept one connection and configure the socket
pub async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, peer_addr) = listener.accept().await.map_err(|e| {
        TransportError::communication_with_source("Failed to accept TCP connection", e)
    })?;
    configure(&stream);
    debug!(peer = %peer_addr, "Accepted TCP connection");
    Ok((stream, peer_addr))
}

/// Connect with an optional timeout
pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<(TcpStream, SocketAddr)> {
    debug!("Connecting to TCP peer at {}:{}", host, port);

    let stream = with_timeout("TCP connect", timeout, async {
        TcpStream::connect((host, port)).await.map_err(|e| {
            TransportError::communication_with_source(
                format!("Failed to connect to TCP peer {}:{}", host, port),
                e,
            )
        })
    })
    .await?;

    configure(&stream);
    let peer_addr = stream
        .peer_addr()
        .map_err(|e| TransportError::communication_with_source("Failed to get peer address", e))?;

    debug!(peer = %peer_addr, "Connected to TCP peer");
    Ok((stream, peer_addr))
}

fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}
