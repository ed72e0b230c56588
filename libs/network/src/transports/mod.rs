//! Socket Transports
//!
//! Endpoints, listeners and raw stream setup for TCP and Unix-domain
//! sockets. Framing lives in [`crate::connection`]; this module only hands
//! out connected byte streams.

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

pub mod tcp;
pub mod unix;


pub use unix::UnixSocketListener;

/// Prefix marking a Unix socket path in location strings
pub const UNIX_LOCATION_PREFIX: &str = "./u:";

/// Byte stream usable by a connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Where a daemon listens or a client connects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }

    /// Parse `host:port`, `[ipv6]:port` or `./u:<path>`; a missing port falls back to `default_port`
    pub fn parse_with_default(text: &str, default_port: Option<u16>) -> Result<Self> {
        let invalid = |reason: &str| {
            TransportError::configuration(
                format!("invalid location '{}': {}", text, reason),
                Some("location"),
            )
        };

        if let Some(path) = text.strip_prefix(UNIX_LOCATION_PREFIX) {
            if path.is_empty() {
                return Err(invalid("empty socket path"));
            }
            return Ok(Endpoint::unix(path));
        }

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            match tail {
                "" => (host, None),
                _ => (
                    host,
                    Some(tail.strip_prefix(':').ok_or_else(|| invalid("expected ':' after ']'"))?),
                ),
            }
        } else {
            match text.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(invalid("IPv6 hosts must be written in brackets"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("port is not a number"))?,
            None => default_port.ok_or_else(|| invalid("missing port"))?,
        };
        Ok(Endpoint::tcp(host, port))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix { .. })
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse_with_default(s, None)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "{}{}", UNIX_LOCATION_PREFIX, path.display()),
        }
    }
}

/// Identity of the remote side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl PeerAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Tcp(addr) => Some(*addr),
            PeerAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(path) => write!(f, "{}{}", UNIX_LOCATION_PREFIX, path.display()),
        }
    }
}

enum ListenerKind {
    Tcp(tokio::net::TcpListener),
    Unix(UnixSocketListener),
}

/// Bound server socket
pub struct Listener {
    kind: ListenerKind,
    endpoint: Endpoint,
}

impl Listener {
    /// Bind the endpoint; TCP port 0 picks a free port
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let (kind, endpoint) = match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = tcp::bind(host, *port).await?;
                let local = listener
                    .local_addr()
                    .map_err(|e| TransportError::io("Failed to read local address", e))?;
                // Keep the configured host name, report the real port
                (ListenerKind::Tcp(listener), Endpoint::tcp(host.clone(), local.port()))
            }
            Endpoint::Unix { path } => {
                let listener = UnixSocketListener::bind(path)?;
                (ListenerKind::Unix(listener), endpoint.clone())
            }
        };

        info!(endpoint = %endpoint, "Listener bound");
        Ok(Self { kind, endpoint })
    }

    /// Endpoint clients should connect to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept the next incoming stream
    pub async fn accept(&self) -> Result<(BoxedStream, PeerAddr)> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = tcp::accept(listener).await?;
                Ok((Box::new(stream), PeerAddr::Tcp(peer)))
            }
            ListenerKind::Unix(listener) => {
                let stream = listener.accept().await?;
                Ok((Box::new(stream), PeerAddr::Unix(listener.path().to_path_buf())))
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("endpoint", &self.endpoint).finish()
    }
}

/// Open a raw stream to `endpoint`
pub async fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<(BoxedStream, PeerAddr)> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let (stream, peer) = tcp::connect(host, *port, timeout).await?;
            Ok((Box::new(stream), PeerAddr::Tcp(peer)))
        }
        Endpoint::Unix { path } => {
            let stream = unix::connect(path, timeout).await?;
            Ok((Box::new(stream), PeerAddr::Unix(path.clone())))
        }
    }
}

/// Apply an optional timeout to a transport future
pub(crate) async fn with_timeout<T>(
    operation: &str,
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::timeout(operation, limit.as_millis() as u64))?,
        None => fut.await,
    }
}
