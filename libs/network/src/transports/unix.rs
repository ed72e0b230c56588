//! Unix Domain Socket Transport
//!
//! Local IPC listener and connector. A stale socket file left by a crashed
//! process is removed before binding; the file is removed again on drop.

use super::with_timeout;
use crate::{Result, TransportError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Bound Unix socket that cleans up its file
#[derive(Debug)]
pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl UnixSocketListener {
    /// Bind to a Unix socket path
    pub fn bind(path: &Path) -> Result<Self> {
        // Remove existing socket file if it exists
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                TransportError::communication_with_source("Failed to remove existing socket", e)
            })?;
        }

        // Create parent directory if needed
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::communication_with_source("Failed to create socket directory", e)
            })?;
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            TransportError::communication_with_source("Failed to bind Unix socket", e)
        })?;

        info!("Unix socket listening on: {:?}", path);
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await.map_err(|e| {
            TransportError::communication_with_source("Failed to accept connection", e)
        })?;

        debug!("Accepted Unix socket connection");
        Ok(stream)
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove socket file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Connect to a Unix socket server
pub async fn connect(path: &Path, timeout: Option<Duration>) -> Result<UnixStream> {
    let stream = with_timeout("Unix connect", timeout, async {
        UnixStream::connect(path).await.map_err(|e| {
            TransportError::communication_with_source(
                format!("Failed to connect to Unix socket: {:?}", path),
                e,
            )
        })
    })
    .await?;

    debug!("Connected to Unix socket: {:?}", path);
    Ok(stream)
}
