//! Item Stream Table
//!
//! Streams returned by remote methods live here between client pulls.
//! Each stream belongs to the connection that opened it. When that
//! connection closes the stream is either dropped at once or kept for the
//! configured linger time, during which another connection may adopt it.

use crate::error::{RemoteError, STREAM_ERROR};
use crate::object::ItemStream;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

pub(crate) struct StreamEntry {
    pub(crate) stream: tokio::sync::Mutex<ItemStream>,
    /// Correlation id of the call that opened the stream
    pub(crate) correlation_id: Uuid,
    owner: AtomicU64,
    created: Instant,
    orphaned_at: Mutex<Option<Instant>>,
    subseq: AtomicU32,
}

impl StreamEntry {
    /// Sub-sequence number for the next item, starting at 1
    pub(crate) fn next_subseq(&self) -> u32 {
        self.subseq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

pub(crate) struct StreamTable {
    streams: DashMap<String, Arc<StreamEntry>>,
    lifetime: Option<Duration>,
    linger: Option<Duration>,
}

impl StreamTable {
    pub(crate) fn new(lifetime: Option<Duration>, linger: Option<Duration>) -> Self {
        Self {
            streams: DashMap::new(),
            lifetime,
            linger,
        }
    }

    /// Park a stream for `owner`; returns the stream id
    pub(crate) fn open(&self, owner: u64, correlation_id: Uuid, stream: ItemStream) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let entry = StreamEntry {
            stream: tokio::sync::Mutex::new(stream),
            correlation_id,
            owner: AtomicU64::new(owner),
            created: Instant::now(),
            orphaned_at: Mutex::new(None),
            subseq: AtomicU32::new(0),
        };
        self.streams.insert(id.clone(), Arc::new(entry));
        debug!(stream_id = %id, connection_id = owner, "Opened item stream");
        id
    }

    /// Entry for a pull from `connection_id`, adopting orphaned streams
    pub(crate) fn claim(&self, id: &str, connection_id: u64) -> Result<Arc<StreamEntry>, RemoteError> {
        let entry = self
            .streams
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RemoteError::new(STREAM_ERROR, format!("unknown item stream '{}'", id)))?;

        if self.is_expired(&entry, Instant::now()) {
            self.streams.remove(id);
            return Err(RemoteError::new(
                STREAM_ERROR,
                format!("item stream '{}' expired", id),
            ));
        }

        if entry.owner.load(Ordering::Acquire) != connection_id {
            let mut orphaned_at = entry.orphaned_at.lock();
            if orphaned_at.is_none() {
                return Err(RemoteError::new(
                    STREAM_ERROR,
                    format!("item stream '{}' belongs to another connection", id),
                ));
            }
            *orphaned_at = None;
            entry.owner.store(connection_id, Ordering::Release);
            debug!(stream_id = id, connection_id, "Adopted lingering item stream");
        }
        Ok(entry)
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.streams.remove(id).is_some()
    }

    /// The owning connection went away; returns how many streams it left
    pub(crate) fn connection_closed(&self, connection_id: u64) -> usize {
        let owned = |entry: &StreamEntry| entry.owner.load(Ordering::Acquire) == connection_id;
        match self.linger {
            None => {
                let before = self.streams.len();
                self.streams.retain(|_, entry| !owned(entry));
                before.saturating_sub(self.streams.len())
            }
            Some(_) => {
                let now = Instant::now();
                let mut orphaned = 0;
                for entry in self.streams.iter() {
                    if owned(entry.value()) {
                        *entry.orphaned_at.lock() = Some(now);
                        orphaned += 1;
                    }
                }
                orphaned
            }
        }
    }

    /// Drop streams past their lifetime or linger time
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, entry| !self.is_expired(entry, now));
        before.saturating_sub(self.streams.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn clear(&self) -> usize {
        let count = self.streams.len();
        self.streams.clear();
        count
    }

    fn is_expired(&self, entry: &StreamEntry, now: Instant) -> bool {
        let too_old = self
            .lifetime
            .is_some_and(|lifetime| now.saturating_duration_since(entry.created) > lifetime);
        let abandoned = match *entry.orphaned_at.lock() {
            Some(since) => self
                .linger
                .map_or(true, |linger| now.saturating_duration_since(since) > linger),
            None => false,
        };
        too_old || abandoned
    }
}
