//! Call Context and Resource Tracking
//!
//! Every dispatched call gets a [`CallContext`] describing where it came
//! from. Objects can hand resources to the context; they are tied to the
//! client connection and released exactly once, either explicitly or when
//! the connection closes, whichever happens first.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_codec::{AnnotationTag, Annotations, MessageFlags};
use tether_network::PeerAddr;
use tracing::{debug, warn};
use uuid::Uuid;

/// Something that must be closed when its client connection goes away
pub trait Resource: Send + Sync {
    fn close(&self);

    /// Name used in logs
    fn name(&self) -> &str {
        "resource"
    }
}

struct TrackedResource {
    id: u64,
    resource: Box<dyn Resource>,
    released: AtomicBool,
}

impl TrackedResource {
    fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!(id = self.id, resource = self.resource.name(), "Releasing tracked resource");
        self.resource.close();
        true
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Handle to a tracked resource for early, explicit release
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<TrackedResource>,
}

impl ResourceHandle {
    /// Close now; false when it was already released
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.inner.id)
            .field("resource", &self.inner.resource.name())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Resources tracked for one client connection
#[derive(Clone, Default)]
pub struct ResourceTracker {
    next_id: Arc<AtomicU64>,
    resources: Arc<Mutex<Vec<Arc<TrackedResource>>>>,
    /// Set once the connection is torn down
    closed: Arc<AtomicBool>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, resource: Box<dyn Resource>) -> ResourceHandle {
        let tracked = Arc::new(TrackedResource {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            resource,
            released: AtomicBool::new(false),
        });
        {
            let mut resources = self.resources.lock();
            if !self.closed.load(Ordering::Acquire) {
                resources.retain(|r| !r.is_released());
                resources.push(tracked.clone());
                return ResourceHandle { inner: tracked };
            }
        }
        // Late work on a torn-down connection; nobody will drain this tracker again
        debug!(id = tracked.id, "Connection already closed, releasing resource at once");
        tracked.release();
        ResourceHandle { inner: tracked }
    }

    /// Resources not yet released
    pub fn len(&self) -> usize {
        self.resources.lock().iter().filter(|r| !r.is_released()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the owning connection has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release everything still open and close the tracker; resources
    /// tracked afterwards are released immediately. Returns how many were closed.
    pub fn release_all(&self) -> usize {
        let resources = {
            let mut resources = self.resources.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *resources)
        };
        let released = resources.iter().filter(|r| r.release()).count();
        if released > 0 {
            debug!(released, "Released connection resources");
        }
        released
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("open", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reply adjustments requested by the invoked object
#[derive(Debug, Default)]
pub(crate) struct ReplyOverrides {
    pub annotations: Annotations,
    pub correlation_id: Option<Uuid>,
    pub stream_end: bool,
}

/// Per-call view of the client connection
pub struct CallContext {
    connection_id: u64,
    peer: PeerAddr,
    correlation_id: Uuid,
    flags: MessageFlags,
    authenticated: bool,
    annotations: Annotations,
    resources: ResourceTracker,
    reply: Mutex<ReplyOverrides>,
}

impl CallContext {
    pub(crate) fn new(
        connection_id: u64,
        peer: PeerAddr,
        authenticated: bool,
        resources: ResourceTracker,
    ) -> Self {
        Self {
            connection_id,
            peer,
            correlation_id: Uuid::nil(),
            flags: MessageFlags::default(),
            authenticated,
            annotations: Annotations::new(),
            resources,
            reply: Mutex::new(ReplyOverrides::default()),
        }
    }

    /// Attach the request message's routing data
    pub(crate) fn with_request(
        mut self,
        correlation_id: Uuid,
        flags: MessageFlags,
        annotations: Annotations,
    ) -> Self {
        self.correlation_id = correlation_id;
        self.flags = flags;
        self.annotations = annotations;
        self
    }

    /// Id of the client connection
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Whether the handshake marked the connection authenticated
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Annotations sent with the request
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Attach an annotation to the reply
    pub fn set_response_annotation(&self, tag: AnnotationTag, data: impl Into<Bytes>) {
        if tag == AnnotationTag::HMAC {
            warn!("Ignoring attempt to set the HMAC annotation on a reply");
            return;
        }
        self.reply.lock().annotations.insert(tag, data);
    }

    /// Tie a resource to the client connection
    pub fn track_resource(&self, resource: Box<dyn Resource>) -> ResourceHandle {
        self.resources.track(resource)
    }

    /// Open resources on this connection
    pub fn tracked_resources(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn set_reply_correlation(&self, correlation_id: Uuid) {
        self.reply.lock().correlation_id = Some(correlation_id);
    }

    pub(crate) fn mark_stream_end(&self) {
        self.reply.lock().stream_end = true;
    }

    pub(crate) fn take_reply_overrides(&self) -> ReplyOverrides {
        std::mem::take(&mut *self.reply.lock())
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("correlation_id", &self.correlation_id)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);

    impl Resource for Counted {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_happens_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let tracker = ResourceTracker::new();
        let handle = tracker.track(Box::new(Counted(closes.clone())));
        tracker.track(Box::new(Counted(closes.clone())));
        assert_eq!(tracker.len(), 2);

        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.release_all(), 1);
        assert_eq!(tracker.release_all(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracking_after_teardown_releases_at_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let tracker = ResourceTracker::new();
        tracker.track(Box::new(Counted(closes.clone())));
        assert_eq!(tracker.release_all(), 1);
        assert!(tracker.is_closed());

        let late = tracker.track(Box::new(Counted(closes.clone())));
        assert!(late.is_released());
        assert!(!late.release());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn racing_releases_close_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let tracker = ResourceTracker::new();
        let handle = tracker.track(Box::new(Counted(closes.clone())));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        handle.release();
                    } else {
                        tracker.release_all();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn context_collects_reply_overrides() {
        let peer = PeerAddr::Tcp("127.0.0.1:1".parse().unwrap());
        let ctx = CallContext::new(7, peer, false, ResourceTracker::new());
        ctx.set_response_annotation(AnnotationTag::new("XTRA").unwrap(), vec![1u8]);
        ctx.set_response_annotation(AnnotationTag::HMAC, vec![0u8; 32]);
        ctx.mark_stream_end();

        let overrides = ctx.take_reply_overrides();
        assert_eq!(overrides.annotations.len(), 1);
        assert!(overrides.stream_end);
        assert!(!ctx.take_reply_overrides().stream_end);
    }
}
