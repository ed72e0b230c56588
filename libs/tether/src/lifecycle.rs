//! Instance Lifecycle Manager
//!
//! Decides which live instance handles a call to a class registration:
//! one per daemon, one per client connection, or a fresh one per call.
//! Pinned registrations always use their registered instance.

use crate::object::{RemoteObject, Target, TargetKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How instances of a registered class are created and shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceMode {
    /// One instance per daemon, created on first use
    Single,
    /// One instance per client connection
    Session,
    /// A new instance for every call
    PerCall,
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceMode::Single => "single",
            InstanceMode::Session => "session",
            InstanceMode::PerCall => "percall",
        };
        f.write_str(name)
    }
}

/// Session-mode instances owned by one client connection
#[derive(Default)]
pub struct SessionInstances {
    instances: Mutex<HashMap<String, Arc<dyn RemoteObject>>>,
}

impl SessionInstances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all instances; returns how many there were
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.instances.lock());
        dropped.len()
    }
}

/// Daemon-wide owner of singleton instances
#[derive(Default)]
pub struct LifecycleManager {
    singletons: DashMap<String, Arc<dyn RemoteObject>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance that should handle a call to `object_id`
    pub fn instance(
        &self,
        object_id: &str,
        target: &Target,
        session: &SessionInstances,
    ) -> Arc<dyn RemoteObject> {
        match &target.kind {
            TargetKind::Pinned(instance) => instance.clone(),
            TargetKind::Class { mode, factory } => match mode {
                // The entry holds its shard lock while the factory runs, so
                // racing first calls observe a single instance
                InstanceMode::Single => self
                    .singletons
                    .entry(object_id.to_string())
                    .or_insert_with(|| {
                        debug!(object_id, "Creating singleton instance");
                        factory()
                    })
                    .clone(),
                InstanceMode::Session => session
                    .instances
                    .lock()
                    .entry(object_id.to_string())
                    .or_insert_with(|| {
                        debug!(object_id, "Creating session instance");
                        factory()
                    })
                    .clone(),
                InstanceMode::PerCall => factory(),
            },
        }
    }

    /// Forget the singleton of an unregistered object
    pub fn forget(&self, object_id: &str) -> bool {
        self.singletons.remove(object_id).is_some()
    }

    pub fn clear(&self) {
        self.singletons.clear();
    }

    pub fn singleton_count(&self) -> usize {
        self.singletons.len()
    }
}
