//! Object Registry
//!
//! Maps object ids to their registered [`Target`]s, plus local-name
//! aliases used by LOCATION resolution. Read on every dispatch, written
//! only at register/unregister, so one reader/writer lock guards it.

use crate::error::{Error, Result};
use crate::object::Target;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Target>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; ids are unique
    pub fn insert(&self, object_id: &str, target: Target) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(object_id) {
            return Err(Error::daemon(format!(
                "object '{}' is already registered",
                object_id
            )));
        }
        entries.insert(object_id.to_string(), Arc::new(target));
        Ok(())
    }

    /// Remove an entry and the aliases pointing at it
    pub fn remove(&self, object_id: &str) -> Option<Arc<Target>> {
        let removed = self.entries.write().remove(object_id)?;
        self.aliases.write().retain(|_, target| target != object_id);
        Some(removed)
    }

    pub fn get(&self, object_id: &str) -> Option<Arc<Target>> {
        self.entries.read().get(object_id).cloned()
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.entries.read().contains_key(object_id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `local_name` resolve to a registered object
    pub fn alias(&self, local_name: &str, object_id: &str) -> Result<()> {
        if !self.contains(object_id) {
            return Err(Error::daemon(format!("unknown object '{}'", object_id)));
        }
        self.aliases
            .write()
            .insert(local_name.to_string(), object_id.to_string());
        Ok(())
    }

    /// Object id for a local name: an alias, or the id itself
    pub fn resolve(&self, local_name: &str) -> Option<String> {
        if let Some(object_id) = self.aliases.read().get(local_name) {
            return Some(object_id.clone());
        }
        self.contains(local_name).then(|| local_name.to_string())
    }

    /// Drop every entry except `keep`
    pub fn clear_except(&self, keep: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|id, _| id == keep);
        self.aliases.write().clear();
        before - entries.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("objects", &self.ids()).finish()
    }
}
