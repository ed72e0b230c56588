//! Name Service
//!
//! A name server is an ordinary remote object registered under
//! `Tether.NameServer`. It maps names to DIRECT URIs plus a set of metadata
//! tags. [`NameServerClient`] is the typed client used by the resolver;
//! [`start_ns`] runs a name server on its own daemon.

use crate::daemon::Daemon;
use crate::error::{Error, RemoteError, Result};
use crate::object::{Capabilities, Expose, Invocation, RemoteObject, Reply, Target};
use crate::context::CallContext;
use crate::proxy::Proxy;
use crate::uri::{Scheme, Uri};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tether_codec::Value;
use tether_config::{ProtocolConfig, NAMESERVER_NAME};
use tether_network::Endpoint;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One name registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    pub uri: Uri,
    pub metadata: BTreeSet<String>,
}

/// Backing store of a name server
pub trait NameStorage: Send + Sync + 'static {
    /// Add or replace an entry; with `safe`, an existing name is an error
    fn insert(&self, entry: NameEntry, safe: bool) -> Result<()>;

    fn get(&self, name: &str) -> Option<NameEntry>;

    fn remove(&self, name: &str) -> bool;

    /// Remove every name starting with `prefix`; returns how many
    fn remove_prefix(&self, prefix: &str) -> usize;

    /// Entries sorted by name, optionally filtered by prefix
    fn list(&self, prefix: Option<&str>) -> Vec<NameEntry>;

    fn set_metadata(&self, name: &str, metadata: BTreeSet<String>) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries carrying all of `tags`, or any of them with `any`
    fn by_metadata(&self, tags: &BTreeSet<String>, any: bool) -> Vec<NameEntry> {
        self.list(None)
            .into_iter()
            .filter(|entry| {
                if any {
                    tags.iter().any(|tag| entry.metadata.contains(tag))
                } else {
                    tags.is_subset(&entry.metadata)
                }
            })
            .collect()
    }
}

/// Volatile in-process storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, NameEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameStorage for MemoryStorage {
    fn insert(&self, entry: NameEntry, safe: bool) -> Result<()> {
        let mut entries = self.entries.write();
        if safe && entries.contains_key(&entry.name) {
            return Err(Error::naming(format!("name '{}' is already registered", entry.name)));
        }
        entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<NameEntry> {
        self.entries.read().get(name).cloned()
    }

    fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|name, _| !name.starts_with(prefix));
        before - entries.len()
    }

    fn list(&self, prefix: Option<&str>) -> Vec<NameEntry> {
        self.entries
            .read()
            .values()
            .filter(|entry| prefix.map_or(true, |p| entry.name.starts_with(p)))
            .cloned()
            .collect()
    }

    fn set_metadata(&self, name: &str, metadata: BTreeSet<String>) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::naming(format!("unknown name '{}'", name)))?;
        entry.metadata = metadata;
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// The name server object
pub struct NameServer {
    storage: Arc<dyn NameStorage>,
}

impl NameServer {
    pub fn new(storage: Arc<dyn NameStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &Arc<dyn NameStorage> {
        &self.storage
    }

    fn register(&self, call: &Invocation) -> std::result::Result<(), RemoteError> {
        let name = call.str_arg(0, "name")?;
        if name.is_empty() {
            return Err(RemoteError::naming("name must not be empty"));
        }
        let uri = Uri::parse(call.str_arg(1, "uri")?).map_err(RemoteError::from)?;
        if uri.scheme() != Scheme::Direct {
            return Err(RemoteError::naming(format!("only DIRECT URIs can be registered, not {}", uri)));
        }
        let safe = match call.opt_arg(2, "safe") {
            Some(value) => value
                .as_bool()
                .ok_or_else(|| RemoteError::type_error("register() argument 'safe' must be bool"))?,
            None => false,
        };
        let metadata = match call.opt_arg(3, "metadata") {
            Some(value) => tag_set(value)?,
            None => BTreeSet::new(),
        };
        debug!(name, uri = %uri, "Registering name");
        self.storage.insert(
            NameEntry {
                name: name.to_string(),
                uri,
                metadata,
            },
            safe,
        )?;
        Ok(())
    }
}

fn tag_set(value: &Value) -> std::result::Result<BTreeSet<String>, RemoteError> {
    let items = value
        .as_list()
        .ok_or_else(|| RemoteError::type_error(format!("metadata must be a list, not {}", value.type_name())))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| RemoteError::type_error("metadata tags must be strings"))
        })
        .collect()
}

fn uri_map(entries: Vec<NameEntry>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|entry| (entry.name, Value::Str(entry.uri.to_string())))
            .collect(),
    )
}

impl Expose for NameServer {
    fn capabilities() -> Capabilities {
        Capabilities::new()
            .method("register")
            .method("lookup")
            .method("remove")
            .method("list")
            .method("list_by_metadata")
            .method("set_metadata")
            .method("count")
            .method("ping")
    }
}

#[async_trait]
impl RemoteObject for NameServer {
    async fn invoke(&self, _ctx: &CallContext, call: Invocation) -> std::result::Result<Reply, RemoteError> {
        match call.method.as_str() {
            "register" => {
                self.register(&call)?;
                Ok(Reply::none())
            }
            "lookup" => {
                let name = call.str_arg(0, "name")?;
                let entry = self
                    .storage
                    .get(name)
                    .ok_or_else(|| RemoteError::naming(format!("unknown name: {}", name)))?;
                Ok(Reply::value(entry.uri.to_string()))
            }
            "remove" => {
                let removed = match (call.opt_arg(0, "name"), call.opt_arg(1, "prefix")) {
                    (Some(name), _) => {
                        let name = name
                            .as_str()
                            .ok_or_else(|| RemoteError::type_error("remove() argument 'name' must be str"))?;
                        if name == NAMESERVER_NAME {
                            0
                        } else {
                            usize::from(self.storage.remove(name))
                        }
                    }
                    (None, Some(prefix)) => {
                        let prefix = prefix
                            .as_str()
                            .ok_or_else(|| RemoteError::type_error("remove() argument 'prefix' must be str"))?;
                        let own = self.storage.get(NAMESERVER_NAME);
                        let removed = self.storage.remove_prefix(prefix);
                        // The name server keeps its own registration
                        match own {
                            Some(own) if self.storage.get(NAMESERVER_NAME).is_none() => {
                                self.storage.insert(own, false)?;
                                removed - 1
                            }
                            _ => removed,
                        }
                    }
                    (None, None) => {
                        return Err(RemoteError::type_error("remove() needs a name or a prefix"));
                    }
                };
                Ok(Reply::Value(Value::Int(removed as i64)))
            }
            "list" => {
                let prefix = match call.opt_arg(0, "prefix") {
                    Some(value) => Some(
                        value
                            .as_str()
                            .ok_or_else(|| RemoteError::type_error("list() argument 'prefix' must be str"))?,
                    ),
                    None => None,
                };
                Ok(Reply::Value(uri_map(self.storage.list(prefix))))
            }
            "list_by_metadata" => {
                let tags = tag_set(call.arg(0, "metadata")?)?;
                if tags.is_empty() {
                    return Err(RemoteError::value_error("at least one metadata tag is required"));
                }
                let any = call.opt_arg(1, "any").and_then(Value::as_bool).unwrap_or(false);
                Ok(Reply::Value(uri_map(self.storage.by_metadata(&tags, any))))
            }
            "set_metadata" => {
                let name = call.str_arg(0, "name")?;
                let tags = tag_set(call.arg(1, "metadata")?)?;
                self.storage.set_metadata(name, tags)?;
                Ok(Reply::none())
            }
            "count" => Ok(Reply::Value(Value::Int(self.storage.len() as i64))),
            "ping" => Ok(Reply::none()),
            other => Err(RemoteError::attribute(format!("no such name server method '{}'", other))),
        }
    }
}

/// Typed client for a name server
#[derive(Debug)]
pub struct NameServerClient {
    proxy: Proxy,
}

impl NameServerClient {
    pub fn new(location: Endpoint, config: Arc<ProtocolConfig>) -> Result<Self> {
        let proxy = Proxy::new(Uri::direct(NAMESERVER_NAME, location), config)?;
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn register(&self, name: &str, uri: &Uri, safe: bool) -> Result<()> {
        self.register_with_metadata(name, uri, &BTreeSet::new(), safe).await
    }

    pub async fn register_with_metadata(
        &self,
        name: &str,
        uri: &Uri,
        metadata: &BTreeSet<String>,
        safe: bool,
    ) -> Result<()> {
        let args = vec![
            Value::from(name),
            Value::Str(uri.to_string()),
            Value::Bool(safe),
            tags_value(metadata),
        ];
        self.proxy.call("register", args).await.map(|_| ())
    }

    pub async fn lookup(&self, name: &str) -> Result<Uri> {
        let found = self.proxy.call("lookup", vec![Value::from(name)]).await?;
        let text = found
            .as_str()
            .ok_or_else(|| Error::protocol(format!("lookup returned a {}", found.type_name())))?;
        let uri = Uri::parse(text)?;
        if !uri.is_direct() {
            return Err(Error::naming(format!("'{}' is registered with non-DIRECT {}", name, uri)));
        }
        Ok(uri)
    }

    /// Remove one name; false if it was not registered
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.proxy.call("remove", vec![Value::from(name)]).await?;
        Ok(removed.as_i64().unwrap_or(0) > 0)
    }

    pub async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self
            .proxy
            .call("remove", vec![Value::Null, Value::from(prefix)])
            .await?;
        Ok(removed.as_i64().unwrap_or(0).max(0) as usize)
    }

    pub async fn list(&self, prefix: Option<&str>) -> Result<BTreeMap<String, Uri>> {
        let listed = self.proxy.call("list", vec![Value::from(prefix)]).await?;
        parse_uri_map(&listed)
    }

    /// Registrations carrying all `tags` (any of them with `any`), by name
    pub async fn list_by_metadata(&self, tags: &BTreeSet<String>, any: bool) -> Result<BTreeMap<String, Uri>> {
        let listed = self
            .proxy
            .call("list_by_metadata", vec![tags_value(tags), Value::Bool(any)])
            .await?;
        parse_uri_map(&listed)
    }

    pub async fn set_metadata(&self, name: &str, tags: &BTreeSet<String>) -> Result<()> {
        self.proxy
            .call("set_metadata", vec![Value::from(name), tags_value(tags)])
            .await
            .map(|_| ())
    }

    pub async fn count(&self) -> Result<usize> {
        let count = self.proxy.call("count", Vec::new()).await?;
        Ok(count.as_i64().unwrap_or(0).max(0) as usize)
    }

    pub async fn ping(&self) -> Result<()> {
        self.proxy.call("ping", Vec::new()).await.map(|_| ())
    }

    pub async fn release(&self) {
        self.proxy.release().await;
    }
}

fn tags_value(tags: &BTreeSet<String>) -> Value {
    Value::List(tags.iter().map(|tag| Value::Str(tag.clone())).collect())
}

fn parse_uri_map(value: &Value) -> Result<BTreeMap<String, Uri>> {
    let map = value
        .as_map()
        .ok_or_else(|| Error::protocol(format!("expected a map of URIs, got {}", value.type_name())))?;
    map.iter()
        .map(|(name, uri)| {
            let text = uri
                .as_str()
                .ok_or_else(|| Error::protocol(format!("URI of '{}' is not a string", name)))?;
            Ok((name.clone(), Uri::parse(text)?))
        })
        .collect()
}

/// Find a reachable name server at `location` or the configured one
pub async fn locate_ns(config: Arc<ProtocolConfig>, location: Option<Endpoint>) -> Result<NameServerClient> {
    let location = location.unwrap_or_else(|| Endpoint::tcp(config.ns_host.clone(), config.ns_port));
    let client = NameServerClient::new(location.clone(), config)?;
    match client.ping().await {
        Ok(()) => Ok(client),
        Err(e) => Err(Error::naming(format!("no name server at {}: {}", location, e))),
    }
}

/// A name server running on its own daemon
pub struct NameServerHandle {
    daemon: Daemon,
    uri: Uri,
    task: JoinHandle<Result<()>>,
}

impl NameServerHandle {
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn location(&self) -> &Endpoint {
        self.daemon.location()
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    /// Stop the daemon and wait for its loop to end
    pub async fn shutdown(self) -> Result<()> {
        self.daemon.shutdown().await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::daemon(format!("name server loop panicked: {}", e))),
        }
    }
}

/// Start an in-memory name server on `ns_host:ns_port`
pub async fn start_ns(config: ProtocolConfig) -> Result<NameServerHandle> {
    let endpoint = Endpoint::tcp(config.ns_host.clone(), config.ns_port);
    start_ns_on(config, endpoint, Arc::new(MemoryStorage::new())).await
}

/// Start a name server with explicit endpoint and storage
pub async fn start_ns_on(
    config: ProtocolConfig,
    endpoint: Endpoint,
    storage: Arc<dyn NameStorage>,
) -> Result<NameServerHandle> {
    let daemon = Daemon::builder(config).endpoint(endpoint).bind().await?;
    let uri = daemon.register(
        Target::instance(NameServer::new(storage.clone())),
        Some(NAMESERVER_NAME),
    )?;
    storage.insert(
        NameEntry {
            name: NAMESERVER_NAME.to_string(),
            uri: uri.clone(),
            metadata: BTreeSet::new(),
        },
        false,
    )?;
    let task = daemon.spawn();
    info!(uri = %uri, "Name server started");
    Ok(NameServerHandle { daemon, uri, task })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, tags: &[&str]) -> NameEntry {
        NameEntry {
            name: name.to_string(),
            uri: Uri::direct(format!("obj_{}", name), Endpoint::tcp("localhost", 4000)),
            metadata: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn safe_registration_refuses_duplicates() {
        let storage = MemoryStorage::new();
        storage.insert(entry("a", &[]), true).unwrap();
        assert!(matches!(storage.insert(entry("a", &[]), true), Err(Error::Naming { .. })));
        storage.insert(entry("a", &["x"]), false).unwrap();
        assert_eq!(storage.get("a").unwrap().metadata.len(), 1);
    }

    #[test]
    fn metadata_queries() {
        let storage = MemoryStorage::new();
        storage.insert(entry("b.printer", &["printer", "color"]), false).unwrap();
        storage.insert(entry("a.printer", &["printer"]), false).unwrap();
        storage.insert(entry("scanner", &["scanner"]), false).unwrap();

        let tags: BTreeSet<String> = ["printer".to_string()].into();
        let names: Vec<String> = storage.by_metadata(&tags, false).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.printer", "b.printer"]);

        let tags: BTreeSet<String> = ["color".to_string(), "scanner".to_string()].into();
        assert!(storage.by_metadata(&tags, false).is_empty());
        assert_eq!(storage.by_metadata(&tags, true).len(), 2);
    }

    #[test]
    fn prefix_removal() {
        let storage = MemoryStorage::new();
        for name in ["app.a", "app.b", "other"] {
            storage.insert(entry(name, &[]), false).unwrap();
        }
        assert_eq!(storage.remove_prefix("app."), 2);
        assert_eq!(storage.list(None).len(), 1);
        assert!(storage.set_metadata("missing", BTreeSet::new()).is_err());
    }
}
