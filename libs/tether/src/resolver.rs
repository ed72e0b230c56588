//! URI Resolution
//!
//! Turns NAME, LOCATION and METADATA URIs into DIRECT ones. Name and
//! metadata lookups go to the name service; LOCATION lookups ask the
//! daemon object at the given location. Helper connections are released
//! as soon as the answer is in.

use crate::error::{Error, Result};
use crate::naming::NameServerClient;
use crate::proxy::Proxy;
use crate::uri::{Scheme, Uri};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tether_codec::Value;
use tether_config::{ProtocolConfig, DAEMON_OBJECT_ID};
use tether_network::Endpoint;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Resolver {
    config: Arc<ProtocolConfig>,
}

impl Resolver {
    pub fn new(config: Arc<ProtocolConfig>) -> Self {
        Self { config }
    }

    /// Name service location for `uri`: its own location or the configured one
    pub fn ns_location(&self, uri: &Uri) -> Endpoint {
        uri.location()
            .cloned()
            .unwrap_or_else(|| Endpoint::tcp(self.config.ns_host.clone(), self.config.ns_port))
    }

    /// DIRECT URI for `uri`; DIRECT URIs come back unchanged
    pub fn resolve<'a>(&'a self, uri: &'a Uri) -> BoxFuture<'a, Result<Uri>> {
        async move {
            let resolved = match uri.scheme() {
                Scheme::Direct => return Ok(uri.clone()),
                Scheme::Name => self.resolve_name(uri).await?,
                Scheme::Location => self.resolve_location(uri).await?,
                Scheme::Metadata => self.resolve_metadata(uri).await?,
            };
            debug!(uri = %uri, resolved = %resolved, "Resolved URI");
            Ok(resolved)
        }
        .boxed()
    }

    async fn resolve_name(&self, uri: &Uri) -> Result<Uri> {
        let ns = NameServerClient::new(self.ns_location(uri), self.config.clone())?;
        let found = ns.lookup(uri.object()).await;
        ns.release().await;
        found.map_err(|e| match e {
            Error::Naming { .. } => e,
            other => Error::naming(format!("cannot resolve {}: {}", uri, other)),
        })
    }

    async fn resolve_location(&self, uri: &Uri) -> Result<Uri> {
        let location = uri
            .location()
            .cloned()
            .ok_or_else(|| Error::protocol(format!("{} has no location", uri)))?;
        let daemon = Proxy::new(Uri::direct(DAEMON_OBJECT_ID, location.clone()), self.config.clone())?;
        let found = daemon.call("resolve", vec![Value::from(uri.object())]).await;
        daemon.release().await;
        match found {
            Ok(Value::Str(object_id)) => Ok(Uri::direct(object_id, location)),
            Ok(other) => Err(Error::protocol(format!(
                "daemon resolved {} to a {} instead of an object id",
                uri,
                other.type_name()
            ))),
            Err(e) => Err(Error::protocol(format!("cannot resolve {}: {}", uri, e))),
        }
    }

    /// Registrations carrying every tag; the lowest name wins
    async fn resolve_metadata(&self, uri: &Uri) -> Result<Uri> {
        let ns = NameServerClient::new(self.ns_location(uri), self.config.clone())?;
        let found = ns.list_by_metadata(uri.tags(), false).await;
        ns.release().await;
        let candidates = found.map_err(|e| match e {
            Error::Naming { .. } => e,
            other => Error::naming(format!("cannot resolve {}: {}", uri, other)),
        })?;
        let (name, target) = candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::naming(format!("no registration carries all tags of {}", uri)))?;
        debug!(uri = %uri, name = %name, "Selected metadata match");
        Ok(target)
    }
}
