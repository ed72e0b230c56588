//! Asynchronous Calls
//!
//! A [`FutureCall`] runs on its own copy of the proxy so the caller's
//! connection stays free. The resulting [`FutureResult`] can be awaited
//! any number of times and chained into further calls.

use super::Proxy;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_codec::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

/// A method bound to a private proxy, ready to be called
pub struct FutureCall {
    proxy: Proxy,
    method: String,
}

impl FutureCall {
    pub(crate) fn new(proxy: Proxy, method: &str) -> Self {
        Self {
            proxy,
            method: method.to_string(),
        }
    }

    pub fn call(self, args: Vec<Value>) -> FutureResult {
        self.call_with(args, BTreeMap::new())
    }

    pub fn call_with(self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> FutureResult {
        let template = self.proxy.clone_unconnected();
        let proxy = self.proxy;
        let method = self.method;
        let task = tokio::spawn(async move {
            let result = proxy.call_with(&method, args, kwargs).await;
            proxy.release().await;
            result
        });
        FutureResult::from_task(task, template)
    }
}

struct FutureState {
    task: Mutex<Option<JoinHandle<Result<Value>>>>,
    value: OnceCell<Result<Value>>,
    /// Target for [`FutureResult::then`]
    template: Proxy,
}

/// Eventual outcome of an asynchronous call
#[derive(Clone)]
pub struct FutureResult {
    inner: Arc<FutureState>,
}

impl FutureResult {
    fn from_task(task: JoinHandle<Result<Value>>, template: Proxy) -> Self {
        Self {
            inner: Arc::new(FutureState {
                task: Mutex::new(Some(task)),
                value: OnceCell::new(),
                template,
            }),
        }
    }

    /// Wait for the outcome; later calls return the same outcome
    pub async fn value(&self) -> Result<Value> {
        self.inner
            .value
            .get_or_init(|| async {
                let mut task = self.inner.task.lock().await;
                let Some(handle) = task.as_mut() else {
                    return Err(Error::usage("asynchronous call result was lost"));
                };
                let outcome = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::usage(format!("asynchronous call failed: {}", e))),
                };
                *task = None;
                outcome
            })
            .await
            .clone()
    }

    /// Whether the outcome is available without waiting
    pub fn ready(&self) -> bool {
        if self.inner.value.initialized() {
            return true;
        }
        match self.inner.task.try_lock() {
            Ok(task) => task.as_ref().is_some_and(|handle| handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Wait up to `timeout` (forever with `None`); true once the outcome is available
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.value()).await.is_ok(),
            None => {
                let _ = self.value().await;
                true
            }
        }
    }

    /// Call `method` on the same target with this outcome as first argument
    pub fn then(&self, method: &str, args: Vec<Value>) -> FutureResult {
        self.then_on(&self.inner.template, method, args)
    }

    /// Call `method` on another proxy's target with this outcome as first argument.
    /// A failed outcome propagates without making the call.
    pub fn then_on(&self, proxy: &Proxy, method: &str, args: Vec<Value>) -> FutureResult {
        let previous = self.clone();
        let next = proxy.clone_unconnected();
        let template = proxy.clone_unconnected();
        let method = method.to_string();
        let task = tokio::spawn(async move {
            let value = previous.value().await?;
            let mut chained = Vec::with_capacity(args.len() + 1);
            chained.push(value);
            chained.extend(args);
            let result = next.call(&method, chained).await;
            next.release().await;
            result
        });
        FutureResult::from_task(task, template)
    }
}

impl fmt::Debug for FutureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureResult")
            .field("ready", &self.ready())
            .field("value", &self.inner.value.get())
            .finish()
    }
}
