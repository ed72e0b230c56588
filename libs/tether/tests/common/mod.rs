//! Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::{
    CallContext, Capabilities, Daemon, Expose, Invocation, ProtocolConfig, RemoteError,
    RemoteObject, Reply, Resource, Value,
};
use tokio::task::JoinHandle;

/// Loopback config with a call timeout so a broken test fails instead of hanging
pub fn test_config() -> ProtocolConfig {
    let mut config = ProtocolConfig::default().with_comm_timeout(5.0).with_poll_timeout(0.05);
    config.host = "127.0.0.1".to_string();
    config.ns_host = "127.0.0.1".to_string();
    config
}

pub async fn start(config: ProtocolConfig) -> (Daemon, JoinHandle<tether::Result<()>>) {
    let daemon = Daemon::bind(config).await.expect("daemon binds");
    let task = daemon.spawn();
    (daemon, task)
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Arithmetic plus a few failure modes
pub struct Calculator;

#[async_trait]
impl RemoteObject for Calculator {
    async fn invoke(&self, _ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
        match call.method.as_str() {
            "add" => Ok(Reply::value(call.i64_arg(0, "a")? + call.i64_arg(1, "b")?)),
            "div" => {
                let b = call.i64_arg(1, "b")?;
                if b == 0 {
                    return Err(RemoteError::new("ZeroDivisionError", "division by zero")
                        .with_frame("Calculator.div"));
                }
                Ok(Reply::value(call.i64_arg(0, "a")? / b))
            }
            "echo" => Ok(Reply::Value(call.arg(0, "value")?.clone())),
            "blob" => {
                let size = call.i64_arg(0, "size")? as usize;
                Ok(Reply::value(vec![0u8; size]))
            }
            "sleep" => {
                let millis = call.i64_arg(0, "millis")? as u64;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Reply::none())
            }
            "secret" => Ok(Reply::value("classified")),
            "count" => {
                let upto = call.i64_arg(0, "upto")?;
                Ok(Reply::stream(stream::iter((1..=upto).map(|i| Ok(Value::Int(i))))))
            }
            "count_then_fail" => {
                let upto = call.i64_arg(0, "upto")?;
                let items = (1..=upto)
                    .map(|i| Ok(Value::Int(i)))
                    .chain(std::iter::once(Err(RemoteError::new("ValueError", "ran dry"))));
                Ok(Reply::stream(stream::iter(items)))
            }
            other => Err(RemoteError::attribute(format!("no method {}", other))),
        }
    }
}

impl Expose for Calculator {
    fn capabilities() -> Capabilities {
        Capabilities::new()
            .method("add")
            .method("div")
            .method("echo")
            .method("blob")
            .method("sleep")
            .method("count")
            .method("count_then_fail")
            .requires_auth("secret")
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Reports which instance handled the call
pub struct Identity {
    id: u64,
}

impl Identity {
    pub fn new() -> Self {
        Self {
            id: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl RemoteObject for Identity {
    async fn invoke(&self, _ctx: &CallContext, _call: Invocation) -> Result<Reply, RemoteError> {
        Ok(Reply::value(self.id as i64))
    }
}

impl Expose for Identity {
    fn capabilities() -> Capabilities {
        Capabilities::new().method("identity")
    }
}

/// Slow oneway method with a completion counter
pub struct Recorder {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteObject for Recorder {
    async fn invoke(&self, _ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
        match call.method.as_str() {
            "record" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::none())
            }
            "calls" => Ok(Reply::value(self.calls.load(Ordering::SeqCst) as i64)),
            other => Err(RemoteError::attribute(other.to_string())),
        }
    }
}

impl Expose for Recorder {
    fn capabilities() -> Capabilities {
        Capabilities::new().oneway("record").method("calls")
    }
}

pub struct CountedResource(pub Arc<AtomicUsize>);

impl Resource for CountedResource {
    fn close(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "counted"
    }
}

/// Opens resources tied to the calling connection
pub struct ResourceOwner {
    pub closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteObject for ResourceOwner {
    async fn invoke(&self, ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
        match call.method.as_str() {
            "open" => {
                let handle = ctx.track_resource(Box::new(CountedResource(self.closes.clone())));
                if call.opt_arg(0, "release_now").and_then(Value::as_bool).unwrap_or(false) {
                    handle.release();
                }
                Ok(Reply::value(ctx.tracked_resources() as i64))
            }
            "open_later" => {
                let millis = call.i64_arg(0, "millis")? as u64;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                ctx.track_resource(Box::new(CountedResource(self.closes.clone())));
                Ok(Reply::none())
            }
            other => Err(RemoteError::attribute(other.to_string())),
        }
    }
}

impl Expose for ResourceOwner {
    fn capabilities() -> Capabilities {
        Capabilities::new().method("open").oneway("open_later")
    }
}

/// Exposes attributes next to its methods, and hands out object references
pub struct Thermostat {
    pub level: Arc<AtomicI64>,
}

#[async_trait]
impl RemoteObject for Thermostat {
    async fn invoke(&self, _ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError> {
        match call.method.as_str() {
            "reset" => {
                self.level.store(0, Ordering::SeqCst);
                Ok(Reply::none())
            }
            "twin" => Ok(Reply::value(Value::Proxy(call.str_arg(0, "object_id")?.to_string()))),
            "twins" => {
                let ids = call.arg(0, "object_ids")?.as_list().unwrap_or_default();
                let refs = ids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|id| Value::Proxy(id.to_string()))
                    .collect::<Vec<_>>();
                Ok(Reply::value(refs))
            }
            other => Err(RemoteError::attribute(other.to_string())),
        }
    }

    async fn get_attribute(&self, _ctx: &CallContext, name: &str) -> Result<Value, RemoteError> {
        match name {
            "level" => Ok(Value::Int(self.level.load(Ordering::SeqCst))),
            "version" => Ok(Value::from("2.1")),
            other => Err(RemoteError::attribute(other.to_string())),
        }
    }

    async fn set_attribute(&self, _ctx: &CallContext, name: &str, value: Value) -> Result<(), RemoteError> {
        match name {
            "level" => {
                let level = value
                    .as_i64()
                    .ok_or_else(|| RemoteError::type_error(format!("level must be int, not {}", value.type_name())))?;
                self.level.store(level, Ordering::SeqCst);
                Ok(())
            }
            other => Err(RemoteError::attribute(other.to_string())),
        }
    }
}

impl Expose for Thermostat {
    fn capabilities() -> Capabilities {
        Capabilities::new()
            .attribute("level")
            .readonly_attribute("version")
            .method("reset")
            .method("twin")
            .method("twins")
    }
}
