//! Remote Object Interface
//!
//! A registered object implements [`RemoteObject`] and declares what it
//! exposes through an explicit [`Capabilities`] table. The daemon consults
//! the table before every dispatch; methods absent from it are never
//! invoked.

use crate::context::CallContext;
use crate::error::RemoteError;
use crate::lifecycle::InstanceMode;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tether_codec::{ObjectMetadata, Value};

/// Wire method name for reading an exposed attribute
pub const GET_ATTRIBUTE: &str = "__getattr__";
/// Wire method name for writing an exposed attribute
pub const SET_ATTRIBUTE: &str = "__setattr__";

/// Items of a streamed result, produced one per client pull
pub type ItemStream = BoxStream<'static, Result<Value, RemoteError>>;

/// One method call as seen by the target object
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Invocation {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Positional argument, falling back to the keyword of the same name
    pub fn arg(&self, index: usize, name: &str) -> Result<&Value, RemoteError> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| {
                RemoteError::type_error(format!(
                    "{}() missing argument '{}' (position {})",
                    self.method, name, index
                ))
            })
    }

    /// Optional argument; `Null` counts as absent
    pub fn opt_arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .filter(|v| !v.is_null())
    }

    pub fn str_arg(&self, index: usize, name: &str) -> Result<&str, RemoteError> {
        let value = self.arg(index, name)?;
        value.as_str().ok_or_else(|| self.wrong_type(name, "str", value))
    }

    pub fn i64_arg(&self, index: usize, name: &str) -> Result<i64, RemoteError> {
        let value = self.arg(index, name)?;
        value.as_i64().ok_or_else(|| self.wrong_type(name, "int", value))
    }

    pub fn f64_arg(&self, index: usize, name: &str) -> Result<f64, RemoteError> {
        let value = self.arg(index, name)?;
        value.as_f64().ok_or_else(|| self.wrong_type(name, "float", value))
    }

    fn wrong_type(&self, name: &str, expected: &str, got: &Value) -> RemoteError {
        RemoteError::type_error(format!(
            "{}() argument '{}' must be {}, not {}",
            self.method,
            name,
            expected,
            got.type_name()
        ))
    }
}

/// What a remote method produced
pub enum Reply {
    Value(Value),
    /// Finite sequence pulled item by item by the client
    Stream(ItemStream),
}

impl Reply {
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Value(value.into())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Reply::Stream(Box::pin(stream))
    }

    /// No return value
    pub fn none() -> Self {
        Reply::Value(Value::Null)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An object reachable through a daemon
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Run one exposed method
    async fn invoke(&self, ctx: &CallContext, call: Invocation) -> Result<Reply, RemoteError>;

    /// Read an attribute declared with [`Capabilities::attribute`]
    async fn get_attribute(&self, _ctx: &CallContext, name: &str) -> Result<Value, RemoteError> {
        Err(RemoteError::attribute(format!("attribute '{}' is not readable", name)))
    }

    /// Write an attribute declared writable
    async fn set_attribute(&self, _ctx: &CallContext, name: &str, _value: Value) -> Result<(), RemoteError> {
        Err(RemoteError::attribute(format!("attribute '{}' is not writable", name)))
    }
}

/// Route a checked call to the method or attribute accessor it names
pub(crate) async fn invoke(
    object: &dyn RemoteObject,
    ctx: &CallContext,
    call: Invocation,
) -> Result<Reply, RemoteError> {
    match call.method.as_str() {
        GET_ATTRIBUTE => {
            let name = call.str_arg(0, "name")?;
            object.get_attribute(ctx, name).await.map(Reply::Value)
        }
        SET_ATTRIBUTE => {
            let name = call.str_arg(0, "name")?;
            let value = call.arg(1, "value")?.clone();
            object.set_attribute(ctx, name, value).await.map(|()| Reply::none())
        }
        _ => object.invoke(ctx, call).await,
    }
}

/// Static description of a type's exposed surface
pub trait Expose {
    fn capabilities() -> Capabilities;
}

/// Per-method exposure flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSpec {
    /// Server never replies; clients need not wait
    pub oneway: bool,
    /// Only callable on authenticated connections
    pub requires_auth: bool,
}

/// Explicit table of exposed methods and attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    methods: BTreeMap<String, MethodSpec>,
    /// Attribute name to writability
    attrs: BTreeMap<String, bool>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a normal method
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.entry(name.into()).or_default();
        self
    }

    /// Expose a oneway method
    pub fn oneway(mut self, name: impl Into<String>) -> Self {
        self.methods.entry(name.into()).or_default().oneway = true;
        self
    }

    /// Expose a method that needs an authenticated connection
    pub fn requires_auth(mut self, name: impl Into<String>) -> Self {
        self.methods.entry(name.into()).or_default().requires_auth = true;
        self
    }

    /// Expose an attribute for remote reads and writes
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), true);
        self
    }

    /// Expose an attribute for remote reads only
    pub fn readonly_attribute(mut self, name: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), false);
        self
    }

    pub fn is_attribute(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn is_writable(&self, name: &str) -> bool {
        self.attrs.get(name).copied().unwrap_or(false)
    }

    pub fn lookup(&self, method: &str) -> Option<MethodSpec> {
        self.methods.get(method).copied()
    }

    pub fn is_exposed(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn is_oneway(&self, method: &str) -> bool {
        self.lookup(method).is_some_and(|spec| spec.oneway)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, MethodSpec)> {
        self.methods.iter().map(|(name, spec)| (name.as_str(), *spec))
    }

    /// Metadata sent to clients during the handshake
    pub fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            methods: self.methods.keys().cloned().collect(),
            oneway: self
                .methods
                .iter()
                .filter(|(_, spec)| spec.oneway)
                .map(|(name, _)| name.clone())
                .collect(),
            attrs: self.attrs.keys().cloned().collect(),
        }
    }
}

pub(crate) type Factory = Arc<dyn Fn() -> Arc<dyn RemoteObject> + Send + Sync>;

pub(crate) enum TargetKind {
    /// One instance registered verbatim
    Pinned(Arc<dyn RemoteObject>),
    /// Instances created on demand per [`InstanceMode`]
    Class { mode: InstanceMode, factory: Factory },
}

/// Something that can be registered with a daemon
pub struct Target {
    pub(crate) kind: TargetKind,
    capabilities: Capabilities,
}

impl Target {
    /// Register an existing instance
    pub fn instance<T: RemoteObject + Expose>(object: T) -> Self {
        Self::shared(Arc::new(object))
    }

    /// Register an instance the caller keeps a handle to
    pub fn shared<T: RemoteObject + Expose>(object: Arc<T>) -> Self {
        Self {
            kind: TargetKind::Pinned(object),
            capabilities: T::capabilities(),
        }
    }

    /// Register a class; instances come from `factory` according to `mode`
    pub fn class<T, F>(mode: InstanceMode, factory: F) -> Self
    where
        T: RemoteObject + Expose,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Arc<dyn RemoteObject>);
        Self {
            kind: TargetKind::Class { mode, factory },
            capabilities: T::capabilities(),
        }
    }

    /// Replace the type's declared capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Instance mode; `None` for a pinned instance
    pub fn mode(&self) -> Option<InstanceMode> {
        match &self.kind {
            TargetKind::Pinned(_) => None,
            TargetKind::Class { mode, .. } => Some(*mode),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("mode", &self.mode())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_table() {
        let caps = Capabilities::new()
            .method("add")
            .oneway("log")
            .requires_auth("shutdown")
            .method("log");

        assert!(caps.is_exposed("add"));
        assert!(!caps.is_exposed("secret"));
        assert!(caps.is_oneway("log"));
        assert_eq!(
            caps.lookup("shutdown"),
            Some(MethodSpec {
                oneway: false,
                requires_auth: true
            })
        );

        let meta = caps.metadata();
        assert_eq!(meta.methods.len(), 3);
        assert_eq!(meta.oneway.iter().collect::<Vec<_>>(), vec!["log"]);
        assert!(meta.attrs.is_empty());
    }

    #[test]
    fn attribute_table() {
        let caps = Capabilities::new()
            .attribute("level")
            .readonly_attribute("version")
            .method("reset");

        assert!(caps.is_attribute("level"));
        assert!(caps.is_writable("level"));
        assert!(caps.is_attribute("version"));
        assert!(!caps.is_writable("version"));
        assert!(!caps.is_attribute("reset"));
        assert!(!caps.is_exposed("level"));

        let meta = caps.metadata();
        assert_eq!(meta.attrs.iter().collect::<Vec<_>>(), vec!["level", "version"]);
        assert_eq!(meta.methods.iter().collect::<Vec<_>>(), vec!["reset"]);
    }

    #[test]
    fn invocation_arguments() {
        let mut call = Invocation::new("scale", vec![Value::Int(3)]);
        call.kwargs.insert("factor".into(), Value::Float(1.5));

        assert_eq!(call.i64_arg(0, "x").unwrap(), 3);
        assert_eq!(call.f64_arg(1, "factor").unwrap(), 1.5);
        assert!(call.opt_arg(2, "offset").is_none());

        let missing = call.arg(2, "offset").unwrap_err();
        assert_eq!(missing.kind, "TypeError");
        let wrong = call.str_arg(0, "x").unwrap_err();
        assert!(wrong.message.contains("must be str, not int"));
    }
}
