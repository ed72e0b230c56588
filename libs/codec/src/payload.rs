//! Message bodies
//!
//! The structured content a serializer turns into body bytes. A message
//! type admits only some payload kinds; the daemon and proxy check that.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One remote method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallBody {
    pub object_id: String,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallBody {
    pub fn new(object_id: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            object_id: object_id.into(),
            method: method.into(),
            args,
            kwargs: BTreeMap::new(),
        }
    }
}

/// Remote error carried across the process boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error kind name, e.g. `AttributeError`
    pub kind: String,
    pub message: String,
    /// Frame descriptions, outermost first
    pub traceback: Vec<String>,
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one call inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Ok(Value),
    Err(ErrorEnvelope),
}

/// Exposed surface of a registered object, sent on connect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub methods: BTreeSet<String>,
    pub oneway: BTreeSet<String>,
    /// Attributes readable through `__getattr__`
    #[serde(default)]
    pub attrs: BTreeSet<String>,
}

impl ObjectMetadata {
    pub fn to_value(&self) -> Value {
        let list = |set: &BTreeSet<String>| {
            Value::List(set.iter().map(|m| Value::Str(m.clone())).collect())
        };
        Value::Map(BTreeMap::from([
            ("methods".to_string(), list(&self.methods)),
            ("oneway".to_string(), list(&self.oneway)),
            ("attrs".to_string(), list(&self.attrs)),
        ]))
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let set = |key: &str| -> Option<BTreeSet<String>> {
            value
                .get(key)?
                .as_list()?
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect()
        };
        Some(Self {
            methods: set("methods")?,
            oneway: set("oneway")?,
            attrs: set("attrs").unwrap_or_default(),
        })
    }
}

/// Client side of the connect handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub handshake: Value,
    /// Object the client wants metadata for
    pub object: Option<String>,
}

/// Server answer to a successful handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub handshake: Value,
    pub meta: Option<ObjectMetadata>,
}

/// Everything a message body can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Call(CallBody),
    Batch(Vec<CallBody>),
    Data(Value),
    Outcomes(Vec<Outcome>),
    Error(ErrorEnvelope),
    Handshake(HandshakeRequest),
    HandshakeReply(HandshakeReply),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Call(_) => "call",
            Payload::Batch(_) => "batch",
            Payload::Data(_) => "data",
            Payload::Outcomes(_) => "outcomes",
            Payload::Error(_) => "error",
            Payload::Handshake(_) => "handshake",
            Payload::HandshakeReply(_) => "handshake-reply",
        }
    }

    /// Visit every value embedded in the payload
    pub fn values(&self) -> Vec<&Value> {
        fn call_values(call: &CallBody) -> impl Iterator<Item = &Value> {
            call.args.iter().chain(call.kwargs.values())
        }
        match self {
            Payload::Call(call) => call_values(call).collect(),
            Payload::Batch(calls) => calls.iter().flat_map(call_values).collect(),
            Payload::Data(value) => vec![value],
            Payload::Outcomes(outcomes) => outcomes
                .iter()
                .filter_map(|o| match o {
                    Outcome::Ok(v) => Some(v),
                    Outcome::Err(_) => None,
                })
                .collect(),
            Payload::Error(_) => Vec::new(),
            Payload::Handshake(req) => vec![&req.handshake],
            Payload::HandshakeReply(reply) => vec![&reply.handshake],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_value_conversion() {
        let meta = ObjectMetadata {
            methods: ["add", "log"].iter().map(|s| s.to_string()).collect(),
            oneway: ["log"].iter().map(|s| s.to_string()).collect(),
            attrs: ["level"].iter().map(|s| s.to_string()).collect(),
        };
        assert_eq!(ObjectMetadata::from_value(&meta.to_value()), Some(meta.clone()));

        // Metadata without attributes still converts
        let mut bare = meta.to_value();
        if let Value::Map(map) = &mut bare {
            map.remove("attrs");
        }
        let bare = ObjectMetadata::from_value(&bare).unwrap();
        assert!(bare.attrs.is_empty());
        assert_eq!(bare.methods, meta.methods);
        assert_eq!(ObjectMetadata::from_value(&Value::Null), None);
    }

    #[test]
    fn payload_values_cover_arguments() {
        let mut call = CallBody::new("obj", "m", vec![Value::Int(1)]);
        call.kwargs.insert("k".into(), Value::Int(2));
        let payload = Payload::Batch(vec![call.clone(), call]);
        assert_eq!(payload.values().len(), 4);
        assert_eq!(payload.kind(), "batch");
    }
}
