//! Payload serializers
//!
//! A serializer turns a [`Payload`] into body bytes and back. The codec only
//! carries the serializer id; the [`SerializerRegistry`] maps ids to
//! implementations and enforces the accepted-serializer allow-list on decode.

use crate::class_registry::ClassRegistry;
use crate::error::{CodecError, Result};
use crate::payload::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Body (de)serialization strategy
pub trait Serializer: Send + Sync {
    /// Wire id written into the message header
    fn id(&self) -> u16;

    /// Configuration name, e.g. `json`
    fn name(&self) -> &'static str;

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Payload>;
}

/// Human-readable JSON bodies
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const ID: u16 = 2;
}

impl Serializer for JsonSerializer {
    fn id(&self) -> u16 {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|e| CodecError::serialize(self.name(), e))
    }

    fn decode(&self, data: &[u8]) -> Result<Payload> {
        serde_json::from_slice(data).map_err(|e| CodecError::serialize(self.name(), e))
    }
}

/// Compact binary bodies
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub const ID: u16 = 3;
}

impl Serializer for BincodeSerializer {
    fn id(&self) -> u16 {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        bincode::serialize(payload).map_err(|e| CodecError::serialize(self.name(), e))
    }

    fn decode(&self, data: &[u8]) -> Result<Payload> {
        bincode::deserialize(data).map_err(|e| CodecError::serialize(self.name(), e))
    }
}

/// Known serializers plus the accepted subset and the class codecs
#[derive(Clone)]
pub struct SerializerRegistry {
    by_id: HashMap<u16, Arc<dyn Serializer>>,
    accepted: Vec<u16>,
    classes: Arc<ClassRegistry>,
}

impl SerializerRegistry {
    /// Registry with the stock serializers, all of them accepted
    pub fn new() -> Self {
        let mut registry = Self {
            by_id: HashMap::new(),
            accepted: Vec::new(),
            classes: Arc::new(ClassRegistry::new()),
        };
        registry.add(Arc::new(JsonSerializer));
        registry.add(Arc::new(BincodeSerializer));
        registry
    }

    /// Registry accepting only the named serializers
    pub fn with_accepted<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut registry = Self::new();
        registry.accepted = names
            .iter()
            .map(|name| registry.by_name(name.as_ref()).map(|s| s.id()))
            .collect::<Result<_>>()?;
        Ok(registry)
    }

    pub fn with_classes(mut self, classes: Arc<ClassRegistry>) -> Self {
        self.classes = classes;
        self
    }

    /// Add (and accept) a serializer
    pub fn add(&mut self, serializer: Arc<dyn Serializer>) {
        let id = serializer.id();
        self.by_id.insert(id, serializer);
        if !self.accepted.contains(&id) {
            self.accepted.push(id);
        }
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Serializer>> {
        self.by_id
            .values()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| CodecError::serialize(name, "unknown serializer"))
    }

    pub fn is_accepted(&self, id: u16) -> bool {
        self.accepted.contains(&id)
    }

    /// Look up a serializer by wire id, refusing ids outside the allow-list
    pub fn get(&self, id: u16) -> Result<Arc<dyn Serializer>> {
        let serializer = self.by_id.get(&id).filter(|_| self.is_accepted(id));
        serializer.cloned().ok_or_else(|| CodecError::SerializerNotAccepted {
            id,
            accepted: format!("{:?}", self.accepted),
        })
    }

    /// Encode with the given serializer; outgoing custom values must be registered
    pub fn encode(&self, id: u16, payload: &Payload) -> Result<Vec<u8>> {
        for value in payload.values() {
            self.classes.validate(value)?;
        }
        let serializer = self
            .by_id
            .get(&id)
            .ok_or_else(|| CodecError::serialize(id.to_string(), "unknown serializer"))?;
        serializer.encode(payload)
    }

    /// Decode an incoming body, enforcing the allow-list and class registry
    pub fn decode(&self, id: u16, data: &[u8]) -> Result<Payload> {
        let payload = self.get(id)?.decode(data)?;
        for value in payload.values() {
            self.classes.validate(value)?;
        }
        Ok(payload)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("accepted", &self.accepted)
            .field("classes", &self.classes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{CallBody, ErrorEnvelope, Outcome};
    use crate::value::Value;

    fn sample_payloads() -> Vec<Payload> {
        vec![
            Payload::Call(CallBody::new("obj_1", "add", vec![Value::Int(1), Value::Float(2.5)])),
            Payload::Outcomes(vec![
                Outcome::Ok(Value::Bytes(vec![0, 255])),
                Outcome::Err(ErrorEnvelope {
                    kind: "ValueError".into(),
                    message: "bad".into(),
                    traceback: vec!["at obj.method".into()],
                }),
            ]),
            Payload::Data(Value::Null),
            Payload::Data(Value::List(vec![Value::Proxy("DIRECT:obj_2@localhost:9090".into())])),
        ]
    }

    #[test]
    fn stock_serializers_agree() {
        let registry = SerializerRegistry::new();
        for id in [JsonSerializer::ID, BincodeSerializer::ID] {
            for payload in sample_payloads() {
                let bytes = registry.encode(id, &payload).unwrap();
                assert_eq!(registry.decode(id, &bytes).unwrap(), payload);
            }
        }
    }

    #[test]
    fn allow_list_is_enforced_on_decode() {
        let full = SerializerRegistry::new();
        let json_only = SerializerRegistry::with_accepted(&["json"]).unwrap();
        let payload = Payload::Data(Value::Int(5));

        let bytes = full.encode(BincodeSerializer::ID, &payload).unwrap();
        assert!(matches!(
            json_only.decode(BincodeSerializer::ID, &bytes),
            Err(CodecError::SerializerNotAccepted { id: 3, .. })
        ));
        assert!(json_only.decode(99, &bytes).is_err());
    }

    #[test]
    fn unknown_serializer_name() {
        assert!(SerializerRegistry::with_accepted(&["pickle"]).is_err());
    }

    #[test]
    fn unregistered_custom_value_is_refused() {
        let registry = SerializerRegistry::new();
        let payload = Payload::Data(Value::Custom {
            tag: "Secret".into(),
            value: Box::new(Value::Null),
        });
        assert_eq!(
            registry.encode(JsonSerializer::ID, &payload),
            Err(CodecError::unknown_type_tag("Secret"))
        );
    }

    #[test]
    fn garbage_body_is_serialization_error() {
        let registry = SerializerRegistry::new();
        let err = registry.decode(JsonSerializer::ID, b"{not json").unwrap_err();
        assert!(err.is_serialization());
    }
}
