//! Class codec registry
//!
//! Maps a type tag to an (encode, decode) pair so application types can
//! travel as [`Value::Custom`]. Bodies arriving from the network are checked
//! against the registry; an unregistered tag is a serialization error, so
//! peers cannot smuggle in types the receiver never agreed to handle.

use crate::error::{CodecError, Result};
use crate::value::Value;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;

type EncodeFn = Box<dyn Fn(&dyn Any) -> Option<Value> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&Value) -> std::result::Result<Box<dyn Any>, String> + Send + Sync>;

struct ClassCodec {
    type_id: TypeId,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of application type codecs
#[derive(Default)]
pub struct ClassRegistry {
    by_tag: RwLock<HashMap<String, ClassCodec>>,
    tag_by_type: RwLock<HashMap<TypeId, String>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `tag`, replacing any previous codec for either
    pub fn register<T, E, D>(&self, tag: impl Into<String>, encode: E, decode: D)
    where
        T: Any,
        E: Fn(&T) -> Value + Send + Sync + 'static,
        D: Fn(&Value) -> std::result::Result<T, String> + Send + Sync + 'static,
    {
        let tag = tag.into();
        let codec = ClassCodec {
            type_id: TypeId::of::<T>(),
            encode: Box::new(move |any| any.downcast_ref::<T>().map(&encode)),
            decode: Box::new(move |value| decode(value).map(|v| Box::new(v) as Box<dyn Any>)),
        };
        self.tag_by_type.write().insert(TypeId::of::<T>(), tag.clone());
        self.by_tag.write().insert(tag, codec);
    }

    pub fn unregister(&self, tag: &str) -> bool {
        match self.by_tag.write().remove(tag) {
            Some(codec) => {
                self.tag_by_type.write().remove(&codec.type_id);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.by_tag.read().contains_key(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.by_tag.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Encode an application value as a tagged custom value
    pub fn to_value<T: Any>(&self, item: &T) -> Result<Value> {
        let tag = self
            .tag_by_type
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| CodecError::unknown_type_tag(std::any::type_name::<T>()))?;
        let by_tag = self.by_tag.read();
        let codec = by_tag
            .get(&tag)
            .ok_or_else(|| CodecError::unknown_type_tag(tag.clone()))?;
        let inner = (codec.encode)(item)
            .ok_or_else(|| CodecError::serialize("class-registry", "type mismatch on encode"))?;
        Ok(Value::Custom {
            tag,
            value: Box::new(inner),
        })
    }

    /// Decode a custom value back into `T`
    pub fn from_value<T: Any>(&self, value: &Value) -> Result<T> {
        let Value::Custom { tag, value: inner } = value else {
            return Err(CodecError::serialize(
                "class-registry",
                format!("expected a custom value, got {}", value.type_name()),
            ));
        };
        let by_tag = self.by_tag.read();
        let codec = by_tag
            .get(tag)
            .ok_or_else(|| CodecError::unknown_type_tag(tag.clone()))?;
        if codec.type_id != TypeId::of::<T>() {
            return Err(CodecError::serialize(
                "class-registry",
                format!("tag '{}' does not decode to {}", tag, std::any::type_name::<T>()),
            ));
        }
        let decoded = (codec.decode)(inner).map_err(|e| CodecError::serialize(tag.clone(), e))?;
        decoded
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| CodecError::serialize(tag.clone(), "decoded value has the wrong type"))
    }

    /// Fail if any custom value inside `value` uses an unregistered tag
    pub fn validate(&self, value: &Value) -> Result<()> {
        let by_tag = self.by_tag.read();
        value.for_each_custom_tag(&mut |tag| {
            if by_tag.contains_key(tag) {
                Ok(())
            } else {
                Err(CodecError::unknown_type_tag(tag))
            }
        })
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry").field("tags", &self.tags()).finish()
    }
}
