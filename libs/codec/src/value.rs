//! Dynamic payload values
//!
//! Call arguments, return values and handshake data are all [`Value`]s, so
//! one serializer implementation covers every body. Application types enter
//! the model as `Custom` values through the [`crate::ClassRegistry`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Application type encoded by a registered class codec
    Custom { tag: String, value: Box<Value> },
    /// Reference to a remote object: URI text, or a bare object id that the
    /// owning daemon rewrites into its URI before replying
    Proxy(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Custom { .. } => "custom",
            Value::Proxy(_) => "proxy",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Reference text of a `Proxy` value
    pub fn as_proxy(&self) -> Option<&str> {
        match self {
            Value::Proxy(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Field lookup on a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    /// Visit every `Custom` tag in this value, depth first
    pub fn for_each_custom_tag<E>(&self, f: &mut impl FnMut(&str) -> Result<(), E>) -> Result<(), E> {
        match self {
            Value::List(items) => items.iter().try_for_each(|v| v.for_each_custom_tag(f)),
            Value::Map(map) => map.values().try_for_each(|v| v.for_each_custom_tag(f)),
            Value::Custom { tag, value } => {
                f(tag)?;
                value.for_each_custom_tag(f)
            }
            _ => Ok(()),
        }
    }

    /// Rewrite every `Proxy` reference in place, depth first
    pub fn for_each_proxy_mut(&mut self, f: &mut impl FnMut(&mut String)) {
        match self {
            Value::List(items) => items.iter_mut().for_each(|v| v.for_each_proxy_mut(f)),
            Value::Map(map) => map.values_mut().for_each(|v| v.for_each_proxy_mut(f)),
            Value::Custom { value, .. } => value.for_each_proxy_mut(f),
            Value::Proxy(reference) => f(reference),
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "b'{}'", hex::encode(b)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", key, item)?;
                }
                write!(f, "}}")
            }
            Value::Custom { tag, value } => write!(f, "{}({})", tag, value),
            Value::Proxy(reference) => write!(f, "<proxy {}>", reference),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Build a `Vec<Value>` argument list from heterogeneous expressions
#[macro_export]
macro_rules! args {
    () => { Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => { vec![$($crate::Value::from($arg)),+] };
}
