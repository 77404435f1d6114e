//! Dynamic payload values
//!
//! `args`, `kwargs` and `result` carry arbitrary structures. [`Value`] is the
//! tagged representation of those structures. Binary data is a first-class
//! variant and travels as a native MessagePack `bin`; strings that name an
//! out-of-band attachment (`wslink_bin<N>`) are recognised once, at decode
//! time, and kept as [`Value::Placeholder`] until the attachment is spliced in.

use bytes::Bytes;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of legacy attachment placeholder tokens
pub const PLACEHOLDER_PREFIX: &str = "wslink_bin";

/// Check whether a string is a legacy attachment placeholder token
pub fn is_placeholder(s: &str) -> bool {
    match s.strip_prefix(PLACEHOLDER_PREFIX) {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// A dynamically typed payload value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent / null
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Integer(i64),
    /// Unsigned integer too large for `i64`
    UInteger(u64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Inline binary payload
    Binary(Bytes),
    /// Token standing in for a binary payload delivered out of band
    Placeholder(String),
    /// Ordered sequence
    Array(Vec<Value>),
    /// String-keyed mapping
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a placeholder token for attachment number `n`
    pub fn placeholder(n: u64) -> Self {
        Self::Placeholder(format!("{}{}", PLACEHOLDER_PREFIX, n))
    }

    /// Check for `Nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// String contents, including placeholder tokens
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Placeholder(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if representable as `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::UInteger(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Integer contents, if representable as `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(n) => u64::try_from(*n).ok(),
            Self::UInteger(n) => Some(*n),
            _ => None,
        }
    }

    /// Floating point contents; integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(n) => Some(*n as f64),
            Self::UInteger(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Boolean contents
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Binary contents
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Sequence contents
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Mapping contents
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key in a mapping
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Visit every placeholder token, depth first, in document order
    ///
    /// The visitor may replace the placeholder in place.
    pub fn visit_placeholders_mut<F>(&mut self, visitor: &mut F)
    where
        F: FnMut(&mut Value),
    {
        if matches!(self, Self::Placeholder(_)) {
            visitor(self);
            return;
        }
        match self {
            Self::Array(items) => {
                for item in items {
                    item.visit_placeholders_mut(visitor);
                }
            }
            Self::Map(map) => {
                for item in map.values_mut() {
                    item.visit_placeholders_mut(visitor);
                }
            }
            _ => {}
        }
    }

    /// Replace every inline binary value, depth first, in document order
    ///
    /// `replace` receives the payload and returns the value to leave in its
    /// place.
    pub fn replace_binaries<F>(&mut self, replace: &mut F)
    where
        F: FnMut(Bytes) -> Value,
    {
        match self {
            Self::Binary(b) => {
                let payload = std::mem::take(b);
                *self = replace(payload);
            }
            Self::Array(items) => {
                for item in items {
                    item.replace_binaries(replace);
                }
            }
            Self::Map(map) => {
                for item in map.values_mut() {
                    item.replace_binaries(replace);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Integer(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Integer(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => Self::Integer(n),
            Err(_) => Self::UInteger(n),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Nil => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::UInteger(n) => serializer.serialize_u64(*n),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) | Self::Placeholder(s) => serializer.serialize_str(s),
            Self::Binary(b) => serializer.serialize_bytes(b),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any wslink payload value")
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Integer(n))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(Value::from(n))
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<Value, E> {
        Ok(Value::Float(f))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        self.visit_string(s.to_string())
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        if is_placeholder(&s) {
            Ok(Value::Placeholder(s))
        } else {
            Ok(Value::String(s))
        }
    }

    fn visit_bytes<E: de::Error>(self, b: &[u8]) -> Result<Value, E> {
        Ok(Value::Binary(Bytes::copy_from_slice(b)))
    }

    fn visit_byte_buf<E: de::Error>(self, b: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Binary(Bytes::from(b)))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}
