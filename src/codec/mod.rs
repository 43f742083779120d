//! Payload normalization for the relay log.
//!
//! The log stores JSON documents. JSON has no notion of an "absent" value, so
//! a payload is normalized before it is written: object fields holding
//! [`Payload::Absent`] are removed and absent array elements are elided,
//! keeping the remaining elements in their original relative order.
//!
//! Decoding never reintroduces what encoding removed. A payload that went
//! through the log may have fewer fields or elements than the one that was
//! broadcast. Callers that need a field to be present must set it explicitly
//! before broadcasting.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::record::DeliveryOptions;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while normalizing or reconstructing payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed {field}: {message}")]
    Malformed {
        field: &'static str,
        message: String,
    },
}

/// Arbitrary nested event data.
///
/// Mirrors the JSON data model with one extra state, `Absent`, for values that
/// exist in the host's data but cannot be persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Build an object payload from key/value pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Payload::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an array payload.
    pub fn array<I: IntoIterator<Item = Payload>>(items: I) -> Self {
        Payload::Array(items.into_iter().collect())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Payload::Absent)
    }

    /// Look up an object field. Returns `None` for non-objects and missing keys.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            // A bare absent value has no container to be removed from.
            Payload::Absent | Payload::Null => serializer.serialize_unit(),
            Payload::Bool(b) => serializer.serialize_bool(*b),
            Payload::Number(n) => n.serialize(serializer),
            Payload::String(s) => serializer.serialize_str(s),
            Payload::Array(items) => {
                serializer.collect_seq(items.iter().filter(|item| !item.is_absent()))
            }
            Payload::Object(fields) => serialize_present(fields, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Payload::from)
    }
}

/// Serialize a map, skipping entries whose value is absent.
pub(crate) fn serialize_present<S: Serializer>(
    fields: &BTreeMap<String, Payload>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(fields.iter().filter(|(_, v)| !v.is_absent()))
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(fields) => {
                Payload::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::String(s)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Payload::Number(n.into())
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Payload::Absent)
    }
}

/// Normalize a payload into its storable form.
pub fn encode(payload: &Payload) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

/// Reconstruct a payload from its stored form.
pub fn decode(stored: Value) -> Payload {
    Payload::from(stored)
}

/// Normalize delivery options. Whole-namespace delivery is written as an
/// explicit `null` so it stays distinguishable from an empty room set.
pub fn encode_options(options: &DeliveryOptions) -> Result<Value> {
    Ok(serde_json::to_value(options)?)
}

/// Reconstruct delivery options from a stored record.
pub fn decode_options(stored: Value) -> Result<DeliveryOptions> {
    if !stored.is_object() {
        return Err(CodecError::Malformed {
            field: "delivery options",
            message: format!("expected an object, got {}", kind_of(&stored)),
        });
    }
    Ok(serde_json::from_value(stored)?)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
