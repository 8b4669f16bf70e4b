//! Typed attribute values.
//!
//! Sensor values and effector parameters share one small value model so the
//! schema checks (`TypeMismatch`, `InvalidParameter`) are a single comparison.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a sensor or effector parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Integer,
    Double,
    Text,
    TextSet,
    Json,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Bool => "bool",
            ValueType::Integer => "integer",
            ValueType::Double => "double",
            ValueType::Text => "text",
            ValueType::TextSet => "text_set",
            ValueType::Json => "json",
        };
        f.write_str(s)
    }
}

/// A typed value held in an attribute store or passed as a parameter.
///
/// Serialized as `{"type": "...", "value": ...}` so mementos keep the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    TextSet(BTreeSet<String>),
    Json(serde_json::Value),
}

impl AttributeValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            AttributeValue::Bool(_) => ValueType::Bool,
            AttributeValue::Integer(_) => ValueType::Integer,
            AttributeValue::Double(_) => ValueType::Double,
            AttributeValue::Text(_) => ValueType::Text,
            AttributeValue::TextSet(_) => ValueType::TextSet,
            AttributeValue::Json(_) => ValueType::Json,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view used by rate and threshold policies.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            AttributeValue::TextSet(s) => Some(s),
            _ => None,
        }
    }

    /// Plain JSON rendering (no type tag), for CLI output and effector results.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Integer(i) => serde_json::Value::from(*i),
            AttributeValue::Double(d) => serde_json::Value::from(*d),
            AttributeValue::Text(s) => serde_json::Value::String(s.clone()),
            AttributeValue::TextSet(s) => {
                serde_json::Value::Array(s.iter().cloned().map(serde_json::Value::String).collect())
            }
            AttributeValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<BTreeSet<String>> for AttributeValue {
    fn from(v: BTreeSet<String>) -> Self {
        AttributeValue::TextSet(v)
    }
}
