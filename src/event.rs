/// Decoded events and the dynamically-typed field values they carry
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::connector::Delivery;

// Export EventBuilder for tests
pub use builder::EventBuilder;

/// Module with event builder for testing
pub mod builder;

/// Field mapping decoded from a message body
pub type Fields = HashMap<String, Value>;

/// Value type for decoded message fields
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// String value
    String(String),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// Array of values
    Array(Vec<Value>),
    /// Object mapping keys to values
    Object(HashMap<String, Value>),
    /// Null value
    #[default]
    Null,
}

impl Value {
    /// Name of the variant, used in type errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Null => "null",
        }
    }

    /// Borrow the string payload, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the nested mapping, if this is an object
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::String(s) => Value::String(s),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                // u64 above i64::MAX and all non-integers land here
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            JsonValue::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            JsonValue::Null => Value::Null,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::String(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Array(arr) => arr.serialize(serializer),
            Value::Object(obj) => obj.serialize(serializer),
            Value::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        JsonValue::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str(self.type_name()),
        }
    }
}

/// Typed field access failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    /// The key is not present in the event
    #[error("couldn't find value for key `{key}`")]
    Missing {
        /// Requested key
        key: String,
    },

    /// The key is present but holds a value of another type
    #[error("value for key `{key}` is a {found}, not a {expected}")]
    WrongType {
        /// Requested key
        key: String,
        /// Type the caller asked for
        expected: &'static str,
        /// Type actually stored
        found: &'static str,
    },
}

/// -2^63, exactly representable
const I64_MIN_F64: f64 = -9_223_372_036_854_775_808.0;
/// 2^63, the first float past `i64::MAX`
const I64_END_F64: f64 = 9_223_372_036_854_775_808.0;

/// A decoded unit of work
#[derive(Debug, Clone)]
pub struct Event {
    /// Decoded fields, empty when decoding failed
    pub fields: Fields,
    /// Handler name taken from the reserved `event` field
    pub name: String,
    /// True iff decoding succeeded and the name is non-empty
    pub valid: bool,
    /// Transport message, acknowledged exactly once by the worker pool
    pub original_message: Delivery,
}

impl Event {
    /// Look up a raw field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    fn lookup(&self, key: &str) -> Result<&Value, FieldError> {
        self.fields.get(key).ok_or_else(|| FieldError::Missing {
            key: key.to_string(),
        })
    }

    fn wrong_type(key: &str, expected: &'static str, found: &Value) -> FieldError {
        FieldError::WrongType {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    /// Read a string field
    pub fn get_string(&self, key: &str) -> Result<&str, FieldError> {
        match self.lookup(key)? {
            Value::String(s) => Ok(s),
            other => Err(Self::wrong_type(key, "string", other)),
        }
    }

    /// Read an integer field; finite floats are truncated toward zero
    pub fn get_int(&self, key: &str) -> Result<i64, FieldError> {
        match self.lookup(key)? {
            Value::Integer(i) => Ok(*i),
            Value::Float(f) if f.is_finite() && *f >= I64_MIN_F64 && *f < I64_END_F64 => {
                Ok(f.trunc() as i64)
            }
            other => Err(Self::wrong_type(key, "integer", other)),
        }
    }

    /// Read a float field; integers are widened
    pub fn get_float(&self, key: &str) -> Result<f64, FieldError> {
        match self.lookup(key)? {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(Self::wrong_type(key, "float", other)),
        }
    }

    /// Read a boolean field
    pub fn get_bool(&self, key: &str) -> Result<bool, FieldError> {
        match self.lookup(key)? {
            Value::Boolean(b) => Ok(*b),
            other => Err(Self::wrong_type(key, "boolean", other)),
        }
    }

    /// Read a nested mapping
    pub fn get_object(&self, key: &str) -> Result<&HashMap<String, Value>, FieldError> {
        match self.lookup(key)? {
            Value::Object(map) => Ok(map),
            other => Err(Self::wrong_type(key, "object", other)),
        }
    }
}
