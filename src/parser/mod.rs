use crate::connector::Delivery;
use crate::consumer::sanitize::{repair_escapes, repair_text};
use crate::event::{Event, Fields, Value};
use serde_json::Value as JsonValue;
use std::borrow::Cow;

/// Parser error types
pub mod error;

pub use error::ParseError;

/// Field that carries the handler name
pub const EVENT_NAME_FIELD: &str = "event";

/// Decodes message bodies into [`Event`]s
#[derive(Debug, Clone)]
pub struct EventParser {
    name_field: String,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    /// Create a parser reading the name from the `event` field
    pub fn new() -> Self {
        Self {
            name_field: EVENT_NAME_FIELD.to_string(),
        }
    }

    /// Create a parser reading the name from another field
    pub fn with_name_field(name_field: impl Into<String>) -> Self {
        Self {
            name_field: name_field.into(),
        }
    }

    /// Field the event name is read from
    pub fn name_field(&self) -> &str {
        &self.name_field
    }

    /// Decode a raw body into a field mapping.
    ///
    /// Broken text does not reject the body: invalid UTF-8 sequences are
    /// dropped and unpaired surrogate escapes become U+FFFD before a second
    /// attempt. The first decode error is reported if that also fails.
    pub fn decode_fields(&self, raw: &[u8]) -> Result<Fields, ParseError> {
        match serde_json::from_slice::<JsonValue>(raw) {
            Ok(value) => object_fields(value),
            Err(err) => match repaired_body(raw) {
                Some(body) => serde_json::from_str::<JsonValue>(&body)
                    .map_err(|_| ParseError::from(err))
                    .and_then(object_fields),
                None => Err(err.into()),
            },
        }
    }

    /// Turn a delivery into an event.
    ///
    /// The event is always produced. When decoding fails, or the name is
    /// missing or not a string, it comes back with `valid == false` together
    /// with the error that caused it.
    pub fn parse(&self, delivery: Delivery) -> (Event, Option<ParseError>) {
        let (fields, decode_error) = match self.decode_fields(delivery.body()) {
            Ok(fields) => (fields, None),
            Err(err) => (Fields::new(), Some(err)),
        };

        let (name, name_error) = match fields.get(&self.name_field) {
            Some(Value::String(name)) if !name.is_empty() => (name.clone(), None),
            Some(Value::String(_)) | None => (String::new(), Some(ParseError::MissingEventName)),
            Some(other) => (
                String::new(),
                Some(ParseError::InvalidEventName {
                    found: other.type_name(),
                }),
            ),
        };

        let valid = decode_error.is_none() && !name.is_empty();
        let event = Event {
            fields,
            name,
            valid,
            original_message: delivery,
        };
        (event, decode_error.or(name_error))
    }
}

fn object_fields(value: JsonValue) -> Result<Fields, ParseError> {
    match value {
        JsonValue::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        other => Err(ParseError::NotAnObject {
            found: json_type_name(&other),
        }),
    }
}

/// Repaired copy of `raw`, or `None` when there is nothing to repair
fn repaired_body(raw: &[u8]) -> Option<String> {
    let (text, bytes_dropped) = match std::str::from_utf8(raw) {
        Ok(text) => (Cow::Borrowed(text), false),
        Err(_) => (Cow::Owned(repair_text(raw)), true),
    };
    let escaped = match repair_escapes(&text) {
        Cow::Owned(escaped) => Some(escaped),
        Cow::Borrowed(_) => None,
    };
    escaped.or_else(|| bytes_dropped.then(|| text.into_owned()))
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
