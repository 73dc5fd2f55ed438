use super::{Event, Fields, Value};
use crate::connector::Delivery;
use bytes::Bytes;

/// Builder for creating test events
///
/// The built event owns a detached [`Delivery`] whose body is the JSON
/// encoding of the fields, so it can be acknowledged and dead-lettered
/// like a consumed message.
pub struct EventBuilder {
    name: String,
    fields: Fields,
    routing_key: String,
}

impl EventBuilder {
    /// Create a builder for an event with the given name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut fields = Fields::new();
        fields.insert("event".to_string(), Value::String(name.clone()));
        Self {
            name,
            fields,
            routing_key: String::new(),
        }
    }

    /// Add a field to the event
    pub fn field<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the routing key of the underlying delivery
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Build the Event
    pub fn build(self) -> Event {
        let body = serde_json::to_vec(&self.fields).unwrap_or_default();
        let valid = !self.name.is_empty();
        Event {
            fields: self.fields,
            name: self.name,
            valid,
            original_message: Delivery::detached(Bytes::from(body), self.routing_key),
        }
    }
}

