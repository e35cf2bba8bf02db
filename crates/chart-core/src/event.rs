//! Inbound events - stimuli routed to one extension

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field carrying the target extension id in a raw producer field map.
pub const EXTENSION_FIELD: &str = "extension";
/// Field carrying the event name in a raw producer field map.
pub const EVENT_FIELD: &str = "event";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event is missing the '{0}' field")]
    MissingField(&'static str),
}

/// An inbound stimulus for one extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Target extension id.
    pub target: String,
    /// Event name matched against transition triggers.
    pub name: String,
    /// Auxiliary fields, exposed to guards and actions as `_event.<field>`.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build an event from a producer's raw field map.
    ///
    /// `extension` names the target and `event` the event name; both stay in
    /// the field map.
    pub fn from_fields(fields: BTreeMap<String, String>) -> Result<Self, EventError> {
        let target = fields
            .get(EXTENSION_FIELD)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or(EventError::MissingField(EXTENSION_FIELD))?;
        let name = fields
            .get(EVENT_FIELD)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or(EventError::MissingField(EVENT_FIELD))?;
        Ok(Self {
            target,
            name,
            fields,
        })
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fields_requires_target_and_name() {
        let mut fields = BTreeMap::new();
        fields.insert("extension".to_string(), "101".to_string());
        assert_eq!(
            Event::from_fields(fields.clone()),
            Err(EventError::MissingField("event"))
        );

        fields.insert("event".to_string(), "GetStatus".to_string());
        fields.insert("Status".to_string(), "Registered".to_string());
        let event = Event::from_fields(fields).unwrap();
        assert_eq!(event.target, "101");
        assert_eq!(event.name, "GetStatus");
        assert_eq!(event.field("Status"), Some("Registered"));
    }

    #[test]
    fn test_from_fields_rejects_empty_target() {
        let mut fields = BTreeMap::new();
        fields.insert("extension".to_string(), String::new());
        fields.insert("event".to_string(), "x".to_string());
        assert_eq!(
            Event::from_fields(fields),
            Err(EventError::MissingField("extension"))
        );
    }
}
