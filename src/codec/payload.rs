//! # Event Payload
//!
//! Serialized form of one event and the result-returning builder that
//! validates names and properties before anything is written.

use super::properties::PropertyRegistry;
use crate::error::{AgentError, Result};
use crate::types::{EventType, LIB_NAME, LIB_VERSION};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Longest string property value kept verbatim; longer values are cut and
/// suffixed with `$`.
pub const MAX_STRING_PROPERTY_LEN: usize = 8191;

/// Caller `$time` values before 2015-01-01 are ignored.
const MIN_VALID_EVENT_TIME_MS: u64 = 1_420_070_400_000;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_$][a-zA-Z0-9_$]{0,99}$").expect("static regex")
    })
}

fn reserved_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(distinct_id|original_id|time|properties|id|first_id|second_id|users|events|event|user_id|date|datetime|user_group.*|user_tag.*)$",
        )
        .expect("static regex")
    })
}

/// Reject names that are malformed or collide with reserved payload keys.
pub fn validate_name(name: &str) -> bool {
    name_pattern().is_match(name) && !reserved_pattern().is_match(name)
}

/// How the event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibMethod {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "autoTrack")]
    AutoTrack,
}

/// Library block of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibProperties {
    #[serde(rename = "$lib")]
    pub lib: String,
    #[serde(rename = "$lib_version")]
    pub lib_version: String,
    #[serde(rename = "$lib_method")]
    pub lib_method: LibMethod,
}

/// One event as serialized into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "_track_id")]
    pub track_id: i32,
    /// Event-declared time (Unix ms)
    pub time: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub lib: LibProperties,
    pub properties: Map<String, Value>,
}

impl EventPayload {
    /// Event name for track-family events.
    pub fn name(&self) -> Option<&str> {
        self.event.as_deref()
    }
}

/// Builder for [`EventPayload`]; all validation happens in [`build`].
///
/// [`build`]: EventBuilder::build
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: EventType,
    name: Option<String>,
    time: u64,
    lib_method: LibMethod,
    properties: Map<String, Value>,
}

impl EventBuilder {
    pub fn new(event_type: EventType, time: u64) -> Self {
        Self {
            event_type,
            name: None,
            time,
            lib_method: LibMethod::Code,
            properties: Map::new(),
        }
    }

    /// A `track` event with the given name.
    pub fn track(name: impl Into<String>, time: u64) -> Self {
        Self::new(EventType::Track, time).name(name)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn event_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn lib_method(mut self, method: LibMethod) -> Self {
        self.lib_method = method;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Validate, merge registry properties under the caller's, and produce
    /// the payload.
    pub fn build(self, registry: &PropertyRegistry) -> Result<EventPayload> {
        let event = if self.event_type.is_track() {
            let name = self
                .name
                .ok_or_else(|| AgentError::InvalidEventName("missing event name".to_string()))?;
            if !validate_name(&name) {
                return Err(AgentError::InvalidEventName(name));
            }
            Some(name)
        } else {
            None
        };

        let mut caller = self.properties;
        let mut time = self.time;
        let project = take_string(&mut caller, "$project");
        let token = take_string(&mut caller, "$token");

        if let Some(value) = caller.remove("$time") {
            match value.as_u64() {
                Some(declared) if declared >= MIN_VALID_EVENT_TIME_MS => time = declared,
                _ => log::warn!("Ignoring invalid $time property: {}", value),
            }
        }

        let mut properties = registry.merge(caller);
        for (key, value) in properties.iter_mut() {
            validate_property(key, value)?;
        }

        Ok(EventPayload {
            track_id: rand::random::<i32>(),
            time,
            event_type: self.event_type,
            event,
            project,
            token,
            lib: LibProperties {
                lib: LIB_NAME.to_string(),
                lib_version: LIB_VERSION.to_string(),
                lib_method: self.lib_method,
            },
            properties,
        })
    }
}

fn take_string(properties: &mut Map<String, Value>, key: &str) -> Option<String> {
    match properties.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

/// Check one property, truncating over-long strings in place.
fn validate_property(key: &str, value: &mut Value) -> Result<()> {
    if !validate_name(key) {
        return Err(AgentError::InvalidProperty(format!("invalid key '{}'", key)));
    }

    match value {
        Value::String(s) => truncate_string(s),
        Value::Number(_) | Value::Bool(_) => {}
        Value::Array(items) => {
            for item in items.iter_mut() {
                match item {
                    Value::String(s) => truncate_string(s),
                    _ => {
                        return Err(AgentError::InvalidProperty(format!(
                            "'{}' must be a list of strings",
                            key
                        )))
                    }
                }
            }
        }
        Value::Null | Value::Object(_) => {
            return Err(AgentError::InvalidProperty(format!(
                "'{}' has unsupported type",
                key
            )))
        }
    }
    Ok(())
}

fn truncate_string(s: &mut String) {
    if s.chars().count() > MAX_STRING_PROPERTY_LEN {
        let mut cut: String = s.chars().take(MAX_STRING_PROPERTY_LEN).collect();
        cut.push('$');
        *s = cut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> PropertyRegistry {
        PropertyRegistry::empty()
    }

    #[test]
    fn test_event_names() {
        assert!(validate_name("AppStart"));
        assert!(validate_name("$AppEnd"));
        assert!(validate_name("_private_1"));
        assert!(!validate_name(""));
        assert!(!validate_name("1st"));
        assert!(!validate_name("has space"));
        assert!(!validate_name("time"));
        assert!(!validate_name("Distinct_Id"));
        assert!(!validate_name("user_group_x"));
        assert!(!validate_name(&"a".repeat(101)));
    }

    #[test]
    fn test_build_track_payload() {
        let payload = EventBuilder::track("BuyProduct", 1_700_000_000_000)
            .property("price", 12.5)
            .property("tags", json!(["a", "b"]))
            .build(&registry())
            .unwrap();

        assert_eq!(payload.name(), Some("BuyProduct"));
        assert_eq!(payload.time, 1_700_000_000_000);
        assert_eq!(payload.properties["price"], json!(12.5));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "track");
        assert_eq!(value["lib"]["$lib_method"], "code");
        assert!(value.get("project").is_none());
    }

    #[test]
    fn test_invalid_property_is_an_error() {
        let err = EventBuilder::track("Ok", 1)
            .property("nested", json!({"a": 1}))
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidProperty(_)));

        let err = EventBuilder::track("Ok", 1)
            .property("list", json!([1, 2]))
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidProperty(_)));

        let err = EventBuilder::track("Ok", 1)
            .property("bad key", 1)
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidProperty(_)));
    }

    #[test]
    fn test_invalid_name_is_an_error() {
        let err = EventBuilder::track("event", 1).build(&registry()).unwrap_err();
        assert!(matches!(err, AgentError::InvalidEventName(_)));

        let err = EventBuilder::new(EventType::Track, 1)
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidEventName(_)));
    }

    #[test]
    fn test_reserved_properties_lifted() {
        let payload = EventBuilder::track("Login", 1_700_000_000_000)
            .property("$time", 1_600_000_000_000u64)
            .property("$project", "staging")
            .property("$token", "abc")
            .build(&registry())
            .unwrap();

        assert_eq!(payload.time, 1_600_000_000_000);
        assert_eq!(payload.project.as_deref(), Some("staging"));
        assert_eq!(payload.token.as_deref(), Some("abc"));
        assert!(!payload.properties.contains_key("$time"));
        assert!(!payload.properties.contains_key("$project"));
    }

    #[test]
    fn test_stale_time_ignored() {
        let payload = EventBuilder::track("Login", 1_700_000_000_000)
            .property("$time", 1000)
            .build(&registry())
            .unwrap();
        assert_eq!(payload.time, 1_700_000_000_000);
    }

    #[test]
    fn test_long_string_truncated() {
        let payload = EventBuilder::track("Note", 1)
            .property("body", "x".repeat(MAX_STRING_PROPERTY_LEN + 10))
            .build(&registry())
            .unwrap();
        let body = payload.properties["body"].as_str().unwrap();
        assert_eq!(body.chars().count(), MAX_STRING_PROPERTY_LEN + 1);
        assert!(body.ends_with('$'));
    }

    #[test]
    fn test_non_track_event_has_no_name() {
        let payload = EventBuilder::new(EventType::Default, 1)
            .property("k", "v")
            .build(&registry())
            .unwrap();
        assert!(payload.event.is_none());
        assert_eq!(serde_json::to_value(&payload).unwrap()["type"], "default");
    }
}
