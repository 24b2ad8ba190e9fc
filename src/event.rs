// Copyright 2025 Cowboy AI, LLC.

//! The canonical in-memory event envelope (component A) and its JSON-data
//! field-path accessor.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EventBridgeError, Result};

/// A rule's or target's declared retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retries deliveries 1..9 with `2^(attempt-1)` seconds, then 512s flat
    /// until attempt 177.
    #[default]
    ExponentialDecay,
    /// Retries deliveries 1..4 with a uniform random 10-20s delay.
    Backoff,
}

/// The CloudEvents-shaped core of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event id, also used as the MQ message key (`Key()`).
    pub id: u64,
    /// Non-empty on ingress.
    pub source: String,
    /// Non-empty on ingress.
    #[serde(rename = "type")]
    pub ty: String,
    /// CloudEvents subject.
    pub subject: String,
    /// Event creation time.
    pub time: DateTime<Utc>,
    /// CloudEvents datacontenttype, e.g. `application/json`.
    pub datacontenttype: String,
    /// Raw JSON payload, parsed lazily and cached on the owning [`Envelope`].
    pub data: String,
}

/// A single `path → value` lookup result. `NotExists` is a distinguished
/// sentinel in the value domain, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The path resolved to no value.
    NotExists,
    /// The path resolved to this JSON value.
    Value(Value),
}

impl FieldValue {
    /// True when this is the `NotExists` sentinel.
    pub fn is_not_exists(&self) -> bool {
        matches!(self, FieldValue::NotExists)
    }
}

/// The full envelope: event plus bus/retry/target routing metadata.
///
/// Immutable-after-receive except for the fields a transformer stamps
/// (`target_id`, `rule_name`, and an overriding `retry_strategy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The CloudEvents-shaped core.
    pub event: Event,
    /// Non-empty on ingress.
    pub bus_name: String,
    /// Set by a transformer when a target overrides the rule's strategy.
    pub retry_strategy: RetryStrategy,
    /// Set only after a transformer attributes the event to its destination.
    /// `0` before attribution; must be `>0` on any event enqueued to a
    /// target-exp-decay or target-backoff topic.
    pub target_id: u64,
    /// Set only after a transformer attributes the event to its destination.
    pub rule_name: String,
    /// String-to-string carrier for trace propagation.
    pub metadata: HashMap<String, String>,

    /// One-shot cache of the parsed `data` JSON tree. Not serialized: it is
    /// recomputed lazily from `event.data` by whichever side deserializes
    /// the envelope next.
    #[serde(skip)]
    parsed_data: OnceLock<std::result::Result<Value, String>>,
}

impl Envelope {
    /// Construct a fresh envelope for a newly-ingested source event.
    pub fn new(event: Event, bus_name: impl Into<String>) -> Self {
        Envelope {
            event,
            bus_name: bus_name.into(),
            retry_strategy: RetryStrategy::default(),
            target_id: 0,
            rule_name: String::new(),
            metadata: HashMap::new(),
            parsed_data: OnceLock::new(),
        }
    }

    /// The MQ message key: the string form of the event id.
    pub fn key(&self) -> String {
        self.event.id.to_string()
    }

    /// The serialized form of this envelope, used as the MQ message body.
    pub fn value(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(EventBridgeError::DataUnmarshalError)
    }

    /// Deep-copy this envelope. Each transformer must see an independent
    /// copy so that parallel transformations over one source event do not
    /// race on the lazily-initialized `data` parse cache.
    pub fn deep_clone(&self) -> Self {
        Envelope {
            event: self.event.clone(),
            bus_name: self.bus_name.clone(),
            retry_strategy: self.retry_strategy,
            target_id: self.target_id,
            rule_name: self.rule_name.clone(),
            metadata: self.metadata.clone(),
            // A fresh cache: the clone reparses `data` on first access rather
            // than sharing state with its origin, per the one-shot
            // initialization rule.
            parsed_data: OnceLock::new(),
        }
    }

    fn parsed_data(&self) -> std::result::Result<&Value, EventBridgeError> {
        let cached = self.parsed_data.get_or_init(|| {
            serde_json::from_str::<Value>(&self.event.data).map_err(|e| e.to_string())
        });
        cached
            .as_ref()
            .map_err(|msg| EventBridgeError::DataUnmarshalError(string_to_json_error(msg)))
    }

    /// Resolve `path` against the synthetic root mapping
    /// `{id,source,type,subject,time,datacontenttype,data}`; `data` is
    /// parsed once and cached. A missing segment yields `NotExists`; a
    /// malformed `data` yields `DataUnmarshalError` only when the path
    /// actually descends into `data`.
    pub fn get_field_by_path(&self, path: &[&str]) -> Result<FieldValue> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(FieldValue::NotExists);
        };

        match *head {
            "id" => Ok(scalar_if_leaf(rest, self.event.id.to_string())),
            "source" => Ok(scalar_if_leaf(rest, self.event.source.clone())),
            "type" => Ok(scalar_if_leaf(rest, self.event.ty.clone())),
            "subject" => Ok(scalar_if_leaf(rest, self.event.subject.clone())),
            "time" => Ok(scalar_if_leaf(rest, self.event.time.to_rfc3339())),
            "datacontenttype" => Ok(scalar_if_leaf(rest, self.event.datacontenttype.clone())),
            "data" => {
                let root = self.parsed_data()?;
                Ok(descend(root, rest))
            }
            _ => Ok(FieldValue::NotExists),
        }
    }
}

fn scalar_if_leaf(rest: &[&str], value: String) -> FieldValue {
    if rest.is_empty() {
        FieldValue::Value(Value::String(value))
    } else {
        // Scalars have no children; any further segment does not exist.
        FieldValue::NotExists
    }
}

fn descend(root: &Value, path: &[&str]) -> FieldValue {
    let mut current = root;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return FieldValue::NotExists,
        }
    }
    FieldValue::Value(current.clone())
}

fn string_to_json_error(msg: &str) -> serde_json::Error {
    // serde_json::Error cannot be constructed from a plain string outside
    // the crate; re-deriving one from a guaranteed-invalid literal lets the
    // cached message still travel inside `DataUnmarshalError` without
    // cloning serde_json::Error (which is not Clone).
    match serde_json::from_str::<Value>(msg) {
        Ok(_) => unreachable!("cached error messages are never valid JSON"),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with_data(data: &str) -> Envelope {
        Envelope::new(
            Event {
                id: 123,
                source: "src".into(),
                ty: "ty".into(),
                subject: "subj".into(),
                time: Utc::now(),
                datacontenttype: "application/json".into(),
                data: data.to_string(),
            },
            "bus",
        )
    }

    #[test]
    fn id_resolves_to_its_string_form() {
        let e = envelope_with_data(r#"{"a":1,"b":{"c":2}}"#);
        let val = e.get_field_by_path(&["id"]).unwrap();
        assert_eq!(val, FieldValue::Value(Value::String("123".into())));
    }

    #[test]
    fn nested_data_paths_resolve() {
        let e = envelope_with_data(r#"{"a":1,"b":{"c":2}}"#);
        assert_eq!(
            e.get_field_by_path(&["data", "a"]).unwrap(),
            FieldValue::Value(Value::from(1.0))
        );
        assert_eq!(
            e.get_field_by_path(&["data", "b", "c"]).unwrap(),
            FieldValue::Value(Value::from(2.0))
        );
        assert_eq!(
            e.get_field_by_path(&["data", "b"]).unwrap(),
            FieldValue::Value(serde_json::json!({"c": 2.0}))
        );
    }

    #[test]
    fn missing_segments_yield_not_exists_sentinel_not_an_error() {
        let e = envelope_with_data(r#"{"a":1,"b":{"c":2}}"#);
        assert!(e.get_field_by_path(&["faker"]).unwrap().is_not_exists());
        assert!(e
            .get_field_by_path(&["data", "f"])
            .unwrap()
            .is_not_exists());
        assert!(e
            .get_field_by_path(&["data", "b", "f"])
            .unwrap()
            .is_not_exists());
        assert!(e
            .get_field_by_path(&["faker", "b", "c"])
            .unwrap()
            .is_not_exists());
    }

    #[test]
    fn malformed_data_surfaces_as_data_unmarshal_error_only_when_descended() {
        let e = envelope_with_data(r#"{"a":1,"b":{"c":2}}a"#);
        assert!(e.get_field_by_path(&["data"]).unwrap_err().is_data_unmarshal());
        assert!(e
            .get_field_by_path(&["data", "a"])
            .unwrap_err()
            .is_data_unmarshal());
    }

    #[test]
    fn data_parse_is_cached_across_repeated_lookups() {
        let e = envelope_with_data(r#"{"a":1}"#);
        assert!(e.get_field_by_path(&["data", "a"]).is_ok());
        // Second lookup reuses the OnceLock rather than reparsing.
        assert!(e.get_field_by_path(&["data", "a"]).is_ok());
    }

    #[test]
    fn deep_clone_does_not_share_the_parse_cache() {
        let e = envelope_with_data(r#"{"a":1}"#);
        e.get_field_by_path(&["data", "a"]).unwrap();
        let cloned = e.deep_clone();
        assert!(cloned.parsed_data.get().is_none());
        assert_eq!(
            cloned.get_field_by_path(&["data", "a"]).unwrap(),
            FieldValue::Value(Value::from(1.0))
        );
    }

    #[test]
    fn key_is_the_string_form_of_the_id() {
        let e = envelope_with_data("{}");
        assert_eq!(e.key(), "123");
    }

    #[test]
    fn value_then_deserialize_round_trips_every_field() {
        let mut e = envelope_with_data(r#"{"a":1,"b":{"c":2}}"#);
        e.bus_name = "Default".into();
        e.retry_strategy = RetryStrategy::Backoff;
        e.target_id = 7;
        e.rule_name = "r1".into();
        e.metadata.insert("traceparent".into(), "00-abc-def-01".into());

        let bytes = e.value().unwrap();
        let roundtripped: Envelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(roundtripped.event, e.event);
        assert_eq!(roundtripped.bus_name, e.bus_name);
        assert_eq!(roundtripped.retry_strategy, e.retry_strategy);
        assert_eq!(roundtripped.target_id, e.target_id);
        assert_eq!(roundtripped.rule_name, e.rule_name);
        assert_eq!(roundtripped.metadata, e.metadata);
        // The parse cache is never serialized; both sides start empty.
        assert!(roundtripped.parsed_data.get().is_none());
    }
}
