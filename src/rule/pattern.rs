// Copyright 2025 Cowboy AI, LLC.

//! The rule-pattern matcher (component B): compiles a filter-pattern JSON
//! object into a predicate tree, then evaluates it against an envelope.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use serde_json::Value;
use tracing::error;

use crate::errors::{EventBridgeError, Result};
use crate::event::{Envelope, FieldValue};

/// A compiled match function over a single field value, as produced by a
/// registered match-function kind (`prefix`, `numeric`, …).
pub type MatchFn = Arc<dyn Fn(&FieldValue) -> Result<bool> + Send + Sync>;

/// Compiles a match-function kind's spec into a [`MatchFn`]. Receives the
/// registry so recursive kinds (`anything-but`) can resolve nested kinds.
pub type MatchFactory = Arc<dyn Fn(&Value, &MatchRegistry) -> Result<MatchFn> + Send + Sync>;

/// The fixed-at-process-start table of match-function kinds. Registration
/// is explicit (`register`) rather than implicit-init-order dependent, per
/// the design's note on dynamic driver/match-function tables.
#[derive(Clone)]
pub struct MatchRegistry {
    factories: std::collections::HashMap<String, MatchFactory>,
}

impl MatchRegistry {
    /// An empty registry with no match-function kinds registered.
    pub fn new() -> Self {
        MatchRegistry {
            factories: std::collections::HashMap::new(),
        }
    }

    /// The registry populated with the six built-in match-function kinds.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("prefix", Arc::new(new_prefix));
        reg.register("suffix", Arc::new(new_suffix));
        reg.register("cidr", Arc::new(new_cidr));
        reg.register("numeric", Arc::new(new_numeric));
        reg.register("exists", Arc::new(new_exists));
        reg.register("anything-but", Arc::new(new_anything_but));
        reg
    }

    /// Register a match-function kind. Must be called before the first
    /// [`Matcher::compile`]; not safe to call concurrently with a compile.
    pub fn register(&mut self, name: &str, factory: MatchFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    fn compile_named(&self, name: &str, spec: &Value) -> Result<MatchFn> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EventBridgeError::PatternSyntaxError(format!("unknown match func(name={name})")))?;
        factory(spec, self)
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

type EventMatchFn = Arc<dyn Fn(&Envelope) -> Result<bool> + Send + Sync>;

/// A compiled predicate tree over a filter pattern. Compile once, match
/// many; owns only an immutable capture of the spec (no back-references to
/// the original JSON object).
#[derive(Clone)]
pub struct Matcher {
    eval: EventMatchFn,
}

impl Matcher {
    /// Compile a filter-pattern JSON object into a [`Matcher`]. An empty
    /// top-level object compiles to a matcher that always returns `false`.
    pub fn compile(filter_pattern: &Value, registry: &MatchRegistry) -> Result<Self> {
        let is_empty = matches!(filter_pattern, Value::Object(m) if m.is_empty());
        if is_empty {
            return Ok(Matcher {
                eval: Arc::new(|_env| Ok(false)),
            });
        }
        let eval = parse_pattern(Vec::new(), filter_pattern, registry)?;
        Ok(Matcher { eval })
    }

    /// Evaluate the compiled pattern against `envelope`.
    pub fn matches(&self, envelope: &Envelope) -> Result<bool> {
        (self.eval)(envelope)
    }
}

fn fetch(envelope: &Envelope, path: &[String]) -> Result<FieldValue> {
    let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
    match envelope.get_field_by_path(&borrowed) {
        Ok(v) => Ok(v),
        Err(e) if e.is_data_unmarshal() => {
            error!(error = %e, "event data unmarshal error during pattern evaluation");
            Ok(FieldValue::NotExists)
        }
        Err(e) => Err(e),
    }
}

fn field_value_as_json(v: &FieldValue) -> Option<&Value> {
    match v {
        FieldValue::NotExists => None,
        FieldValue::Value(val) => Some(val),
    }
}

fn parse_pattern(root_path: Vec<String>, pattern: &Value, registry: &MatchRegistry) -> Result<EventMatchFn> {
    match pattern {
        Value::String(_) | Value::Number(_) => {
            let expected = pattern.clone();
            Ok(Arc::new(move |env: &Envelope| {
                let val = fetch(env, &root_path)?;
                Ok(field_value_as_json(&val) == Some(&expected))
            }))
        }
        Value::Array(items) => {
            let mut value_set: Vec<Value> = Vec::new();
            let mut or_groups: Vec<Vec<MatchFn>> = Vec::new();
            for item in items {
                match item {
                    Value::Object(pattern_map) => {
                        let mut and_group = Vec::with_capacity(pattern_map.len());
                        for (name, spec) in pattern_map {
                            and_group.push(registry.compile_named(name, spec)?);
                        }
                        or_groups.push(and_group);
                    }
                    scalar => value_set.push(scalar.clone()),
                }
            }
            Ok(Arc::new(move |env: &Envelope| {
                let val = fetch(env, &root_path)?;
                let json = field_value_as_json(&val);

                if let Some(Value::Array(elements)) = json {
                    if elements.iter().any(|v| value_set.contains(v)) {
                        return Ok(true);
                    }
                } else if let Some(v) = json {
                    if value_set.contains(v) {
                        return Ok(true);
                    }
                }

                for and_group in &or_groups {
                    if and_group.is_empty() {
                        continue;
                    }
                    let mut all_match = true;
                    for fc in and_group {
                        if !fc(&val)? {
                            all_match = false;
                            break;
                        }
                    }
                    if all_match {
                        return Ok(true);
                    }
                }
                Ok(false)
            }))
        }
        Value::Object(map) => {
            let mut fcs = Vec::with_capacity(map.len());
            for (key, val) in map {
                let mut path = root_path.clone();
                path.push(key.clone());
                fcs.push(parse_pattern(path, val, registry)?);
            }
            Ok(Arc::new(move |env: &Envelope| {
                for fc in &fcs {
                    if !fc(env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }))
        }
        other => Err(EventBridgeError::PatternSyntaxError(format!(
            "unexpected pattern node: {other}"
        ))),
    }
}

fn new_prefix(spec: &Value, _registry: &MatchRegistry) -> Result<MatchFn> {
    let prefix = spec
        .as_str()
        .ok_or_else(|| EventBridgeError::PatternSyntaxError("prefix spec should be a string".into()))?
        .to_string();
    Ok(Arc::new(move |val: &FieldValue| {
        Ok(matches!(val, FieldValue::Value(Value::String(s)) if s.starts_with(&prefix)))
    }))
}

fn new_suffix(spec: &Value, _registry: &MatchRegistry) -> Result<MatchFn> {
    let suffix = spec
        .as_str()
        .ok_or_else(|| EventBridgeError::PatternSyntaxError("suffix spec should be a string".into()))?
        .to_string();
    Ok(Arc::new(move |val: &FieldValue| {
        Ok(matches!(val, FieldValue::Value(Value::String(s)) if s.ends_with(&suffix)))
    }))
}

fn new_cidr(spec: &Value, _registry: &MatchRegistry) -> Result<MatchFn> {
    let cidr_text = spec
        .as_str()
        .ok_or_else(|| EventBridgeError::PatternSyntaxError("cidr spec should be a string".into()))?;
    let network = IpNetwork::from_str(cidr_text)
        .map_err(|e| EventBridgeError::PatternSyntaxError(format!("invalid cidr {cidr_text}: {e}")))?;
    Ok(Arc::new(move |val: &FieldValue| {
        let FieldValue::Value(Value::String(ip_str)) = val else {
            return Ok(false);
        };
        match IpAddr::from_str(ip_str) {
            Ok(ip) => Ok(network.contains(ip)),
            Err(_) => {
                error!(ip = %ip_str, "value is not a valid IP address for cidr match");
                Ok(false)
            }
        }
    }))
}

#[derive(Clone, Copy)]
enum NumericOp {
    Gt,
    Ge,
    Eq,
    Lt,
    Le,
}

fn new_numeric(spec: &Value, _registry: &MatchRegistry) -> Result<MatchFn> {
    let items = spec
        .as_array()
        .ok_or_else(|| EventBridgeError::PatternSyntaxError("numeric spec should be an array".into()))?;

    if items.len() < 2 {
        return Ok(Arc::new(|_val: &FieldValue| Ok(false)));
    }

    let mut comparators: Vec<(NumericOp, f64)> = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
        let [op, num] = pair else {
            break;
        };
        let op_str = op
            .as_str()
            .ok_or_else(|| EventBridgeError::PatternSyntaxError("numeric operator should be a string".into()))?;
        let num_val = num
            .as_f64()
            .ok_or_else(|| EventBridgeError::PatternSyntaxError("numeric spec should compare against a number".into()))?;
        let parsed_op = match op_str {
            ">" => NumericOp::Gt,
            ">=" => NumericOp::Ge,
            "=" => NumericOp::Eq,
            "<" => NumericOp::Lt,
            "<=" => NumericOp::Le,
            other => {
                return Err(EventBridgeError::PatternSyntaxError(format!(
                    "unknown comparison operator {other}"
                )))
            }
        };
        comparators.push((parsed_op, num_val));
    }

    Ok(Arc::new(move |val: &FieldValue| {
        let FieldValue::Value(Value::Number(n)) = val else {
            return Ok(false);
        };
        let Some(float_val) = n.as_f64() else {
            return Ok(false);
        };
        for (op, num) in &comparators {
            let ok = match op {
                NumericOp::Gt => float_val > *num,
                NumericOp::Ge => float_val >= *num,
                NumericOp::Eq => float_val == *num,
                NumericOp::Lt => float_val < *num,
                NumericOp::Le => float_val <= *num,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }))
}

fn new_exists(spec: &Value, _registry: &MatchRegistry) -> Result<MatchFn> {
    let want_exists = spec
        .as_bool()
        .ok_or_else(|| EventBridgeError::PatternSyntaxError("exists spec should be a bool".into()))?;
    Ok(Arc::new(move |val: &FieldValue| {
        Ok(val.is_not_exists() != want_exists)
    }))
}

fn new_anything_but(spec: &Value, registry: &MatchRegistry) -> Result<MatchFn> {
    match spec {
        Value::String(_) | Value::Number(_) => {
            let excluded = spec.clone();
            Ok(Arc::new(move |val: &FieldValue| {
                Ok(field_value_as_json(val) != Some(&excluded))
            }))
        }
        Value::Array(items) => {
            let mut value_set: Vec<Value> = Vec::new();
            let mut groups: Vec<(String, Vec<MatchFn>)> = Vec::new();
            for item in items {
                match item {
                    Value::Object(pattern_map) => {
                        for (name, s) in pattern_map {
                            let fc = registry.compile_named(name, s)?;
                            match groups.iter_mut().find(|(n, _)| n == name) {
                                Some((_, fcs)) => fcs.push(fc),
                                None => groups.push((name.clone(), vec![fc])),
                            }
                        }
                    }
                    scalar => value_set.push(scalar.clone()),
                }
            }
            Ok(Arc::new(move |val: &FieldValue| {
                anything_but_eval(val, &value_set, &groups)
            }))
        }
        Value::Object(map) => {
            if map.is_empty() {
                return Ok(Arc::new(|_val: &FieldValue| Ok(true)));
            }
            let mut groups: Vec<(String, Vec<MatchFn>)> = Vec::new();
            for (name, s) in map {
                let fc = registry.compile_named(name, s)?;
                match groups.iter_mut().find(|(n, _)| n == name) {
                    Some((_, fcs)) => fcs.push(fc),
                    None => groups.push((name.clone(), vec![fc])),
                }
            }
            Ok(Arc::new(move |val: &FieldValue| anything_but_eval(val, &[], &groups)))
        }
        other => Err(EventBridgeError::PatternSyntaxError(format!(
            "anything-but unexpected pattern: {other}"
        ))),
    }
}

fn anything_but_eval(val: &FieldValue, value_set: &[Value], groups: &[(String, Vec<MatchFn>)]) -> Result<bool> {
    let json = field_value_as_json(val);
    if let Some(Value::Array(elements)) = json {
        if elements.iter().any(|v| value_set.contains(v)) {
            return Ok(false);
        }
    } else if let Some(v) = json {
        if value_set.contains(v) {
            return Ok(false);
        }
    }

    if groups.is_empty() {
        return Ok(true);
    }

    for (_, fcs) in groups {
        let mut any_matched = false;
        for fc in fcs {
            if fc(val)? {
                any_matched = true;
                break;
            }
        }
        if !any_matched {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use chrono::Utc;

    fn envelope_with_data(data: &str) -> Envelope {
        Envelope::new(
            Event {
                id: 1,
                source: "b".into(),
                ty: "created".into(),
                subject: String::new(),
                time: Utc::now(),
                datacontenttype: "application/json".into(),
                data: data.to_string(),
            },
            "bus",
        )
    }

    fn compile(pattern: &str) -> Matcher {
        let registry = MatchRegistry::with_builtins();
        let spec: Value = serde_json::from_str(pattern).unwrap();
        Matcher::compile(&spec, &registry).unwrap()
    }

    #[test]
    fn empty_pattern_never_matches() {
        let m = compile("{}");
        let env = envelope_with_data("{}");
        assert!(!m.matches(&env).unwrap());
    }

    #[test]
    fn numeric_range_is_exclusive_on_lower_bound() {
        let m = compile(r#"{"data":{"count":[{"numeric":[">",0,"<=",5]}]}}"#);
        assert!(m.matches(&envelope_with_data(r#"{"count":3}"#)).unwrap());
        assert!(!m.matches(&envelope_with_data(r#"{"count":6}"#)).unwrap());
        assert!(!m.matches(&envelope_with_data(r#"{"count":0}"#)).unwrap());
    }

    #[test]
    fn anything_but_prefix() {
        let m = compile(r#"{"data":{"name":[{"anything-but":{"prefix":"tes"}}]}}"#);
        assert!(!m.matches(&envelope_with_data(r#"{"name":"test"}"#)).unwrap());
        assert!(m.matches(&envelope_with_data(r#"{"name":"xxx"}"#)).unwrap());
    }

    #[test]
    fn array_membership_on_source() {
        let registry = MatchRegistry::with_builtins();
        let spec: Value = serde_json::from_str(r#"{"source":["a","b","c"]}"#).unwrap();
        let m = Matcher::compile(&spec, &registry).unwrap();

        let mut b = envelope_with_data("{}");
        b.event.source = "b".into();
        assert!(m.matches(&b).unwrap());

        let mut d = envelope_with_data("{}");
        d.event.source = "d".into();
        assert!(!m.matches(&d).unwrap());
    }

    #[test]
    fn cidr_matches_ip_in_network() {
        let m = compile(r#"{"data":{"ip":[{"cidr":"10.0.0.0/8"}]}}"#);
        assert!(m.matches(&envelope_with_data(r#"{"ip":"10.1.2.3"}"#)).unwrap());
        assert!(!m.matches(&envelope_with_data(r#"{"ip":"11.1.2.3"}"#)).unwrap());
    }

    #[test]
    fn exists_true_and_false() {
        let present = compile(r#"{"data":{"a":[{"exists":true}]}}"#);
        assert!(present.matches(&envelope_with_data(r#"{"a":1}"#)).unwrap());
        assert!(!present.matches(&envelope_with_data(r#"{}"#)).unwrap());

        let absent = compile(r#"{"data":{"a":[{"exists":false}]}}"#);
        assert!(absent.matches(&envelope_with_data(r#"{}"#)).unwrap());
        assert!(!absent.matches(&envelope_with_data(r#"{"a":1}"#)).unwrap());
    }

    #[test]
    fn malformed_data_is_logged_and_treated_as_non_match() {
        let m = compile(r#"{"data":{"a":"x"}}"#);
        assert!(!m.matches(&envelope_with_data("not json")).unwrap());
    }
}
