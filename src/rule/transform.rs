// Copyright 2025 Cowboy AI, LLC.

//! The event-path parameter template engine (component C): compiles each
//! target parameter into a CONSTANT, JSONPATH, or TEMPLATE transform
//! function, and renders a target's full output `Data` from an envelope.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::errors::{EventBridgeError, Result};
use crate::event::Envelope;
use crate::rule::{Target, TargetForm};

/// A compiled single-parameter transform function.
pub type TransformFn = Arc<dyn Fn(&Envelope) -> Result<Value> + Send + Sync>;

/// Compiles a target's parameter list into a function that renders the
/// target's transformed output from a (cloned) envelope.
#[derive(Clone)]
pub struct Transformer {
    /// `key -> compiled fn`, iteration order irrelevant (the output is a
    /// JSON object).
    functions: Vec<(String, TransformFn)>,
}

impl Transformer {
    /// Compile `target`'s parameters into a [`Transformer`].
    pub fn compile(target: &Target) -> Result<Self> {
        let mut functions = Vec::with_capacity(target.params.len());
        for param in &target.params {
            let fc = match param.form {
                TargetForm::Constant => new_constant(&param.value),
                TargetForm::Jsonpath => new_jsonpath(&param.value),
                TargetForm::Template => new_template(&param.value, param.template.as_deref())?,
            };
            functions.push((param.key.clone(), fc));
        }
        Ok(Transformer { functions })
    }

    /// Render this target's transformed event data from `envelope`. The
    /// envelope must already be an independent clone (see
    /// [`Envelope::deep_clone`]) so that parallel transformers never share
    /// the lazily-initialized `data` parse cache.
    ///
    /// If the target has zero parameters, the entire original event
    /// (serialized) is returned as the output data. Otherwise the output is
    /// a JSON object mapping `key -> compiled-fn(envelope)`.
    pub fn transform(&self, envelope: &Envelope) -> Result<String> {
        if self.functions.is_empty() {
            return serde_json::to_string(&envelope.event).map_err(EventBridgeError::DataUnmarshalError);
        }
        let mut out = IndexMap::with_capacity(self.functions.len());
        for (key, fc) in &self.functions {
            let val = fc(envelope)?;
            out.insert(key.clone(), val);
        }
        serde_json::to_string(&out).map_err(EventBridgeError::DataUnmarshalError)
    }
}

fn new_constant(value: &str) -> TransformFn {
    let value = value.to_string();
    Arc::new(move |_env: &Envelope| Ok(Value::String(value.clone())))
}

fn jsonpath_segments(value: &str) -> Vec<String> {
    let mut segments: Vec<String> = value.split('.').map(str::to_string).collect();
    if segments.first().map(String::as_str) == Some("$") {
        segments.remove(0);
    }
    segments
}

fn new_jsonpath(value: &str) -> TransformFn {
    let segments = jsonpath_segments(value);
    Arc::new(move |env: &Envelope| {
        let borrowed: Vec<&str> = segments.iter().map(String::as_str).collect();
        let field = env.get_field_by_path(&borrowed)?;
        Ok(match field {
            crate::event::FieldValue::NotExists => Value::Null,
            crate::event::FieldValue::Value(v) => v,
        })
    })
}

enum TemplateSegment {
    Literal(String),
    Placeholder { fetch: TransformFn },
}

fn new_template(value: &str, tmpl: Option<&str>) -> Result<TransformFn> {
    let Some(tmpl) = tmpl.filter(|t| !t.is_empty()) else {
        return Ok(Arc::new(|_env: &Envelope| Ok(Value::Null)));
    };

    let mut fetcher: std::collections::HashMap<String, TransformFn> = std::collections::HashMap::new();
    if !value.is_empty() {
        let values: serde_json::Map<String, Value> = serde_json::from_str(value)
            .map_err(|e| EventBridgeError::TargetParamSyntaxError(format!("template value is not valid JSON: {e}")))?;
        for (key, val) in values {
            let trimmed_key = key.trim().to_string();
            let jsonpath = val.as_str().ok_or_else(|| {
                EventBridgeError::TargetParamSyntaxError(format!(
                    "transformer(TEMPLATE) value.{trimmed_key} should be a string"
                ))
            })?;
            fetcher.insert(trimmed_key, new_jsonpath(jsonpath));
        }
    }

    let bytes = tmpl.as_bytes();
    let len = bytes.len();
    let mut segments = Vec::new();
    let mut check = String::new();
    let mut start = 0usize;
    let mut end = 0usize;
    while end < len {
        if bytes[end] == b'$' && end + 1 < len && bytes[end + 1] == b'{' {
            if end > start {
                let literal = &tmpl[start..end];
                segments.push(TemplateSegment::Literal(literal.to_string()));
                check.push_str(literal);
            }
            let rest = &tmpl[end..];
            let var_end_idx = rest.find('}').ok_or_else(|| {
                EventBridgeError::TargetParamSyntaxError(
                    "template variables that start with ${ must have an } at the end".into(),
                )
            })?;
            let var_str = &tmpl[end..end + var_end_idx];
            let var_name = var_str.trim_start_matches("${").trim().to_string();
            let fetch = fetcher.get(&var_name).cloned().ok_or_else(|| {
                EventBridgeError::TargetParamSyntaxError(format!("template variable(key={var_name}) not found"))
            })?;
            segments.push(TemplateSegment::Placeholder { fetch });
            if end == 0 || bytes[end - 1] != b'"' {
                check.push('1');
            } else {
                check.push_str(var_str);
                check.push('}');
            }
            end += var_end_idx;
            start = end + 1;
        }
        end += 1;
    }
    if len > start {
        let tail = &tmpl[start..len];
        segments.push(TemplateSegment::Literal(tail.to_string()));
        check.push_str(tail);
    }

    serde_json::from_str::<Value>(&check)
        .map_err(|e| EventBridgeError::TargetParamSyntaxError(format!("template syntax error: {e}")))?;

    Ok(Arc::new(move |env: &Envelope| {
        let mut rendered = String::new();
        for segment in &segments {
            match segment {
                TemplateSegment::Literal(text) => rendered.push_str(text),
                TemplateSegment::Placeholder { fetch } => {
                    let val = fetch(env)?;
                    match val {
                        Value::String(s) => rendered.push_str(&s),
                        Value::Null => rendered.push_str("null"),
                        other => {
                            let marshalled =
                                serde_json::to_string(&other).map_err(EventBridgeError::DataUnmarshalError)?;
                            rendered.push_str(&marshalled);
                        }
                    }
                }
            }
        }
        serde_json::from_str(&rendered).map_err(EventBridgeError::DataUnmarshalError)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::rule::{TargetParam, TargetId};
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

    fn target_with_params(params: Vec<TargetParam>) -> Target {
        Target {
            id: TargetId(1),
            ty: "http".into(),
            params,
            retry_strategy: None,
        }
    }

    #[test]
    fn zero_params_returns_the_original_event_serialized() {
        let target = target_with_params(vec![]);
        let transformer = Transformer::compile(&target).unwrap();
        let env = envelope_with_data(r#"{"a":1}"#);
        let out = transformer.transform(&env).unwrap();
        let expected = serde_json::to_string(&env.event).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn nested_json_template_inserts_array_verbatim() {
        let target = target_with_params(vec![TargetParam {
            key: "body".into(),
            form: TargetForm::Template,
            value: r#"{"name":"$.data.name","ips":"$.data.ips"}"#.into(),
            template: Some(r#"{"name":"${name}","ips":${ips}}"#.into()),
        }]);
        let transformer = Transformer::compile(&target).unwrap();
        let env = envelope_with_data(r#"{"name":"t","ips":[{"host":"1.2.3.4","port":"80"}]}"#);
        let out = transformer.transform(&env).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let body: Value = serde_json::from_str(parsed["body"].as_str().unwrap_or(&parsed["body"].to_string()))
            .unwrap_or_else(|_| parsed["body"].clone());
        let expected: Value =
            serde_json::from_str(r#"{"name":"t","ips":[{"host":"1.2.3.4","port":"80"}]}"#).unwrap();
        assert_eq!(body, expected);
    }

    #[test]
    fn text_template_trims_placeholder_name_whitespace() {
        let target = target_with_params(vec![TargetParam {
            key: "msg".into(),
            form: TargetForm::Template,
            value: r#"{"name":"$.data.name","ip":"$.data.source-ip"}"#.into(),
            template: Some(r#""i am ${name}, ip ${  ip  }.""#.into()),
        }]);
        let transformer = Transformer::compile(&target).unwrap();
        let env = envelope_with_data(r#"{"name":"t1","source-ip":"10.0.0.1"}"#);
        let out = transformer.transform(&env).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["msg"], Value::String("i am t1, ip 10.0.0.1.".into()));
    }

    #[test]
    fn missing_template_yields_null() {
        let target = target_with_params(vec![TargetParam {
            key: "x".into(),
            form: TargetForm::Template,
            value: String::new(),
            template: None,
        }]);
        let transformer = Transformer::compile(&target).unwrap();
        let env = envelope_with_data("{}");
        let out = transformer.transform(&env).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["x"], Value::Null);
    }

    #[test]
    fn missing_closing_brace_is_a_compile_error() {
        let target = target_with_params(vec![TargetParam {
            key: "x".into(),
            form: TargetForm::Template,
            value: r#"{"a":"$.data.a"}"#.into(),
            template: Some("${a".into()),
        }]);
        assert!(Transformer::compile(&target).is_err());
    }

    #[test]
    fn jsonpath_strips_leading_dollar_segment() {
        let fc = new_jsonpath("$.data.a");
        let env = envelope_with_data(r#"{"a":7}"#);
        assert_eq!(fc(&env).unwrap(), Value::from(7.0));
    }

    #[test]
    fn jsonpath_missing_value_is_null() {
        let fc = new_jsonpath("$.data.missing");
        let env = envelope_with_data("{}");
        assert_eq!(fc(&env).unwrap(), Value::Null);
    }
}
