// Copyright 2025 Cowboy AI, LLC.

//! Tracing subscriber bootstrap (§11) plus the W3C `traceparent` carrier
//! stamped into an envelope's `metadata` map, the propagation mechanism for
//! request-scoped spans across a bus hop.

use std::collections::HashMap;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crate::config::LoggingConfig;
use crate::errors::{EventBridgeError, Result};

const TRACEPARENT_KEY: &str = "traceparent";

/// Install the global `tracing` subscriber: an `EnvFilter` seeded from
/// `RUST_LOG`, falling back to `config.level`, composed with a JSON or text
/// formatting layer per `config.format`. Call once at process start.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| EventBridgeError::Config(format!("installing tracing subscriber: {e}")))
}

/// A parsed `traceparent` header: `00-{trace_id}-{parent_id}-{flags}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub parent_id: String,
}

/// 16 lowercase hex characters from a fresh v4 UUID's first 8 bytes.
fn random_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

impl TraceContext {
    /// A fresh root context: a random 16-byte trace id and 8-byte span id,
    /// both drawn from the teacher's own `uuid` v4 generator rather than a
    /// hand-rolled RNG fill.
    pub fn new_root() -> Self {
        TraceContext {
            trace_id: Uuid::new_v4().simple().to_string(),
            parent_id: random_span_id(),
        }
    }

    /// A child context sharing `self`'s trace id with a freshly generated
    /// span id, for the next hop in the propagation chain.
    pub fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            parent_id: random_span_id(),
        }
    }

    /// Render as a W3C `traceparent` header value.
    pub fn to_header(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.parent_id)
    }

    /// Parse a `00-{trace_id}-{parent_id}-{flags}` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let _flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version != "00" || trace_id.len() != 32 || parent_id.len() != 16 {
            return None;
        }
        if !trace_id.bytes().all(|b| b.is_ascii_hexdigit()) || !parent_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(TraceContext {
            trace_id: trace_id.to_string(),
            parent_id: parent_id.to_string(),
        })
    }
}

/// Stamp `ctx` into `metadata` under the `traceparent` key, overwriting any
/// existing value.
pub fn inject(metadata: &mut HashMap<String, String>, ctx: &TraceContext) {
    metadata.insert(TRACEPARENT_KEY.to_string(), ctx.to_header());
}

/// Recover a [`TraceContext`] from `metadata`'s `traceparent` entry, if
/// present and well-formed.
pub fn extract(metadata: &HashMap<String, String>) -> Option<TraceContext> {
    metadata.get(TRACEPARENT_KEY).and_then(|h| TraceContext::parse(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_header_string() {
        let ctx = TraceContext::new_root();
        let header = ctx.to_header();
        let parsed = TraceContext::parse(&header).unwrap();
        assert_eq!(ctx, parsed);
    }

    #[test]
    fn child_keeps_trace_id_and_changes_span_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.parent_id, child.parent_id);
    }

    #[test]
    fn inject_then_extract_round_trips_through_metadata() {
        let mut metadata = HashMap::new();
        let ctx = TraceContext::new_root();
        inject(&mut metadata, &ctx);
        assert_eq!(extract(&metadata), Some(ctx));
    }

    #[test]
    fn malformed_header_fails_to_parse() {
        assert!(TraceContext::parse("not-a-traceparent").is_none());
        assert!(TraceContext::parse("00-shorttrace-alsoshort-01").is_none());
    }

    #[test]
    fn missing_metadata_key_extracts_to_none() {
        assert_eq!(extract(&HashMap::new()), None);
    }
}
