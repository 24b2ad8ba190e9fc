// Copyright 2025 Cowboy AI, LLC.

//! Error taxonomy for the EventBridge job runtime.
//!
//! Every failure mode the core can produce is a variant of [`EventBridgeError`],
//! never a bare string. Callers branch on variant identity via the predicate
//! helpers below, not on `.to_string()` contents.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EventBridgeError>;

/// The error taxonomy described in the design's error-handling section.
#[derive(Debug, Error)]
pub enum EventBridgeError {
    /// The reflector was closed; this is a control signal that terminates an
    /// informer watch loop cleanly, not a failure.
    #[error("reflector closed")]
    ReflectorClosed,

    /// An event's `Data` field is not valid JSON.
    #[error("event data is not valid JSON: {0}")]
    DataUnmarshalError(#[source] serde_json::Error),

    /// No matcher is compiled for this rule; a configuration gap, not a hard error.
    #[error("no matcher compiled for rule {rule}")]
    NoMatcher {
        /// The rule name missing a compiled matcher.
        rule: String,
    },

    /// No transformer is compiled for this target; a configuration gap.
    #[error("no transformer compiled for target {target_id} of rule {rule}")]
    NoTransformer {
        /// The owning rule name.
        rule: String,
        /// The target id missing a compiled transformer.
        target_id: u64,
    },

    /// No dispatcher is registered for this target id.
    #[error("no dispatcher registered for target {target_id}")]
    NoDispatcher {
        /// The target id missing a dispatcher.
        target_id: u64,
    },

    /// A pattern spec failed to compile.
    #[error("pattern syntax error: {0}")]
    PatternSyntaxError(String),

    /// A target parameter template failed to compile.
    #[error("target parameter syntax error: {0}")]
    TargetParamSyntaxError(String),

    /// A dispatcher's registered JSON schema failed to compile.
    #[error("dispatcher schema syntax error: {0}")]
    SchemaSyntaxError(String),

    /// Two buses were registered with the same name.
    #[error("bus name repeated: {0}")]
    BusNameRepeat(String),

    /// Two rules of the same bus were registered with the same name.
    #[error("rule name repeated: {bus_name}/{rule_name}")]
    RuleNameRepeat {
        /// Owning bus name.
        bus_name: String,
        /// Repeated rule name.
        rule_name: String,
    },

    /// Two rules declared the same (source, type) uniqueness key.
    #[error("source/type repeated: {0}/{1}")]
    SourceTypeRepeat(String, String),

    /// An envelope referenced a bus that is not bound.
    #[error("bus not found: {0}")]
    DataBusNotFound(String),

    /// A retry-path envelope referenced a rule that no longer exists.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// A dispatcher referenced a schema that is not registered.
    #[error("schema not found for target type {0}")]
    SchemaNotFound(String),

    /// The bus binding was removed while an operation against it was in flight.
    #[error("bus removed: {0}")]
    DataBusRemoved(String),

    /// A JSON-schema validation failure for dispatcher parameters.
    #[error("dispatcher parameter validation failed: {0}")]
    SchemaValidation(String),

    /// An HTTP transport failure from the HTTP dispatcher driver.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// An HTTP dispatch that completed but carried a non-2xx status.
    #[error("http dispatch returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code returned.
        status: u16,
        /// The response body, for diagnostics.
        body: String,
    },

    /// A gRPC transport failure from the gRPC dispatcher driver.
    #[error("grpc transport error: {0}")]
    Grpc(#[from] tonic::Status),

    /// A gRPC channel failed to connect.
    #[error("grpc connection error: {0}")]
    GrpcConnect(#[from] tonic::transport::Error),

    /// A relational-store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A migration failed to apply.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The MQ substrate returned an error.
    #[error("mq error: {0}")]
    Mq(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// A rule executor's `Update` exceeded its deadline (§5, default 5s).
    #[error("rule executor update for {rule} timed out")]
    ExecutorUpdateTimeout {
        /// The rule whose update was abandoned.
        rule: String,
    },

    /// A generic internal invariant violation; used sparingly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EventBridgeError {
    /// True for the [`EventBridgeError::ReflectorClosed`] control signal.
    pub fn is_reflector_closed(&self) -> bool {
        matches!(self, EventBridgeError::ReflectorClosed)
    }

    /// True for executor configuration gaps (`NoMatcher`/`NoTransformer`/`NoDispatcher`),
    /// which are soft-skipped on the source-event path and fatal on the retry path.
    pub fn is_config_gap(&self) -> bool {
        matches!(
            self,
            EventBridgeError::NoMatcher { .. }
                | EventBridgeError::NoTransformer { .. }
                | EventBridgeError::NoDispatcher { .. }
        )
    }

    /// True for malformed event data, which is logged and treated as non-match,
    /// never fatal.
    pub fn is_data_unmarshal(&self) -> bool {
        matches!(self, EventBridgeError::DataUnmarshalError(_))
    }

    /// True for control-plane domain errors surfaced through the repositories.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EventBridgeError::DataBusNotFound(_)
                | EventBridgeError::RuleNotFound(_)
                | EventBridgeError::SchemaNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflector_closed_is_a_control_signal_not_a_config_gap() {
        let err = EventBridgeError::ReflectorClosed;
        assert!(err.is_reflector_closed());
        assert!(!err.is_config_gap());
    }

    #[test]
    fn config_gaps_are_distinguished_from_not_found() {
        let no_matcher = EventBridgeError::NoMatcher {
            rule: "r1".into(),
        };
        assert!(no_matcher.is_config_gap());
        assert!(!no_matcher.is_not_found());

        let not_found = EventBridgeError::RuleNotFound("r1".into());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_config_gap());
    }

    #[test]
    fn display_messages_carry_identifying_context() {
        let err = EventBridgeError::NoDispatcher { target_id: 42 };
        assert_eq!(err.to_string(), "no dispatcher registered for target 42");
    }

    #[test]
    fn data_unmarshal_wraps_the_source_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = EventBridgeError::DataUnmarshalError(json_err);
        assert!(err.is_data_unmarshal());
    }
}
