// Copyright 2025 Cowboy AI, LLC.

//! # EventBridge
//!
//! A horizontally-scaled event-routing fabric: event sources publish onto
//! named buses, rules filter and transform matching events, and dispatchers
//! deliver the transformed result to HTTP, gRPC, or no-op sinks.
//!
//! The crate is organized around the pipeline stages of one event's
//! lifecycle:
//! - [`event`]: the canonical envelope and its JSON-data field accessor
//!   (component A)
//! - [`rule`]: pattern matching (component B), parameter transforms
//!   (component C), dispatcher drivers (component D), and the per-rule
//!   executor that ties them together (component E)
//! - [`informer`]: the generic reflector/watch-loop plus retry-queue
//!   machinery shared by the control-plane watchers (component F)
//! - [`bus`]: the MQ-backed bus abstraction events are published onto and
//!   consumed from (component G)
//! - [`persistence`]: the relational store backing buses, rules, and
//!   dispatcher schemas, plus the two control-plane reflectors
//! - [`event_repo`]: the orchestrator that wires a source event through
//!   matching, transforming, and dispatching (component H)
//! - [`config`], [`metrics`], [`telemetry`]: ambient runtime scaffolding

#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod errors;
pub mod event;
pub mod event_repo;
pub mod informer;
pub mod metrics;
pub mod persistence;
pub mod rule;
pub mod telemetry;

pub use errors::{EventBridgeError, Result};
pub use event::{Envelope, Event, FieldValue, RetryStrategy};
pub use rule::{Rule, RuleStatus, Target, TargetForm, TargetId, TargetParam};
