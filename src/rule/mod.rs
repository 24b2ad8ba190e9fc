// Copyright 2025 Cowboy AI, LLC.

//! Rule domain types (component data model) plus the rule executor
//! (component E) that owns a compiled matcher, transformers, and
//! dispatchers for one rule.

pub mod pattern;
pub mod target;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{EventBridgeError, Result};
use crate::event::{Envelope, RetryStrategy};
use pattern::{MatchRegistry, Matcher};
use target::{Dispatcher, DispatcherRegistry};
use transform::Transformer;

/// A rule's enabled/disabled status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    /// The rule is evaluated against incoming events.
    Enable,
    /// The rule is reflected into the store but not evaluated.
    Disable,
}

/// Selects which transform kind a [`TargetParam`] compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetForm {
    /// Returns the literal value string unchanged.
    Constant,
    /// `value` is a dotted JSON path into the envelope.
    Jsonpath,
    /// `value` maps placeholder names to JSONPath strings, substituted into
    /// `template`.
    Template,
}

/// A single parameter of a [`Target`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetParam {
    /// The output object's key for this parameter.
    pub key: String,
    /// Selects the transform kind.
    pub form: TargetForm,
    /// For CONSTANT: the literal. For JSONPATH: the path. For TEMPLATE: the
    /// JSON object of placeholder name -> JSONPath string.
    pub value: String,
    /// Only meaningful for TEMPLATE: the template text containing `${name}`
    /// placeholders.
    pub template: Option<String>,
}

/// A target id, unique within a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u64);

/// A rule target: a sink (type + params) that produces one transformed
/// event per source match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Unique within the owning rule.
    pub id: TargetId,
    /// Selects the dispatcher driver, e.g. `"HTTPDispatcher"`.
    #[serde(rename = "type")]
    pub ty: String,
    /// The target's parameter list.
    pub params: Vec<TargetParam>,
    /// Overrides the rule's retry strategy when set.
    pub retry_strategy: Option<RetryStrategy>,
}

/// A filter pattern plus targets; belongs to one bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique within the owning bus.
    pub name: String,
    /// The owning bus.
    pub bus_name: String,
    /// Enabled rules are evaluated against incoming events.
    pub status: RuleStatus,
    /// A JSON object, compiled by [`pattern::Matcher::compile`].
    pub pattern: String,
    /// This rule's targets.
    pub targets: Vec<Target>,
}

struct CompiledTarget {
    target: Target,
    transformer: Transformer,
    dispatcher: Arc<dyn Dispatcher>,
}

struct ExecutorState {
    pattern: String,
    matcher: Option<Matcher>,
    targets: HashMap<TargetId, CompiledTarget>,
}

/// Compiled runtime form of a rule: matcher + transformers + dispatchers,
/// mutated atomically on hot-reload.
pub struct Executor {
    state: RwLock<ExecutorState>,
    match_registry: MatchRegistry,
    dispatcher_registry: Arc<DispatcherRegistry>,
    transform_concurrency: usize,
    update_timeout: std::time::Duration,
}

impl Executor {
    /// An executor with nothing compiled yet (equivalent to a rule whose
    /// pattern and targets have not been set). `update_timeout` bounds every
    /// [`Executor::update`] call (§5, default 5s).
    pub fn empty(
        dispatcher_registry: Arc<DispatcherRegistry>,
        transform_concurrency: usize,
        update_timeout: std::time::Duration,
    ) -> Self {
        Executor {
            state: RwLock::new(ExecutorState {
                pattern: String::new(),
                matcher: None,
                targets: HashMap::new(),
            }),
            match_registry: MatchRegistry::with_builtins(),
            dispatcher_registry,
            transform_concurrency,
            update_timeout,
        }
    }

    /// Read-locked snapshot evaluation of the compiled matcher.
    pub async fn pattern(&self, rule_name: &str, envelope: &Envelope) -> Result<bool> {
        let state = self.state.read().await;
        match &state.matcher {
            Some(matcher) => matcher.matches(envelope),
            None => Err(EventBridgeError::NoMatcher {
                rule: rule_name.to_string(),
            }),
        }
    }

    /// Snapshot of the compiled transformers; if exactly one, run inline,
    /// otherwise run with bounded concurrency. Returns the list of target
    /// events (possibly partial on error), each clone stamped with
    /// `target_id`/`rule_name`/overriding `retry_strategy`.
    pub async fn transform(&self, rule_name: &str, envelope: &Envelope) -> Result<Vec<Envelope>> {
        let snapshot: Vec<(TargetId, Transformer, Option<RetryStrategy>)> = {
            let state = self.state.read().await;
            if state.targets.is_empty() {
                return Err(EventBridgeError::NoTransformer {
                    rule: rule_name.to_string(),
                    target_id: 0,
                });
            }
            state
                .targets
                .values()
                .map(|t| (t.target.id, t.transformer.clone(), t.target.retry_strategy))
                .collect()
        };

        let run_one = |id: TargetId, transformer: Transformer, override_strategy: Option<RetryStrategy>| {
            let cloned = envelope.deep_clone();
            async move {
                let mut out = cloned;
                out.event.data = transformer.transform(&out)?;
                out.target_id = id.0;
                out.rule_name = rule_name.to_string();
                if let Some(strategy) = override_strategy {
                    out.retry_strategy = strategy;
                }
                Ok::<Envelope, EventBridgeError>(out)
            }
        };

        if snapshot.len() == 1 {
            let (id, transformer, strategy) = snapshot.into_iter().next().unwrap();
            return Ok(vec![run_one(id, transformer, strategy).await?]);
        }

        use futures::stream::{self, StreamExt, TryStreamExt};
        let concurrency = self.transform_concurrency.max(1);
        stream::iter(snapshot.into_iter().map(|(id, t, s)| run_one(id, t, s)))
            .buffer_unordered(concurrency)
            .try_collect()
            .await
    }

    /// Dispatch `envelope` through the compiled dispatcher for its
    /// `target_id`.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let dispatcher = {
            let state = self.state.read().await;
            let target_id = TargetId(envelope.target_id);
            state
                .targets
                .get(&target_id)
                .map(|t| t.dispatcher.clone())
                .ok_or(EventBridgeError::NoDispatcher {
                    target_id: envelope.target_id,
                })?
        };
        dispatcher.dispatch(envelope).await
    }

    /// The declared `Target.type` for a compiled target id, if still
    /// present. Used only for metrics labeling.
    pub async fn target_type(&self, target_id: TargetId) -> Option<String> {
        self.state.read().await.targets.get(&target_id).map(|t| t.target.ty.clone())
    }

    /// True when `rule.pattern` is byte-identical to the currently compiled
    /// pattern text.
    pub async fn is_filter_pattern_equal(&self, rule: &Rule) -> bool {
        self.state.read().await.pattern == rule.pattern
    }

    /// True when `rule.targets` is deep-equal (by value) to the currently
    /// held target set.
    pub async fn is_targets_equal(&self, rule: &Rule) -> bool {
        let state = self.state.read().await;
        if state.targets.len() != rule.targets.len() {
            return false;
        }
        rule.targets.iter().all(|t| {
            state
                .targets
                .get(&t.id)
                .is_some_and(|existing| existing.target == *t)
        })
    }

    /// Diff `rule` against the currently held state and rebuild only what
    /// changed. Idempotent: applying the same rule twice closes no
    /// dispatchers on the second call. Dispatcher `Close()` for retired
    /// targets runs after the write lock is released.
    pub async fn update(&self, rule: &Rule) -> Result<()> {
        match tokio::time::timeout(self.update_timeout, self.update_inner(rule)).await {
            Ok(result) => result,
            Err(_) => Err(EventBridgeError::ExecutorUpdateTimeout {
                rule: rule.name.clone(),
            }),
        }
    }

    async fn update_inner(&self, rule: &Rule) -> Result<()> {
        if self.is_filter_pattern_equal(rule).await && self.is_targets_equal(rule).await {
            return Ok(());
        }

        let pattern_spec: Value = serde_json::from_str(&rule.pattern)
            .map_err(|e| EventBridgeError::PatternSyntaxError(e.to_string()))?;

        let mut retired: Vec<Arc<dyn Dispatcher>> = Vec::new();

        {
            let mut state = self.state.write().await;

            if state.pattern != rule.pattern {
                state.matcher = Some(Matcher::compile(&pattern_spec, &self.match_registry)?);
                state.pattern = rule.pattern.clone();
            }

            let incoming: HashMap<TargetId, &Target> = rule.targets.iter().map(|t| (t.id, t)).collect();

            let removed: Vec<TargetId> = state
                .targets
                .keys()
                .filter(|id| !incoming.contains_key(id))
                .copied()
                .collect();
            for id in removed {
                if let Some(compiled) = state.targets.remove(&id) {
                    retired.push(compiled.dispatcher);
                }
            }

            for target in &rule.targets {
                let needs_rebuild = match state.targets.get(&target.id) {
                    Some(existing) => existing.target != *target,
                    None => true,
                };
                if !needs_rebuild {
                    continue;
                }
                let transformer = Transformer::compile(target)?;
                let dispatcher = self.dispatcher_registry.build(target)?;
                if let Some(previous) = state.targets.remove(&target.id) {
                    retired.push(previous.dispatcher);
                }
                state.targets.insert(
                    target.id,
                    CompiledTarget {
                        target: target.clone(),
                        transformer,
                        dispatcher,
                    },
                );
            }
        }

        for dispatcher in retired {
            dispatcher.close().await?;
        }
        Ok(())
    }

    /// Clear all maps and close every dispatcher.
    pub async fn close(&self) -> Result<()> {
        let retired: Vec<Arc<dyn Dispatcher>> = {
            let mut state = self.state.write().await;
            state.matcher = None;
            state.pattern.clear();
            state.targets.drain().map(|(_, t)| t.dispatcher).collect()
        };
        for dispatcher in retired {
            dispatcher.close().await?;
        }
        Ok(())
    }
}
