// Copyright 2025 Cowboy AI, LLC.

//! The event repository orchestrator (§4.H): routes a delivered envelope
//! either straight through its attributed rule (the retry-queue path) or
//! fans it out across every enabled rule of its bus (the source-event
//! path), requeuing failed dispatches onto the bus's backoff topics.
//!
//! Also hosts the two informer handlers that keep [`RuleExecutors`] and
//! the [`BusManager`] in sync with the reflected store: `Handler`
//! implementations here are safe under arbitrary concurrent interleaving
//! for the same key, since they reconstruct the target executor/binding
//! from the reflector's current snapshot rather than mutating one in
//! place.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{error, warn};

use crate::bus::{BusBinding, BusManager, EventHandler};
use crate::errors::{EventBridgeError, Result};
use crate::event::Envelope;
use crate::informer::{Handler, Reflector};
use crate::persistence::RuleKey;
use crate::rule::target::DispatcherRegistry;
use crate::rule::{Executor, Rule, RuleStatus, TargetId};

/// `bus_name -> rule_name -> compiled executor`. The informer's
/// [`RuleHandler`] is the sole mutator; [`EventRepository`] only reads.
pub struct RuleExecutors {
    by_bus: DashMap<String, DashMap<String, Arc<Executor>>>,
    dispatcher_registry: Arc<DispatcherRegistry>,
    transform_concurrency: usize,
    update_timeout: std::time::Duration,
}

impl RuleExecutors {
    /// An empty table; rules are added as the rule reflector delivers them.
    /// `update_timeout` bounds every compiled executor's `Update` call (§5).
    pub fn new(
        dispatcher_registry: Arc<DispatcherRegistry>,
        transform_concurrency: usize,
        update_timeout: std::time::Duration,
    ) -> Self {
        RuleExecutors {
            by_bus: DashMap::new(),
            dispatcher_registry,
            transform_concurrency,
            update_timeout,
        }
    }

    /// Every `(rule_name, executor)` pair currently compiled for `bus_name`.
    pub fn executors_for_bus(&self, bus_name: &str) -> Vec<(String, Arc<Executor>)> {
        match self.by_bus.get(bus_name) {
            Some(rules) => rules.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            None => Vec::new(),
        }
    }

    fn get_or_create(&self, bus_name: &str, rule_name: &str) -> Arc<Executor> {
        let rules = self.by_bus.entry(bus_name.to_string()).or_default();
        rules
            .entry(rule_name.to_string())
            .or_insert_with(|| {
                Arc::new(Executor::empty(
                    self.dispatcher_registry.clone(),
                    self.transform_concurrency,
                    self.update_timeout,
                ))
            })
            .clone()
    }

    async fn remove(&self, bus_name: &str, rule_name: &str) -> Option<Arc<Executor>> {
        let removed = self.by_bus.get(bus_name).and_then(|rules| rules.remove(rule_name).map(|(_, v)| v));
        removed
    }
}

/// Reconciles one `(bus_name, rule_name)` delta from the rule reflector
/// into [`RuleExecutors`]: absent or disabled closes and drops the
/// executor, present and enabled upserts it via `Executor::update`. Generic
/// over the reflector type so it can be driven by a fake in tests as well
/// as by [`crate::persistence::RuleReflector`] in production.
pub struct RuleHandler {
    executors: Arc<RuleExecutors>,
}

impl RuleHandler {
    /// Reconciles rule reflector deltas into `executors`.
    pub fn new(executors: Arc<RuleExecutors>) -> Self {
        RuleHandler { executors }
    }
}

#[async_trait]
impl<R> Handler<R> for RuleHandler
where
    R: Reflector<Key = RuleKey, Value = Rule>,
{
    async fn handle(&self, key: &RuleKey, reflector: &R) -> Result<()> {
        match reflector.get(key) {
            Some(rule) if rule.status == RuleStatus::Enable => {
                let executor = self.executors.get_or_create(&key.bus_name, &key.name);
                executor.update(&rule).await
            }
            Some(_) | None => {
                if let Some(executor) = self.executors.remove(&key.bus_name, &key.name).await {
                    executor.close().await?;
                }
                Ok(())
            }
        }
    }
}

/// Reconciles one bus-name delta from the bus reflector into the
/// [`BusManager`]. Holds only a [`Weak`] reference so informer shutdown
/// drops its reference without the manager needing an explicit null-out
/// (the circular-reference break described in SPEC_FULL.md §9 Design
/// Notes). Generic over the reflector type for the same reason as
/// [`RuleHandler`].
pub struct BusHandler {
    manager: Weak<BusManager>,
}

impl BusHandler {
    /// Reconciles bus reflector deltas into `manager`.
    pub fn new(manager: Weak<BusManager>) -> Self {
        BusHandler { manager }
    }
}

#[async_trait]
impl<R> Handler<R> for BusHandler
where
    R: Reflector<Key = String, Value = BusBinding>,
{
    async fn handle(&self, key: &String, reflector: &R) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        match reflector.get(key) {
            Some(binding) => manager.update(binding).await,
            None => {
                manager.remove(key).await;
                Ok(())
            }
        }
    }
}

/// Tunables for the source-event fan-out.
#[derive(Debug, Clone, Copy)]
pub struct EventRepositoryConfig {
    /// Bounded concurrency across a bus's rules for one source event.
    pub rule_parallelism: usize,
}

impl Default for EventRepositoryConfig {
    fn default() -> Self {
        EventRepositoryConfig { rule_parallelism: 20 }
    }
}

/// Orchestrates match -> transform -> dispatch across a bus's rules for
/// one delivered envelope, requeuing failed dispatches to the bus's
/// backoff topics.
///
/// Holds only a [`Weak`] reference to the [`BusManager`] it requeues
/// through: `BusManager::new` needs this repository as its `Arc<dyn
/// EventHandler>` at construction time, so the two cannot hold strong
/// `Arc`s of each other without a cycle. `main` owns the only strong
/// `Arc<BusManager>`.
pub struct EventRepository {
    executors: Arc<RuleExecutors>,
    bus: Weak<BusManager>,
    config: EventRepositoryConfig,
}

impl EventRepository {
    /// Construct an orchestrator over `executors`, requeuing through `bus`.
    pub fn new(executors: Arc<RuleExecutors>, bus: Weak<BusManager>, config: EventRepositoryConfig) -> Self {
        EventRepository { executors, bus, config }
    }
}

#[async_trait]
impl EventHandler for EventRepository {
    async fn handle_event(&self, envelope: Envelope) -> Result<()> {
        let rule_executors = self.executors.executors_for_bus(&envelope.bus_name);

        if !envelope.rule_name.is_empty() {
            let executor_entry = rule_executors.into_iter().find(|(name, _)| *name == envelope.rule_name);
            let Some((rule_name, executor)) = executor_entry else {
                return Err(EventBridgeError::RuleNotFound(envelope.rule_name.clone()));
            };
            let timer = crate::metrics::start_post_event(&envelope.bus_name, &rule_name);
            let outcome = executor.dispatch(&envelope).await;
            timer.finish(if outcome.is_ok() { "ok" } else { "error" });
            return outcome;
        }

        if rule_executors.is_empty() {
            return Ok(());
        }

        let concurrency = self.config.rule_parallelism.max(1);
        let bus = self.bus.clone();
        let bus_name = envelope.bus_name.clone();

        stream::iter(rule_executors.into_iter().map(|(rule_name, executor)| {
            let envelope = envelope.deep_clone();
            let bus = bus.clone();
            let bus_name = bus_name.clone();
            async move { run_rule(bus_name, rule_name, executor, envelope, bus).await }
        }))
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;
        Ok(())
    }
}

async fn run_rule(bus_name: String, rule_name: String, executor: Arc<Executor>, envelope: Envelope, bus: Weak<BusManager>) -> Result<()> {
    let timer = crate::metrics::start_post_event(&bus_name, &rule_name);

    let matched = match executor.pattern(&rule_name, &envelope).await {
        Ok(matched) => matched,
        Err(e) if matches!(e, EventBridgeError::NoMatcher { .. }) => {
            warn!(bus = %bus_name, rule = %rule_name, "no matcher compiled, soft-skipping");
            timer.finish("no_matcher");
            return Ok(());
        }
        Err(e) => {
            timer.finish("error");
            return Err(e);
        }
    };
    if !matched {
        timer.finish("no_match");
        return Ok(());
    }

    let target_events = match executor.transform(&rule_name, &envelope).await {
        Ok(events) => events,
        Err(e) if matches!(e, EventBridgeError::NoTransformer { .. }) => {
            warn!(bus = %bus_name, rule = %rule_name, "no transformer compiled, soft-skipping");
            timer.finish("no_transformer");
            return Ok(());
        }
        Err(e) => {
            timer.finish("error");
            return Err(e);
        }
    };

    let mut outcome = "ok";
    for target_event in target_events {
        if let Err(e) = executor.dispatch(&target_event).await {
            let target_label = executor
                .target_type(TargetId(target_event.target_id))
                .await
                .unwrap_or_else(|| "unknown".to_string());
            crate::metrics::record_dispatch_error(&target_label);

            if matches!(e, EventBridgeError::NoDispatcher { .. }) {
                warn!(bus = %bus_name, rule = %rule_name, target_id = target_event.target_id, "no dispatcher registered, dropping");
                outcome = "no_dispatcher";
                continue;
            }

            warn!(bus = %bus_name, rule = %rule_name, target_id = target_event.target_id, error = %e, "dispatch failed, requeuing to retry topic");
            let Some(bus_manager) = bus.upgrade() else {
                error!(bus = %bus_name, rule = %rule_name, target_id = target_event.target_id, "bus manager gone, dropping failed dispatch");
                outcome = "requeue_failed";
                continue;
            };
            if let Err(send_err) = bus_manager.send(&target_event).await {
                error!(bus = %bus_name, rule = %rule_name, target_id = target_event.target_id, error = %send_err, "failed to requeue dispatch failure");
                outcome = "requeue_failed";
            } else {
                outcome = "requeued";
            }
        }
    }

    timer.finish(outcome);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executors_for_unknown_bus_is_empty() {
        let registry = Arc::new(DispatcherRegistry::with_builtins().unwrap());
        let executors = RuleExecutors::new(registry, 20, std::time::Duration::from_secs(5));
        assert!(executors.executors_for_bus("Default").is_empty());
    }

    #[tokio::test]
    async fn get_or_create_is_visible_through_executors_for_bus() {
        let registry = Arc::new(DispatcherRegistry::with_builtins().unwrap());
        let executors = RuleExecutors::new(registry, 20, std::time::Duration::from_secs(5));
        let created = executors.get_or_create("Default", "r1");
        let listed = executors.executors_for_bus("Default");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "r1");
        assert!(Arc::ptr_eq(&listed[0].1, &created));
    }

    #[tokio::test]
    async fn removing_a_rule_drops_it_from_executors_for_bus() {
        let registry = Arc::new(DispatcherRegistry::with_builtins().unwrap());
        let executors = RuleExecutors::new(registry, 20, std::time::Duration::from_secs(5));
        executors.get_or_create("Default", "r1");
        assert!(!executors.executors_for_bus("Default").is_empty());

        let removed = executors.remove("Default", "r1").await;
        assert!(removed.is_some());
        assert!(executors.executors_for_bus("Default").is_empty());
    }

    #[tokio::test]
    async fn rule_handler_closes_and_drops_executor_for_a_disabled_rule() {
        struct FixedReflector(Option<Rule>);
        #[async_trait]
        impl Reflector for FixedReflector {
            type Key = RuleKey;
            type Value = Rule;
            async fn watch(&self) -> Result<Vec<RuleKey>> {
                Ok(vec![])
            }
            fn get(&self, _key: &RuleKey) -> Option<Rule> {
                self.0.clone()
            }
            async fn close(&self) {}
        }

        let registry = Arc::new(DispatcherRegistry::with_builtins().unwrap());
        let executors = Arc::new(RuleExecutors::new(registry, 20, std::time::Duration::from_secs(5)));
        executors.get_or_create("Default", "r1");
        assert!(!executors.executors_for_bus("Default").is_empty());

        let handler = RuleHandler::new(executors.clone());
        let reflector = FixedReflector(Some(Rule {
            name: "r1".into(),
            bus_name: "Default".into(),
            status: RuleStatus::Disable,
            pattern: "{}".into(),
            targets: vec![],
        }));
        let key = RuleKey {
            bus_name: "Default".into(),
            name: "r1".into(),
        };
        handler.handle(&key, &reflector).await.unwrap();
        assert!(executors.executors_for_bus("Default").is_empty());
    }
}
