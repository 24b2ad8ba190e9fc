// Copyright 2025 Cowboy AI, LLC.

//! The MQ Binding Manager (component G): per-bus producers and consumers
//! over NATS JetStream, bound to four logical topics (source, source-delay,
//! target-exp-decay, target-backoff), with invisibility-duration-based
//! retry on the consume side.
//!
//! The MQ substrate named in the distilled specification is RocketMQ; this
//! crate's teacher already depends on `async-nats` with the JetStream
//! feature for exactly this shape of durable, subject-addressed,
//! replayable queue, so JetStream is the substrate implemented here (see
//! DESIGN.md). Only the wire substrate and its default URL scheme
//! (`nats`, not `rocketmq`) differ from the distilled examples; the
//! four-topic binding shape and the orderly/concurrent consumer protocols
//! below are unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer as JsConsumer};
use async_nats::jetstream::context::Publish;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{AckKind, Context as JetStreamContext};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::errors::{EventBridgeError, Result};
use crate::event::{Envelope, RetryStrategy};

/// Consumption ordering for a bus's four topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    /// A bounded pool of workers drains the topic concurrently; no ordering
    /// guarantee across messages.
    Concurrent,
    /// A single in-flight receive preserves per-`{source}:{type}` group
    /// order across retries.
    Orderly,
}

/// A bus's four topic bindings plus its work mode (§3 Bus binding). Value
/// type: two bindings are equal iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusBinding {
    /// Unique bus name.
    pub name: String,
    /// Consumption ordering for this bus's four topics.
    pub mode: BusMode,
    /// Where freshly posted source events land.
    pub source_topic: String,
    /// Where delay-published source events land.
    pub source_delay_topic: String,
    /// Where exponential-decay-strategy target events are requeued.
    pub target_exp_decay_topic: String,
    /// Where backoff-strategy target events are requeued.
    pub target_backoff_topic: String,
}

/// Tunables shared by every bus's consumers.
#[derive(Debug, Clone)]
pub struct BusManagerConfig {
    /// Host substituted for a topic URL that omits one.
    pub default_host: String,
    /// Concurrent-mode worker pool size per topic.
    pub workers_per_topic: usize,
    /// Orderly-mode invisibility base, before `req_timeout + handlerTimeout`
    /// is added.
    pub orderly_invisibility_base: Duration,
    /// Per-message handler timeout.
    pub consumer_timeout: Duration,
    /// Fixed request-timeout term added into the ack-wait formula alongside
    /// `consumer_timeout`.
    pub req_timeout: Duration,
}

impl Default for BusManagerConfig {
    fn default() -> Self {
        BusManagerConfig {
            default_host: "default".to_string(),
            workers_per_topic: 256,
            orderly_invisibility_base: Duration::from_secs(10),
            consumer_timeout: Duration::from_secs(1),
            req_timeout: Duration::from_secs(3),
        }
    }
}

/// Receives envelopes consumed off any of a bus's four topics. The same
/// handler serves both source-event and retry-queue deliveries: the
/// envelope's own `rule_name`/`target_id` tell it which path applies (§4.H).
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Reconcile one delivered envelope. Returning `Err` schedules a
    /// redelivery per the envelope's `retry_strategy`.
    async fn handle_event(&self, envelope: Envelope) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum TopicKind {
    Source,
    SourceDelay,
    TargetExpDecay,
    TargetBackoff,
}

impl TopicKind {
    fn as_str(self) -> &'static str {
        match self {
            TopicKind::Source => "source",
            TopicKind::SourceDelay => "source-delay",
            TopicKind::TargetExpDecay => "target-exp-decay",
            TopicKind::TargetBackoff => "target-backoff",
        }
    }
}

struct ParsedTopic {
    subject: String,
}

/// Parses `scheme://host/path`; a missing scheme defaults to `nats`, a
/// missing host defaults to `default_host`, and an empty path is an error.
/// The host carries no addressing meaning today (one process, one NATS
/// connection) but is validated so a future multi-endpoint deployment can
/// use it.
fn parse_topic_url(raw: &str, default_host: &str) -> Result<ParsedTopic> {
    let (_scheme, remainder) = match raw.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest.to_string()),
        None => ("nats".to_string(), raw.to_string()),
    };
    let (host, path) = match remainder.split_once('/') {
        Some((h, p)) => (h.to_string(), p.to_string()),
        None => (String::new(), remainder),
    };
    let _host = if host.is_empty() { default_host.to_string() } else { host };
    if path.is_empty() {
        return Err(EventBridgeError::Config(format!(
            "topic url {raw:?} has an empty path"
        )));
    }
    Ok(ParsedTopic { subject: path })
}

struct Producer {
    js: JetStreamContext,
    subject: String,
}

impl Producer {
    async fn publish(&self, envelope: &Envelope, message_group: Option<&str>) -> Result<()> {
        let payload = envelope.value()?;
        let mut publish = Publish::build().payload(bytes::Bytes::from(payload));
        if let Some(group) = message_group {
            publish = publish.message_group(group);
        }
        self.js
            .send_publish(self.subject.clone(), publish)
            .await
            .map_err(|e| EventBridgeError::Mq(e.to_string()))?
            .await
            .map_err(|e| EventBridgeError::Mq(e.to_string()))?;
        Ok(())
    }
}

struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct ActiveBinding {
    binding: BusBinding,
    target_exp_decay_producer: Producer,
    target_backoff_producer: Producer,
    source_consumer: ConsumerHandle,
    source_delay_consumer: ConsumerHandle,
    target_exp_decay_consumer: ConsumerHandle,
    target_backoff_consumer: ConsumerHandle,
}

impl ActiveBinding {
    async fn close(self) {
        self.source_consumer.close().await;
        self.source_delay_consumer.close().await;
        self.target_exp_decay_consumer.close().await;
        self.target_backoff_consumer.close().await;
    }
}

/// Owns every bus's producers and consumers, and the update algorithm that
/// tears down and recreates only the resources whose URL (or, for
/// consumers, whose work mode) changed.
pub struct BusManager {
    js: JetStreamContext,
    config: BusManagerConfig,
    handler: Arc<dyn EventHandler>,
    bindings: DashMap<String, ActiveBinding>,
}

impl BusManager {
    /// A manager with no bus bindings yet; call [`BusManager::update`] per
    /// reflected bus.
    pub fn new(js: JetStreamContext, handler: Arc<dyn EventHandler>, config: BusManagerConfig) -> Self {
        BusManager {
            js,
            config,
            handler,
            bindings: DashMap::new(),
        }
    }

    async fn build_producer(&self, kind: TopicKind, raw_topic: &str) -> Result<Producer> {
        let parsed = parse_topic_url(raw_topic, &self.config.default_host)?;
        debug!(kind = kind.as_str(), subject = %parsed.subject, "binding producer");
        Ok(Producer {
            js: self.js.clone(),
            subject: parsed.subject,
        })
    }

    fn spawn_consumer(&self, bus_name: &str, kind: TopicKind, raw_topic: &str, mode: BusMode) -> Result<ConsumerHandle> {
        let parsed = parse_topic_url(raw_topic, &self.config.default_host)?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let js = self.js.clone();
        let handler = self.handler.clone();
        let consumer_timeout = self.config.consumer_timeout;
        let req_timeout = self.config.req_timeout;
        let workers_per_topic = self.config.workers_per_topic;
        let orderly_base = self.config.orderly_invisibility_base;
        let bus_name = bus_name.to_string();
        let subject = parsed.subject;
        let kind_label = kind.as_str();

        let task = tokio::spawn(
            async move {
                let ack_wait = match mode {
                    BusMode::Orderly => orderly_base + req_timeout + consumer_timeout,
                    BusMode::Concurrent => {
                        Duration::from_secs(workers_per_topic as u64 + 10) + req_timeout + consumer_timeout
                    }
                };
                let durable_name = format!("eventbridge-{bus_name}-{kind_label}");

                let consumer = loop {
                    if task_cancel.is_cancelled() {
                        return;
                    }
                    match ensure_stream_and_consumer(&js, &subject, &durable_name, ack_wait).await {
                        Ok(c) => break c,
                        Err(e) => {
                            error!(error = %e, bus = %bus_name, topic = %subject, "failed to provision consumer, retrying in 1s");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = task_cancel.cancelled() => return,
                            }
                        }
                    }
                };

                match mode {
                    BusMode::Orderly => run_orderly(consumer, handler, consumer_timeout, task_cancel).await,
                    BusMode::Concurrent => {
                        run_concurrent(consumer, handler, consumer_timeout, workers_per_topic, bus_name, subject, task_cancel)
                            .await
                    }
                }
            }
            .instrument(info_span!("bus_consumer", bus = %bus_name, topic = kind_label)),
        );

        Ok(ConsumerHandle { cancel, task })
    }

    async fn build_all(&self, binding: &BusBinding) -> Result<ActiveBinding> {
        Ok(ActiveBinding {
            target_exp_decay_producer: self.build_producer(TopicKind::TargetExpDecay, &binding.target_exp_decay_topic).await?,
            target_backoff_producer: self.build_producer(TopicKind::TargetBackoff, &binding.target_backoff_topic).await?,
            source_consumer: self.spawn_consumer(&binding.name, TopicKind::Source, &binding.source_topic, binding.mode)?,
            source_delay_consumer: self.spawn_consumer(
                &binding.name,
                TopicKind::SourceDelay,
                &binding.source_delay_topic,
                binding.mode,
            )?,
            target_exp_decay_consumer: self.spawn_consumer(
                &binding.name,
                TopicKind::TargetExpDecay,
                &binding.target_exp_decay_topic,
                binding.mode,
            )?,
            target_backoff_consumer: self.spawn_consumer(
                &binding.name,
                TopicKind::TargetBackoff,
                &binding.target_backoff_topic,
                binding.mode,
            )?,
            binding: binding.clone(),
        })
    }

    /// Apply a reflected bus binding: create all resources if the bus is
    /// new, or tear down and recreate only the resources whose URL changed
    /// (all four consumers if `mode` changed). Idempotent: an unchanged
    /// binding is a no-op.
    pub async fn update(&self, binding: BusBinding) -> Result<()> {
        let previous = self.bindings.remove(&binding.name).map(|(_, v)| v);

        let Some(old) = previous else {
            let active = self.build_all(&binding).await?;
            self.bindings.insert(binding.name.clone(), active);
            return Ok(());
        };

        if old.binding == binding {
            self.bindings.insert(binding.name.clone(), old);
            return Ok(());
        }

        let mode_changed = old.binding.mode != binding.mode;

        let source_consumer = if mode_changed || old.binding.source_topic != binding.source_topic {
            let new = self.spawn_consumer(&binding.name, TopicKind::Source, &binding.source_topic, binding.mode)?;
            old.source_consumer.close().await;
            new
        } else {
            old.source_consumer
        };

        let source_delay_consumer = if mode_changed || old.binding.source_delay_topic != binding.source_delay_topic {
            let new = self.spawn_consumer(
                &binding.name,
                TopicKind::SourceDelay,
                &binding.source_delay_topic,
                binding.mode,
            )?;
            old.source_delay_consumer.close().await;
            new
        } else {
            old.source_delay_consumer
        };

        let exp_decay_changed = old.binding.target_exp_decay_topic != binding.target_exp_decay_topic;
        let target_exp_decay_consumer = if mode_changed || exp_decay_changed {
            let new = self.spawn_consumer(
                &binding.name,
                TopicKind::TargetExpDecay,
                &binding.target_exp_decay_topic,
                binding.mode,
            )?;
            old.target_exp_decay_consumer.close().await;
            new
        } else {
            old.target_exp_decay_consumer
        };
        let target_exp_decay_producer = if exp_decay_changed {
            self.build_producer(TopicKind::TargetExpDecay, &binding.target_exp_decay_topic).await?
        } else {
            old.target_exp_decay_producer
        };

        let backoff_changed = old.binding.target_backoff_topic != binding.target_backoff_topic;
        let target_backoff_consumer = if mode_changed || backoff_changed {
            let new = self.spawn_consumer(
                &binding.name,
                TopicKind::TargetBackoff,
                &binding.target_backoff_topic,
                binding.mode,
            )?;
            old.target_backoff_consumer.close().await;
            new
        } else {
            old.target_backoff_consumer
        };
        let target_backoff_producer = if backoff_changed {
            self.build_producer(TopicKind::TargetBackoff, &binding.target_backoff_topic).await?
        } else {
            old.target_backoff_producer
        };

        self.bindings.insert(
            binding.name.clone(),
            ActiveBinding {
                binding,
                target_exp_decay_producer,
                target_backoff_producer,
                source_consumer,
                source_delay_consumer,
                target_exp_decay_consumer,
                target_backoff_consumer,
            },
        );
        Ok(())
    }

    /// Remove and close a bus's resources entirely (the bus row was
    /// deleted).
    pub async fn remove(&self, name: &str) {
        if let Some((_, active)) = self.bindings.remove(name) {
            active.close().await;
        }
    }

    /// Look up the binding by `envelope.bus_name`, inject outbound trace
    /// propagation, and publish to the target-backoff or target-exp-decay
    /// producer selected by `envelope.retry_strategy`. When the bus is
    /// orderly, the message group is `"{source}:{type}"`.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let active = self
            .bindings
            .get(&envelope.bus_name)
            .ok_or_else(|| EventBridgeError::DataBusNotFound(envelope.bus_name.clone()))?;

        let group = if active.binding.mode == BusMode::Orderly {
            Some(format!("{}:{}", envelope.event.source, envelope.event.ty))
        } else {
            None
        };

        let mut outgoing = envelope.deep_clone();
        let ctx = match crate::telemetry::extract(&outgoing.metadata) {
            Some(parent) => parent.child(),
            None => crate::telemetry::TraceContext::new_root(),
        };
        crate::telemetry::inject(&mut outgoing.metadata, &ctx);

        match outgoing.retry_strategy {
            RetryStrategy::Backoff => active.target_backoff_producer.publish(&outgoing, group.as_deref()).await,
            RetryStrategy::ExponentialDecay => active.target_exp_decay_producer.publish(&outgoing, group.as_deref()).await,
        }
    }

    /// Close every bus's resources. Idempotent.
    pub async fn close(&self) {
        let names: Vec<String> = self.bindings.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name).await;
        }
    }
}

async fn ensure_stream_and_consumer(
    js: &JetStreamContext,
    subject: &str,
    durable_name: &str,
    ack_wait: Duration,
) -> Result<JsConsumer<PullConfig>> {
    let stream_name = subject.replace(['.', '/'], "_");
    let stream = js
        .get_or_create_stream(StreamConfig {
            name: stream_name,
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| EventBridgeError::Mq(e.to_string()))?;

    stream
        .get_or_create_consumer(
            durable_name,
            PullConfig {
                durable_name: Some(durable_name.to_string()),
                ack_policy: AckPolicy::Explicit,
                ack_wait,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| EventBridgeError::Mq(e.to_string()))
}

async fn handle_delivery(handler: &Arc<dyn EventHandler>, message: async_nats::jetstream::Message, consumer_timeout: Duration) {
    let envelope: Envelope = match serde_json::from_slice(&message.payload) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "dropping undeserializable message; it will redeliver and repeat this failure");
            return;
        }
    };

    let delivered = message.info().map(|i| i.delivered).unwrap_or(1);
    let strategy = envelope.retry_strategy;
    let key = envelope.key();
    let target_id = envelope.target_id;
    let trace = crate::telemetry::extract(&envelope.metadata);
    let span = info_span!(
        "bus_message",
        bus = %envelope.bus_name,
        event_id = %envelope.event.id,
        rule = %envelope.rule_name,
        trace_id = trace.as_ref().map(|t| t.trace_id.as_str()).unwrap_or(""),
    );
    let _enter = span.enter();

    match tokio::time::timeout(consumer_timeout, handler.handle_event(envelope)).await {
        Ok(Ok(())) => {
            let _ = message.ack().await;
        }
        Ok(Err(e)) => {
            warn!(error = %e, delivered, "handler failed, scheduling redelivery");
            schedule_redelivery(&message, strategy, delivered, &key, target_id).await;
        }
        Err(_) => {
            warn!(delivered, "handler timed out, scheduling redelivery");
            schedule_redelivery(&message, strategy, delivered, &key, target_id).await;
        }
    }
}

async fn schedule_redelivery(
    message: &async_nats::jetstream::Message,
    strategy: RetryStrategy,
    delivered: i64,
    key: &str,
    target_id: u64,
) {
    match strategy {
        RetryStrategy::Backoff => {
            if delivered >= 5 {
                error!(key, target_id, "backoff retries exhausted at delivery 5; dropping (no DLQ topic configured)");
                let _ = message.ack().await;
                return;
            }
            let extra = rand::thread_rng().gen_range(10..=20);
            let _ = message.ack_with(AckKind::Nak(Some(Duration::from_secs(extra)))).await;
        }
        RetryStrategy::ExponentialDecay => {
            if delivered >= 177 {
                error!(
                    key,
                    target_id,
                    "exponential-decay retries exhausted at delivery 177 (~1 day); dropping (no DLQ topic configured)"
                );
                let _ = message.ack().await;
                return;
            }
            let delay_secs: u64 = if delivered <= 9 {
                1u64 << (delivered - 1).max(0)
            } else {
                512
            };
            let _ = message.ack_with(AckKind::Nak(Some(Duration::from_secs(delay_secs)))).await;
        }
    }
}

async fn run_orderly(consumer: JsConsumer<PullConfig>, handler: Arc<dyn EventHandler>, consumer_timeout: Duration, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "orderly consumer receive failed, retrying in 1s");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
        };
        loop {
            let next = tokio::select! {
                next = messages.next() => next,
                _ = cancel.cancelled() => return,
            };
            match next {
                Some(Ok(message)) => handle_delivery(&handler, message, consumer_timeout).await,
                Some(Err(e)) => {
                    warn!(error = %e, "orderly consumer stream error, reconnecting in 1s");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => break,
                        _ = cancel.cancelled() => return,
                    }
                }
                None => break,
            }
        }
    }
}

async fn run_concurrent(
    consumer: JsConsumer<PullConfig>,
    handler: Arc<dyn EventHandler>,
    consumer_timeout: Duration,
    workers_per_topic: usize,
    bus_name: String,
    topic: String,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(workers_per_topic));

    {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let bus_name = bus_name.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            loop {
                let in_flight = workers_per_topic - semaphore.available_permits();
                crate::metrics::set_bus_inflight(&bus_name, &topic, in_flight as i64);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "concurrent consumer receive failed, retrying in 1s");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
        };
        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = cancel.cancelled() => return,
            };
            let Ok(permit) = permit else { return };

            let next = tokio::select! {
                next = messages.next() => next,
                _ = cancel.cancelled() => return,
            };
            match next {
                Some(Ok(message)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handle_delivery(&handler, message, consumer_timeout).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    drop(permit);
                    warn!(error = %e, "concurrent consumer stream error, reconnecting in 1s");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => break,
                        _ = cancel.cancelled() => return,
                    }
                }
                None => {
                    drop(permit);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_topic_name_defaults_scheme_and_host() {
        let parsed = parse_topic_url("EBInterBusDefault", "default").unwrap();
        assert_eq!(parsed.subject, "EBInterBusDefault");
    }

    #[test]
    fn scheme_and_host_are_parsed_out_of_a_full_url() {
        let parsed = parse_topic_url("nats://broker-1/EBInterBusDefault", "default").unwrap();
        assert_eq!(parsed.subject, "EBInterBusDefault");
    }

    #[test]
    fn empty_path_is_an_error() {
        assert!(parse_topic_url("nats://broker-1/", "default").is_err());
    }

    #[test]
    fn exp_decay_backoff_doubles_until_the_ninth_delivery() {
        let expected = [1, 2, 4, 8, 16, 32, 64, 128, 256];
        for (i, want) in expected.iter().enumerate() {
            let delivered = (i + 1) as i64;
            let got: u64 = if delivered <= 9 { 1u64 << (delivered - 1) } else { 512 };
            assert_eq!(got, *want as u64);
        }
    }
}
