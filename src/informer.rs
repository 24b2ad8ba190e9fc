// Copyright 2025 Cowboy AI, LLC.

//! The generic hot-reload engine (component F): reflector -> delta queue ->
//! worker pool, with a retry queue scheduled off a time-ordered min-heap
//! using per-key exponential backoff.
//!
//! `Handle` is *not* serialized per key: the worker pool dispatches keys to
//! whichever worker is free, so two deliveries of the same key may run
//! concurrently. Handlers in this crate are written to tolerate that by
//! reconstructing full state from the backing store rather than mutating in
//! place (see SPEC_FULL.md §9 Open Questions).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{error, warn};

use crate::errors::{EventBridgeError, Result};

/// Backoff policy shared by the informer's retry scheduler and outer watch
/// loop: delay doubles per consecutive failure from `initial`, jittered,
/// capped at `max_step`, abandoned once cumulative elapsed time exceeds
/// `max_elapsed`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// The first retry's delay.
    pub initial: Duration,
    /// The largest delay any single step may reach.
    pub max_step: Duration,
    /// Cumulative elapsed time after which a key is dropped.
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_millis(500),
            max_step: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self.initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = doubled.min(self.max_step);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(capped.as_secs_f64() * jitter_frac).max(Duration::from_millis(1))
    }
}

/// A DB-polling delta source keyed by a version counter. `watch` must be
/// invoked from a single task only; `get` is thread-safe and may be called
/// concurrently by workers.
#[async_trait]
pub trait Reflector: Send + Sync + 'static {
    /// The delta key type, e.g. a bus or rule name.
    type Key: Eq + std::hash::Hash + Clone + Send + Sync + std::fmt::Debug + 'static;
    /// The cached snapshot value type returned by `get`.
    type Value: Clone + Send + Sync + 'static;

    /// Poll the version counter; when it has advanced, keyset-page the
    /// listing, diff against the last snapshot, and return the union of
    /// added/updated/deleted keys. Returns [`EventBridgeError::ReflectorClosed`]
    /// once the reflector has been told to stop.
    async fn watch(&self) -> Result<Vec<Self::Key>>;

    /// Read the last-listed snapshot for `key`, if present.
    fn get(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Release any held resources (DB handles, …). Idempotent.
    async fn close(&self);
}

/// A user-supplied reconciliation callback invoked once per delta key.
#[async_trait]
pub trait Handler<R: Reflector>: Send + Sync + 'static {
    /// Reconcile `key` against `reflector`'s current snapshot. Must be
    /// idempotent and safe under arbitrary concurrent interleaving for the
    /// same key.
    async fn handle(&self, key: &R::Key, reflector: &R) -> Result<()>;
}

/// Tunables for one [`Informer`] instance.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Bounded capacity of the delta queue fed by `Watch`.
    pub delta_queue_capacity: usize,
    /// Bounded capacity of the retry queue for failed handles.
    pub retry_queue_capacity: usize,
    /// Fixed worker pool size.
    pub worker_pool_size: usize,
    /// Backoff policy for the per-key retry scheduler and the outer watch
    /// loop.
    pub backoff: BackoffPolicy,
}

impl Default for InformerConfig {
    fn default() -> Self {
        InformerConfig {
            delta_queue_capacity: 1024,
            retry_queue_capacity: 1024,
            worker_pool_size: 20,
            backoff: BackoffPolicy::default(),
        }
    }
}

enum WorkItem<K> {
    Delta(K),
    Retry(K),
}

/// The generic watch-queue-retry engine. Owns the reflector, the delta and
/// retry queues, the fixed worker pool, and the outer watch loop.
pub struct Informer<R: Reflector, H: Handler<R>> {
    name: &'static str,
    reflector: Arc<R>,
    handler: Arc<H>,
    config: InformerConfig,
    shutdown: tokio_util::sync::CancellationToken,
    tasks: tokio::task::JoinSet<()>,
}

impl<R: Reflector, H: Handler<R>> Informer<R, H> {
    /// Construct an informer; call [`Informer::start`] to spawn its tasks.
    /// `name` labels this informer's retry-queue-depth gauge (e.g. `"bus"`,
    /// `"rule"`).
    pub fn new(name: &'static str, reflector: Arc<R>, handler: Arc<H>, config: InformerConfig) -> Self {
        Informer {
            name,
            reflector,
            handler,
            config,
            shutdown: tokio_util::sync::CancellationToken::new(),
            tasks: tokio::task::JoinSet::new(),
        }
    }

    /// Spawn the outer watch loop, retry scheduler, and worker pool.
    pub fn start(&mut self) {
        let (work_tx, work_rx) = mpsc::channel::<WorkItem<R::Key>>(self.config.delta_queue_capacity);
        let (retry_tx, retry_rx) = mpsc::channel::<R::Key>(self.config.retry_queue_capacity);

        self.tasks.spawn(watch_loop(
            self.reflector.clone(),
            work_tx.clone(),
            self.config.backoff,
            self.shutdown.clone(),
        ));

        self.tasks.spawn(retry_scheduler(
            self.name,
            retry_rx,
            work_tx.clone(),
            self.config.backoff,
            self.shutdown.clone(),
        ));

        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        for _ in 0..self.config.worker_pool_size {
            self.tasks.spawn(worker_loop(
                work_rx.clone(),
                retry_tx.clone(),
                self.reflector.clone(),
                self.handler.clone(),
                self.shutdown.clone(),
            ));
        }
    }

    /// Signal shutdown, close the reflector, and wait for inflight workers
    /// to drain. The reflector is closed before the join so a watch loop
    /// blocked inside `reflector.watch()` is unblocked by `ReflectorClosed`
    /// rather than the join waiting on a task that can't yet see shutdown.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        self.reflector.close().await;
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn watch_loop<R: Reflector>(
    reflector: Arc<R>,
    work_tx: mpsc::Sender<WorkItem<R::Key>>,
    backoff: BackoffPolicy,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut first_failure: Option<Instant> = None;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match reflector.watch().await {
            Ok(keys) => {
                attempt = 0;
                first_failure = None;
                for key in keys {
                    if work_tx.send(WorkItem::Delta(key)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.is_reflector_closed() => {
                return;
            }
            Err(e) => {
                let started = *first_failure.get_or_insert_with(Instant::now);
                if started.elapsed() > backoff.max_elapsed {
                    error!(error = %e, "informer watch loop abandoning after 24h of failures");
                    return;
                }
                warn!(error = %e, attempt, "informer reflector watch failed, retrying with backoff");
                let delay = backoff.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

struct RetryState {
    attempt: u32,
    first_failure: Instant,
}

async fn retry_scheduler<K>(
    name: &'static str,
    mut retry_rx: mpsc::Receiver<K>,
    work_tx: mpsc::Sender<WorkItem<K>>,
    backoff: BackoffPolicy,
    shutdown: tokio_util::sync::CancellationToken,
) where
    K: Eq + std::hash::Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    let mut due: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut keyed: HashMap<u64, K> = HashMap::new();
    let mut current_id: HashMap<K, u64> = HashMap::new();
    let mut states: HashMap<K, RetryState> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        let sleep_for = due
            .peek()
            .map(|Reverse((when, _))| when.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(24 * 60 * 60));

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(sleep_for) => {
                let now = Instant::now();
                while let Some(Reverse((when, id))) = due.peek().copied() {
                    if when > now {
                        break;
                    }
                    due.pop();
                    if let Some(key) = keyed.remove(&id) {
                        // This id is the live timer for `key` (a duplicate
                        // submission while pending would have tombstoned and
                        // replaced it); firing clears the tracking so a later
                        // failure starts a fresh backoff rather than
                        // continuing the old one.
                        current_id.remove(&key);
                        states.remove(&key);
                        if work_tx.send(WorkItem::Retry(key)).await.is_err() {
                            return;
                        }
                    }
                }
                crate::metrics::set_informer_retry_queue_depth(name, due.len() as i64);
            }
            maybe_key = retry_rx.recv() => {
                let Some(key) = maybe_key else { return };
                // A duplicate submission for a key already pending retry
                // resets its backoff and replaces the existing timer: newer
                // data supersedes a stale retry. The old heap entry is
                // tombstoned by dropping it from `keyed` (the fire branch
                // above skips ids no longer present there) rather than left
                // to fire independently alongside the new one.
                if let Some(stale_id) = current_id.remove(&key) {
                    keyed.remove(&stale_id);
                    states.remove(&key);
                }
                let state = states.entry(key.clone()).or_insert_with(|| RetryState {
                    attempt: 0,
                    first_failure: Instant::now(),
                });
                if state.first_failure.elapsed() > backoff.max_elapsed {
                    error!(key = ?key, "informer retry abandoning key after 24h of failures");
                    states.remove(&key);
                    current_id.remove(&key);
                    crate::metrics::set_informer_retry_queue_depth(name, due.len() as i64);
                    continue;
                }
                let delay = backoff.delay_for_attempt(state.attempt);
                state.attempt = state.attempt.saturating_add(1);
                let id = next_id;
                next_id += 1;
                keyed.insert(id, key.clone());
                current_id.insert(key, id);
                due.push(Reverse((Instant::now() + delay, id)));
                crate::metrics::set_informer_retry_queue_depth(name, due.len() as i64);
            }
        }
    }
}

async fn worker_loop<R: Reflector, H: Handler<R>>(
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem<R::Key>>>>,
    retry_tx: mpsc::Sender<R::Key>,
    reflector: Arc<R>,
    handler: Arc<H>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { return };
        let key = match item {
            WorkItem::Delta(k) | WorkItem::Retry(k) => k,
        };
        if let Err(e) = handler.handle(&key, &reflector).await {
            if e.is_reflector_closed() {
                return;
            }
            warn!(key = ?key, error = %e, "informer handle failed, scheduling retry");
            let _ = retry_tx.send(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingReflector {
        keys: Mutex<Vec<Vec<String>>>,
        call: AtomicUsize,
    }

    #[async_trait]
    impl Reflector for CountingReflector {
        type Key = String;
        type Value = ();

        async fn watch(&self) -> Result<Vec<String>> {
            let idx = self.call.fetch_add(1, Ordering::SeqCst);
            let mut batches = self.keys.lock().unwrap();
            if idx < batches.len() {
                Ok(std::mem::take(&mut batches[idx]))
            } else {
                // steady state: no further deltas, avoid busy-looping the test
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            }
        }

        fn get(&self, _key: &String) -> Option<()> {
            Some(())
        }

        async fn close(&self) {}
    }

    struct FlakyHandler {
        fail_until: AtomicUsize,
        successes: Arc<Mutex<Vec<String>>>,
        attempts: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl Handler<CountingReflector> for FlakyHandler {
        async fn handle(&self, key: &String, _reflector: &CountingReflector) -> Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count <= self.fail_until.load(Ordering::SeqCst) {
                return Err(EventBridgeError::Internal("flaky failure".into()));
            }
            self.successes.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_eventually_succeed_after_transient_failures() {
        let reflector = Arc::new(CountingReflector {
            keys: Mutex::new(vec![vec!["a".into(), "b".into(), "c".into()]]),
            call: AtomicUsize::new(0),
        });
        let successes = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(FlakyHandler {
            fail_until: AtomicUsize::new(2),
            successes: successes.clone(),
            attempts: Mutex::new(HashMap::new()),
        });

        let mut config = InformerConfig::default();
        config.backoff.initial = Duration::from_millis(5);
        config.backoff.max_step = Duration::from_millis(20);
        config.worker_pool_size = 3;

        let mut informer = Informer::new("test", reflector, handler, config);
        informer.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if successes.lock().unwrap().len() == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all three keys should eventually succeed");

        let mut done = successes.lock().unwrap().clone();
        done.sort();
        assert_eq!(done, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_retry_submission_replaces_the_pending_timer() {
        let (retry_tx, retry_rx) = mpsc::channel::<String>(8);
        let (work_tx, mut work_rx) = mpsc::channel::<WorkItem<String>>(8);
        let shutdown = tokio_util::sync::CancellationToken::new();
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(200),
            max_step: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        };

        let handle = tokio::spawn(retry_scheduler("test", retry_rx, work_tx, backoff, shutdown.clone()));

        retry_tx.send("k".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // While "k"'s first timer is still pending, a duplicate must reset
        // its backoff and replace the timer rather than queue a second one.
        retry_tx.send("k".to_string()).await.unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), work_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match fired {
            WorkItem::Retry(k) => assert_eq!(k, "k"),
            WorkItem::Delta(_) => panic!("expected a retry item"),
        }

        let second = tokio::time::timeout(Duration::from_millis(150), work_rx.recv()).await;
        assert!(
            second.is_err(),
            "a duplicate submission must not leave a second in-flight timer for the same key"
        );

        shutdown.cancel();
        let _ = handle.await;
    }

    #[test]
    fn backoff_grows_monotonically_until_cap() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max_step: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60 * 60 * 24),
        };
        // Upper bound (pre-jitter) must be non-decreasing until the cap.
        let mut previous_cap = Duration::from_millis(0);
        for attempt in 0..10 {
            let doubled = policy
                .initial
                .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
                .min(policy.max_step);
            assert!(doubled >= previous_cap);
            previous_cap = doubled;
        }
        assert_eq!(previous_cap, policy.max_step);
    }
}
