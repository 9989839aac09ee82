//! De-duplicating, priority- and delay-aware work queue.
//!
//! Producers call [`PriorityQueue::add_with_opts`] (or one of its
//! shorthands). Each key has at most one pending entry: adding a key that
//! is already pending merges into it, keeping the higher priority and the
//! earlier ready time. A background scheduler hands ready keys to
//! consumers blocked in [`PriorityQueue::get_with_priority`], best first.
//! A delivered key is in flight until [`PriorityQueue::done`]; re-adding it
//! meanwhile parks a new pending entry that is only delivered after
//! `done`.

mod item;
mod scheduler;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, oneshot, watch};
use tracing::{Instrument, debug, info};

use crate::clock::{Clock, RealClock};
use crate::config::QueueConfig;
use crate::metrics::{DefaultQueueMetrics, MetricsProvider, NoopQueueMetrics, QueueMetrics};
use crate::ratelimit::{ItemExponentialFailureRateLimiter, RateLimiter};
use crate::telemetry::queue::queue_span;

use item::{Item, Slot};

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Options for [`PriorityQueue::add_with_opts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOpts {
    /// Delay before the key becomes ready. Zero means ready now.
    pub after: Duration,
    /// Also ask the rate limiter for a delay and use the smaller one.
    pub rate_limited: bool,
    /// Higher is delivered first among equally ready keys.
    pub priority: i32,
}

impl AddOpts {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn after(after: Duration) -> Self {
        Self {
            after,
            ..Self::default()
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            rate_limited: true,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A key handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<K> {
    pub key: K,
    pub priority: i32,
    /// The queue was shut down by the time this key was received. The
    /// consumer should finish up and stop asking for more work.
    pub shutting_down: bool,
}

/// Read-only view of a pending key, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem<K> {
    pub key: K,
    pub priority: i32,
    pub seq: u64,
    /// Time left until the key is ready; `None` if it already is.
    pub ready_in: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Longest delay a key can be scheduled out. Longer delays are clamped.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The key and the slot it was delivered from, so a cancelled consumer
/// can put it back where it was.
type Handoff<K> = oneshot::Sender<(K, Slot)>;

/// Everything guarded by the queue's main lock.
struct State<K> {
    items: HashMap<K, Item>,
    index: BTreeMap<Slot, K>,
    /// Consumers blocked in `get`, oldest first.
    waiters: VecDeque<Handoff<K>>,
    next_seq: u64,
}

impl<K: QueueKey> State<K> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            index: BTreeMap::new(),
            waiters: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Insert a new pending item or merge into the existing one.
    ///
    /// The index entry is removed before the merge and re-inserted
    /// after, since priority and readiness are part of its sort key.
    fn upsert(
        &mut self,
        key: K,
        priority: i32,
        ready_at: Option<Instant>,
        metrics: &dyn QueueMetrics<K>,
    ) {
        if let Some(item) = self.items.get_mut(&key) {
            self.index.remove(&item.slot);
            if item.merge(priority, ready_at) {
                metrics.add(&key);
            }
            self.index.insert(item.slot, key);
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(key, Item::new(seq, priority, ready_at), metrics);
    }

    /// Put a handed-off key back, ready now, at the position it was
    /// delivered from. A re-add that arrived meanwhile is merged and
    /// keeps the older of the two positions.
    fn restore(&mut self, key: K, slot: Slot, metrics: &dyn QueueMetrics<K>) {
        if let Some(item) = self.items.get_mut(&key) {
            self.index.remove(&item.slot);
            if item.merge(slot.priority, None) {
                metrics.add(&key);
            }
            item.slot.seq = item.slot.seq.min(slot.seq);
            self.index.insert(item.slot, key);
            return;
        }

        self.insert(key, Item::new(slot.seq, slot.priority, None), metrics);
    }

    fn insert(&mut self, key: K, item: Item, metrics: &dyn QueueMetrics<K>) {
        if item.counted {
            metrics.add(&key);
        }
        self.index.insert(item.slot, key.clone());
        self.items.insert(key, item);
    }

    fn ready_len(&self, now: Instant) -> usize {
        self.index
            .keys()
            .take_while(|slot| slot.is_ready(now))
            .count()
    }
}

pub(crate) struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    /// Keys checked out to a consumer. Always locked inside `state`.
    locked: RwLock<HashSet<K>>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    rate_limiter: Arc<dyn RateLimiter<K>>,
    metrics: Arc<dyn QueueMetrics<K>>,
    clock: Arc<dyn Clock>,
}

impl<K: QueueKey> Shared<K> {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Put back a key whose consumer went away after it was handed off.
    fn requeue(&self, key: K, slot: Slot) {
        {
            let mut state = self.state.lock();
            self.locked.write().remove(&key);
            self.metrics.done(&key);
            state.restore(key, slot, self.metrics.as_ref());
        }
        self.wake.notify_one();
    }
}

/// A consumer's registration with the scheduler.
///
/// If the owning `get` future is dropped after the scheduler already
/// handed it a key, the key is returned to the queue instead of being
/// stuck in flight forever.
struct Waiter<'a, K: QueueKey> {
    shared: &'a Shared<K>,
    rx: Option<oneshot::Receiver<(K, Slot)>>,
}

impl<K: QueueKey> Waiter<'_, K> {
    async fn recv(mut self) -> Option<(K, Slot)> {
        let rx = self.rx.as_mut()?;
        let received = rx.await.ok();
        self.rx = None;
        received
    }
}

impl<K: QueueKey> Drop for Waiter<'_, K> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok((key, slot)) = rx.try_recv() {
                debug!(queue = %self.shared.name, ?key, "consumer went away, requeueing");
                self.shared.requeue(key, slot);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// The work queue. Share it between producers and consumers with an
/// `Arc`; dropping it shuts the queue down.
pub struct PriorityQueue<K: QueueKey> {
    shared: Arc<Shared<K>>,
}

impl<K: QueueKey> fmt::Debug for PriorityQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("name", &self.shared.name)
            .field("len", &self.len())
            .field("in_flight", &self.in_flight())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<K: QueueKey> PriorityQueue<K> {
    /// Queue with default rate limiter, no metrics and the real clock.
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> QueueBuilder<K> {
        QueueBuilder::new(QueueConfig::named(name))
    }

    /// Queue name as configured.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn add(&self, key: K) {
        self.add_with_opts(AddOpts::default(), [key]);
    }

    pub fn add_after(&self, key: K, after: Duration) {
        self.add_with_opts(AddOpts::after(after), [key]);
    }

    pub fn add_rate_limited(&self, key: K) {
        self.add_with_opts(AddOpts::rate_limited(), [key]);
    }

    /// Add or merge `keys` with the given options.
    ///
    /// With `rate_limited`, the rate limiter's delay replaces `after` when
    /// `after` is zero or the limiter's delay is shorter. Any resulting
    /// non-zero delay counts as a retry. Delays beyond a century are
    /// clamped. After shutdown this does nothing.
    pub fn add_with_opts<I>(&self, opts: AddOpts, keys: I)
    where
        I: IntoIterator<Item = K>,
    {
        if self.is_shutting_down() {
            debug!(queue = %self.shared.name, "queue is shutting down, dropping add");
            return;
        }

        let mut added = false;
        {
            let mut state = self.shared.state.lock();
            let now = self.shared.clock.now();

            for key in keys {
                added = true;

                let mut after = opts.after;
                if opts.rate_limited {
                    let limited = self.shared.rate_limiter.when(&key);
                    if after.is_zero() || limited < after {
                        after = limited;
                    }
                }

                let ready_at = if after.is_zero() {
                    None
                } else {
                    self.shared.metrics.retry();
                    Some(deadline(now, after))
                };

                state.upsert(key, opts.priority, ready_at, self.shared.metrics.as_ref());
            }
        }

        if added {
            self.shared.wake.notify_one();
        }
    }

    /// Wait for the next ready key.
    ///
    /// Returns `None` once the queue is shut down and nothing was handed
    /// to this caller. Every returned key must be passed to
    /// [`done`](Self::done) when processing finishes.
    pub async fn get_with_priority(&self) -> Option<Delivery<K>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if self.is_shutting_down() {
                return None;
            }
            state.waiters.push_back(tx);
        }
        self.shared.wake.notify_one();

        let waiter = Waiter {
            shared: &self.shared,
            rx: Some(rx),
        };
        let (key, slot) = waiter.recv().await?;

        Some(Delivery {
            key,
            priority: slot.priority,
            shutting_down: self.is_shutting_down(),
        })
    }

    /// Like [`get_with_priority`](Self::get_with_priority) without the
    /// priority: the key and whether the queue is shutting down.
    pub async fn get(&self) -> Option<(K, bool)> {
        self.get_with_priority()
            .await
            .map(|delivery| (delivery.key, delivery.shutting_down))
    }

    /// Mark `key` as processed. A pending re-add of it becomes deliverable.
    pub fn done(&self, key: &K) {
        self.shared.locked.write().remove(key);
        self.shared.metrics.done(key);
        self.shared.wake.notify_one();
    }

    /// Reset the rate limiter's history for `key`.
    pub fn forget(&self, key: &K) {
        self.shared.rate_limiter.forget(key);
    }

    /// How often `key` has been requeued through the rate limiter.
    pub fn num_requeues(&self, key: &K) -> usize {
        self.shared.rate_limiter.num_requeues(key)
    }

    /// Number of pending keys that are ready now. Delayed and in-flight
    /// keys are not counted.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.ready_len(self.shared.clock.now())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys handed out and not yet marked done.
    pub fn in_flight(&self) -> usize {
        self.shared.locked.read().len()
    }

    /// All pending keys in delivery order.
    pub fn pending(&self) -> Vec<PendingItem<K>> {
        scheduler::snapshot(&self.shared)
    }

    /// Stop the scheduler and release every blocked consumer.
    ///
    /// Keys already handed out stay in flight. Calling this more than
    /// once is harmless.
    pub fn shut_down(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        info!(queue = %self.shared.name, "shutting down work queue");

        let waiters = std::mem::take(&mut self.shared.state.lock().waiters);
        drop(waiters);
    }

    /// Same as [`shut_down`](Self::shut_down); pending keys are not drained.
    pub fn shut_down_with_drain(&self) {
        self.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

/// `now + after`, with `after` clamped to [`MAX_DELAY`].
fn deadline(now: Instant, after: Duration) -> Instant {
    let after = after.min(MAX_DELAY);
    // Only unrepresentable when `now` sits at the end of `Instant`'s range.
    now.checked_add(after).unwrap_or(now)
}

impl<K: QueueKey> Drop for PriorityQueue<K> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`PriorityQueue`].
pub struct QueueBuilder<K> {
    config: QueueConfig,
    rate_limiter: Option<Arc<dyn RateLimiter<K>>>,
    metrics_provider: Option<Arc<dyn MetricsProvider>>,
    clock: Arc<dyn Clock>,
}

impl<K: QueueKey> QueueBuilder<K> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            rate_limiter: None,
            metrics_provider: None,
            clock: Arc::new(RealClock),
        }
    }

    /// Replace the whole configuration, name included.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Enable metrics. Without a provider every metric event is dropped.
    pub fn metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics_provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the queue's background tasks. Must be called from within a
    /// tokio runtime.
    pub fn build(self) -> PriorityQueue<K> {
        let QueueBuilder {
            config,
            rate_limiter,
            metrics_provider,
            clock,
        } = self;

        let rate_limiter = rate_limiter.unwrap_or_else(|| {
            Arc::new(ItemExponentialFailureRateLimiter::new(
                config.backoff_base,
                config.backoff_max,
            ))
        });

        let metrics: Arc<dyn QueueMetrics<K>> = match &metrics_provider {
            Some(provider) => Arc::new(DefaultQueueMetrics::new(
                &config.name,
                provider.as_ref(),
                clock.clone(),
            )),
            None => Arc::new(NoopQueueMetrics),
        };

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            state: Mutex::new(State::new()),
            locked: RwLock::new(HashSet::new()),
            wake: Notify::new(),
            shutdown,
            rate_limiter,
            metrics,
            clock,
        });

        let span = queue_span(&config.name);
        tokio::spawn(scheduler::run(shared.clone()).instrument(span.clone()));
        if metrics_provider.is_some() {
            tokio::spawn(
                scheduler::refresh_metrics(shared.clone(), config.metrics_update_interval)
                    .instrument(span.clone()),
            );
        }
        tokio::spawn(scheduler::log_state(shared.clone(), config.log_interval).instrument(span));

        PriorityQueue { shared }
    }
}
