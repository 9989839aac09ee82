//! Background tasks driving a queue.
//!
//! `run` is the single coordinator that moves ready keys to waiting
//! consumers. It wakes on the coalesced `wake` signal (add, get, done),
//! on a timer for the earliest delayed key, or on shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{Level, debug};

use super::item::{Item, Slot};
use super::{Handoff, PendingItem, QueueKey, Shared, State};
use crate::clock::Sleep;
use crate::telemetry::queue::record_pending_items;

pub(super) async fn run<K: QueueKey>(shared: Arc<Shared<K>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut next_ready: Option<Sleep> = None;

    debug!("scheduler started");
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = shared.wake.notified() => {}
            _ = elapsed(&mut next_ready) => {}
        }

        next_ready = dispatch(&shared).map(|wait| shared.clock.sleep(wait));
    }
    debug!("scheduler stopped");
}

/// Periodically refresh the unfinished-work gauges.
pub(super) async fn refresh_metrics<K: QueueKey>(shared: Arc<Shared<K>>, every: Duration) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = shared.clock.sleep(every) => shared.metrics.update_unfinished_work(),
        }
    }
}

/// Periodically dump pending keys when trace logging is on.
pub(super) async fn log_state<K: QueueKey>(shared: Arc<Shared<K>>, every: Duration) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = shared.clock.sleep(every) => {
                if tracing::enabled!(Level::TRACE) {
                    let items = snapshot(&shared);
                    let in_flight = shared.locked.read().len();
                    record_pending_items(&shared.name, &items, in_flight);
                }
            }
        }
    }
}

/// One scheduler pass. Returns how long until the next delayed key
/// becomes ready, if any.
///
/// Walks the index best-first. Ready keys fire their deferred depth
/// metric; ready keys that are not in flight go to waiting consumers
/// while any remain. The walk stops at the first key that is not yet
/// ready since everything after it is later still.
fn dispatch<K: QueueKey>(shared: &Shared<K>) -> Option<Duration> {
    let mut state = shared.state.lock();
    let mut locked = shared.locked.write();
    let now = shared.clock.now();

    let State {
        items,
        index,
        waiters,
        ..
    } = &mut *state;

    waiters.retain(|waiter| !waiter.is_closed());
    let mut capacity = waiters.len();
    let mut next_wake = None;
    let mut picked = Vec::new();

    for (slot, key) in index.iter() {
        if let Some(ready_at) = slot.ready_at {
            if ready_at > now {
                next_wake = Some(ready_at - now);
                break;
            }
            if items.get_mut(key).is_some_and(Item::count_depth) {
                shared.metrics.add(key);
            }
        }

        if capacity == 0 || locked.contains(key) {
            continue;
        }
        capacity -= 1;
        picked.push(*slot);
    }

    for slot in picked {
        let Some(key) = index.remove(&slot) else {
            continue;
        };

        if !hand_off(waiters, key.clone(), slot) {
            // Every remaining consumer went away since the pass started.
            index.insert(slot, key);
            break;
        }

        items.remove(&key);
        shared.metrics.get(&key);
        locked.insert(key);
    }

    next_wake
}

/// Give the key to the oldest consumer still waiting.
fn hand_off<K>(waiters: &mut VecDeque<Handoff<K>>, key: K, slot: Slot) -> bool {
    let mut delivery = (key, slot);
    while let Some(waiter) = waiters.pop_front() {
        match waiter.send(delivery) {
            Ok(()) => return true,
            Err(returned) => delivery = returned,
        }
    }
    false
}

pub(super) fn snapshot<K: QueueKey>(shared: &Shared<K>) -> Vec<PendingItem<K>> {
    let state = shared.state.lock();
    let now = shared.clock.now();
    state
        .index
        .iter()
        .map(|(slot, key)| PendingItem {
            key: key.clone(),
            priority: slot.priority,
            seq: slot.seq,
            ready_in: slot
                .ready_at
                .filter(|ready_at| *ready_at > now)
                .map(|ready_at| ready_at - now),
        })
        .collect()
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

async fn elapsed(timer: &mut Option<Sleep>) {
    match timer {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}
