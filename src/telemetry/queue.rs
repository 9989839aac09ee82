//! Span and log helpers for queue background tasks.

use std::fmt::Debug;

use tracing::Span;

use crate::queue::PendingItem;

/// Span wrapping every background task of one queue.
pub fn queue_span(name: &str) -> Span {
    tracing::info_span!("workqueue", "workqueue.name" = name)
}

/// Emit the periodic dump of pending keys at trace level.
pub fn record_pending_items<K: Debug>(name: &str, items: &[PendingItem<K>], in_flight: usize) {
    tracing::trace!(
        queue = name,
        pending = items.len(),
        in_flight,
        items = ?items,
        "workqueue_items"
    );
}
