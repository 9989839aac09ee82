//! Pending items and their ordering.

use std::cmp::Ordering;
use std::time::Instant;

/// Position of a pending item in the ordered index.
///
/// Ordering: immediately-ready before delayed, earlier `ready_at`
/// first, higher priority first, then insertion order. `seq` is unique
/// per pending item, so this is a total order with no ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub ready_at: Option<Instant>,
    pub priority: i32,
    pub seq: u64,
}

impl Slot {
    /// Whether the item may be delivered at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|ready_at| ready_at <= now)
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        let readiness = match (self.ready_at, other.ready_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        };
        readiness
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-key pending state held in the item store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Item {
    pub slot: Slot,
    /// The depth metric already fired for this pending instance.
    pub counted: bool,
}

impl Item {
    /// A new pending item. Items that are ready immediately count
    /// towards depth right away; delayed ones once they become ready.
    pub fn new(seq: u64, priority: i32, ready_at: Option<Instant>) -> Self {
        Self {
            slot: Slot {
                ready_at,
                priority,
                seq,
            },
            counted: ready_at.is_none(),
        }
    }

    /// Fold a repeated add into this item: priority only goes up,
    /// readiness only moves earlier. Returns `true` when the item went
    /// from delayed to immediately ready and its depth was not counted
    /// yet.
    pub fn merge(&mut self, priority: i32, ready_at: Option<Instant>) -> bool {
        self.slot.priority = self.slot.priority.max(priority);

        match (self.slot.ready_at, ready_at) {
            (Some(_), None) => {
                self.slot.ready_at = None;
                self.count_depth()
            }
            (Some(current), Some(new)) if new < current => {
                self.slot.ready_at = Some(new);
                false
            }
            _ => false,
        }
    }

    /// Mark the depth metric as fired. Returns `true` only the first time.
    pub fn count_depth(&mut self) -> bool {
        !std::mem::replace(&mut self.counted, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn slot(ready_at: Option<Instant>, priority: i32, seq: u64) -> Slot {
        Slot {
            ready_at,
            priority,
            seq,
        }
    }

    #[test]
    fn ready_now_sorts_before_delayed() {
        let now = Instant::now();
        assert!(slot(None, -10, 9) < slot(Some(now), 10, 0));
    }

    #[test]
    fn earlier_ready_at_sorts_first() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert!(slot(Some(now), 0, 5) < slot(Some(later), 100, 0));
    }

    #[test]
    fn higher_priority_then_insertion_order() {
        let mut index = BTreeSet::new();
        index.insert(slot(None, 1, 0));
        index.insert(slot(None, 5, 1));
        index.insert(slot(None, 3, 2));
        index.insert(slot(None, 5, 3));

        let order: Vec<_> = index.iter().map(|s| (s.priority, s.seq)).collect();
        assert_eq!(order, vec![(5, 1), (5, 3), (3, 2), (1, 0)]);
    }

    #[test]
    fn equal_ready_at_falls_back_to_priority() {
        let at = Instant::now();
        assert!(slot(Some(at), 7, 3) < slot(Some(at), 2, 1));
    }

    #[test]
    fn merge_raises_priority_and_lowers_ready_at() {
        let now = Instant::now();
        let mut item = Item::new(4, 1, Some(now + Duration::from_secs(10)));

        assert!(!item.merge(0, Some(now + Duration::from_secs(20))));
        assert_eq!(item.slot.priority, 1);
        assert_eq!(item.slot.ready_at, Some(now + Duration::from_secs(10)));

        assert!(!item.merge(3, Some(now + Duration::from_secs(5))));
        assert_eq!(item.slot.priority, 3);
        assert_eq!(item.slot.ready_at, Some(now + Duration::from_secs(5)));

        assert!(item.merge(2, None));
        assert_eq!(item.slot.ready_at, None);
        assert_eq!(item.slot.seq, 4);
    }

    #[test]
    fn merge_never_delays_a_ready_item() {
        let now = Instant::now();
        let mut item = Item::new(0, 0, None);
        assert!(!item.merge(0, Some(now + Duration::from_secs(1))));
        assert_eq!(item.slot.ready_at, None);
    }

    #[test]
    fn depth_is_counted_once_per_item() {
        let now = Instant::now();
        assert!(Item::new(0, 0, None).counted);

        let mut item = Item::new(1, 0, Some(now + Duration::from_secs(1)));
        assert!(!item.counted);
        assert!(item.count_depth());
        assert!(!item.count_depth());

        // Already counted when its delay passed, so merging to ready-now
        // must not count it again.
        assert!(!item.merge(0, None));
        assert_eq!(item.slot.ready_at, None);
    }
}
