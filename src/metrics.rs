//! Queue instrumentation.
//!
//! The queue reports lifecycle events through [`QueueMetrics`]. The
//! default implementation, [`DefaultQueueMetrics`], turns those events
//! into depth / adds / latency / work duration / unfinished work /
//! retries instruments obtained from a pluggable [`MetricsProvider`].
//! Without a provider the queue uses [`NoopQueueMetrics`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Gauge that moves up and down by one.
pub trait GaugeMetric: Send + Sync {
    fn inc(&self);
    fn dec(&self);
}

/// Gauge that is set to an absolute value.
pub trait SettableGaugeMetric: Send + Sync {
    fn set(&self, value: f64);
}

/// Monotonic counter.
pub trait CounterMetric: Send + Sync {
    fn inc(&self);
}

/// Distribution of observed values (seconds).
pub trait HistogramMetric: Send + Sync {
    fn observe(&self, value: f64);
}

/// Factory for the instruments of one named queue.
pub trait MetricsProvider: Send + Sync {
    fn new_depth_metric(&self, name: &str) -> Box<dyn GaugeMetric>;
    fn new_adds_metric(&self, name: &str) -> Box<dyn CounterMetric>;
    fn new_latency_metric(&self, name: &str) -> Box<dyn HistogramMetric>;
    fn new_work_duration_metric(&self, name: &str) -> Box<dyn HistogramMetric>;
    fn new_unfinished_work_seconds_metric(&self, name: &str) -> Box<dyn SettableGaugeMetric>;
    fn new_longest_running_processor_seconds_metric(
        &self,
        name: &str,
    ) -> Box<dyn SettableGaugeMetric>;
    fn new_retries_metric(&self, name: &str) -> Box<dyn CounterMetric>;
}

// ---------------------------------------------------------------------------
// Queue-level events
// ---------------------------------------------------------------------------

/// Events the queue reports while moving keys through their lifecycle.
pub trait QueueMetrics<K>: Send + Sync {
    /// A key became ready and now counts towards depth.
    fn add(&self, key: &K);
    /// A key was handed to a consumer.
    fn get(&self, key: &K);
    /// A consumer finished a key.
    fn done(&self, key: &K);
    /// A delayed (re)queue was requested.
    fn retry(&self);
    /// Refresh the unfinished-work gauges from in-flight ages.
    fn update_unfinished_work(&self);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueueMetrics;

impl<K> QueueMetrics<K> for NoopQueueMetrics {
    fn add(&self, _key: &K) {}
    fn get(&self, _key: &K) {}
    fn done(&self, _key: &K) {}
    fn retry(&self) {}
    fn update_unfinished_work(&self) {}
}

struct Timestamps<K> {
    added: HashMap<K, Instant>,
    processing: HashMap<K, Instant>,
}

/// Standard queue instrumentation on top of a [`MetricsProvider`].
pub struct DefaultQueueMetrics<K> {
    clock: Arc<dyn Clock>,
    depth: Box<dyn GaugeMetric>,
    adds: Box<dyn CounterMetric>,
    latency: Box<dyn HistogramMetric>,
    work_duration: Box<dyn HistogramMetric>,
    unfinished_work_seconds: Box<dyn SettableGaugeMetric>,
    longest_running_processor: Box<dyn SettableGaugeMetric>,
    retries: Box<dyn CounterMetric>,
    timestamps: Mutex<Timestamps<K>>,
}

impl<K> DefaultQueueMetrics<K> {
    pub fn new(name: &str, provider: &dyn MetricsProvider, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            depth: provider.new_depth_metric(name),
            adds: provider.new_adds_metric(name),
            latency: provider.new_latency_metric(name),
            work_duration: provider.new_work_duration_metric(name),
            unfinished_work_seconds: provider.new_unfinished_work_seconds_metric(name),
            longest_running_processor: provider
                .new_longest_running_processor_seconds_metric(name),
            retries: provider.new_retries_metric(name),
            timestamps: Mutex::new(Timestamps {
                added: HashMap::new(),
                processing: HashMap::new(),
            }),
        }
    }
}

impl<K> QueueMetrics<K> for DefaultQueueMetrics<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn add(&self, key: &K) {
        self.adds.inc();
        self.depth.inc();

        let now = self.clock.now();
        self.timestamps.lock().added.entry(key.clone()).or_insert(now);
    }

    fn get(&self, key: &K) {
        self.depth.dec();

        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock();
        timestamps.processing.insert(key.clone(), now);
        if let Some(added) = timestamps.added.remove(key) {
            self.latency
                .observe(now.saturating_duration_since(added).as_secs_f64());
        }
    }

    fn done(&self, key: &K) {
        let now = self.clock.now();
        if let Some(started) = self.timestamps.lock().processing.remove(key) {
            self.work_duration
                .observe(now.saturating_duration_since(started).as_secs_f64());
        }
    }

    fn retry(&self) {
        self.retries.inc();
    }

    fn update_unfinished_work(&self) {
        let now = self.clock.now();
        let (total, oldest) = self.timestamps.lock().processing.values().fold(
            (0.0_f64, 0.0_f64),
            |(total, oldest), started| {
                let age = now.saturating_duration_since(*started).as_secs_f64();
                (total + age, oldest.max(age))
            },
        );
        self.unfinished_work_seconds.set(total);
        self.longest_running_processor.set(oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        depth: AtomicI64,
        adds: AtomicI64,
        retries: AtomicI64,
        latency: Mutex<Vec<f64>>,
        work: Mutex<Vec<f64>>,
        unfinished: Mutex<f64>,
        longest: Mutex<f64>,
    }

    struct Depth(Arc<Recorded>);
    impl GaugeMetric for Depth {
        fn inc(&self) {
            self.0.depth.fetch_add(1, Ordering::SeqCst);
        }
        fn dec(&self) {
            self.0.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Count(Arc<Recorded>, bool);
    impl CounterMetric for Count {
        fn inc(&self) {
            let counter = if self.1 { &self.0.adds } else { &self.0.retries };
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Observe(Arc<Recorded>, bool);
    impl HistogramMetric for Observe {
        fn observe(&self, value: f64) {
            let values = if self.1 { &self.0.latency } else { &self.0.work };
            values.lock().push(value);
        }
    }

    struct Set(Arc<Recorded>, bool);
    impl SettableGaugeMetric for Set {
        fn set(&self, value: f64) {
            let slot = if self.1 { &self.0.unfinished } else { &self.0.longest };
            *slot.lock() = value;
        }
    }

    struct Provider(Arc<Recorded>);
    impl MetricsProvider for Provider {
        fn new_depth_metric(&self, _: &str) -> Box<dyn GaugeMetric> {
            Box::new(Depth(self.0.clone()))
        }
        fn new_adds_metric(&self, _: &str) -> Box<dyn CounterMetric> {
            Box::new(Count(self.0.clone(), true))
        }
        fn new_latency_metric(&self, _: &str) -> Box<dyn HistogramMetric> {
            Box::new(Observe(self.0.clone(), true))
        }
        fn new_work_duration_metric(&self, _: &str) -> Box<dyn HistogramMetric> {
            Box::new(Observe(self.0.clone(), false))
        }
        fn new_unfinished_work_seconds_metric(&self, _: &str) -> Box<dyn SettableGaugeMetric> {
            Box::new(Set(self.0.clone(), true))
        }
        fn new_longest_running_processor_seconds_metric(
            &self,
            _: &str,
        ) -> Box<dyn SettableGaugeMetric> {
            Box::new(Set(self.0.clone(), false))
        }
        fn new_retries_metric(&self, _: &str) -> Box<dyn CounterMetric> {
            Box::new(Count(self.0.clone(), false))
        }
    }

    #[test]
    fn tracks_latency_work_duration_and_unfinished_work() {
        let recorded = Arc::new(Recorded::default());
        let clock = Arc::new(FakeClock::new());
        let metrics: DefaultQueueMetrics<&str> =
            DefaultQueueMetrics::new("test", &Provider(recorded.clone()), clock.clone());

        metrics.add(&"a");
        metrics.add(&"b");
        assert_eq!(recorded.depth.load(Ordering::SeqCst), 2);
        assert_eq!(recorded.adds.load(Ordering::SeqCst), 2);

        clock.step(Duration::from_secs(2));
        metrics.get(&"a");
        assert_eq!(recorded.depth.load(Ordering::SeqCst), 1);
        assert_eq!(*recorded.latency.lock(), vec![2.0]);

        clock.step(Duration::from_secs(3));
        metrics.get(&"b");
        clock.step(Duration::from_secs(1));
        metrics.update_unfinished_work();
        assert_eq!(*recorded.unfinished.lock(), 5.0);
        assert_eq!(*recorded.longest.lock(), 4.0);

        metrics.done(&"a");
        assert_eq!(*recorded.work.lock(), vec![4.0]);

        metrics.retry();
        assert_eq!(recorded.retries.load(Ordering::SeqCst), 1);
    }
}
