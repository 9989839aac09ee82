//! OpenTelemetry-backed queue instruments.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"prioq"` meter and carry a `name`
//! attribute identifying the queue.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};

use crate::metrics::{
    CounterMetric, GaugeMetric, HistogramMetric, MetricsProvider, SettableGaugeMetric,
};

/// Returns the shared meter for prioq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("prioq")
}

fn queue_attrs(name: &str) -> [KeyValue; 1] {
    [KeyValue::new("name", name.to_string())]
}

/// [`MetricsProvider`] publishing through the global OTel meter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtelMetricsProvider;

struct OtelGauge {
    gauge: UpDownCounter<i64>,
    attrs: [KeyValue; 1],
}

impl GaugeMetric for OtelGauge {
    fn inc(&self) {
        self.gauge.add(1, &self.attrs);
    }

    fn dec(&self) {
        self.gauge.add(-1, &self.attrs);
    }
}

struct OtelSettableGauge {
    gauge: Gauge<f64>,
    attrs: [KeyValue; 1],
}

impl SettableGaugeMetric for OtelSettableGauge {
    fn set(&self, value: f64) {
        self.gauge.record(value, &self.attrs);
    }
}

struct OtelCounter {
    counter: Counter<u64>,
    attrs: [KeyValue; 1],
}

impl CounterMetric for OtelCounter {
    fn inc(&self) {
        self.counter.add(1, &self.attrs);
    }
}

struct OtelHistogram {
    histogram: Histogram<f64>,
    attrs: [KeyValue; 1],
}

impl HistogramMetric for OtelHistogram {
    fn observe(&self, value: f64) {
        self.histogram.record(value, &self.attrs);
    }
}

fn counter(metric: &'static str, description: &'static str, name: &str) -> Box<dyn CounterMetric> {
    Box::new(OtelCounter {
        counter: meter()
            .u64_counter(metric)
            .with_description(description)
            .build(),
        attrs: queue_attrs(name),
    })
}

fn histogram(
    metric: &'static str,
    description: &'static str,
    name: &str,
) -> Box<dyn HistogramMetric> {
    Box::new(OtelHistogram {
        histogram: meter()
            .f64_histogram(metric)
            .with_description(description)
            .with_unit("s")
            .build(),
        attrs: queue_attrs(name),
    })
}

fn settable_gauge(
    metric: &'static str,
    description: &'static str,
    name: &str,
) -> Box<dyn SettableGaugeMetric> {
    Box::new(OtelSettableGauge {
        gauge: meter()
            .f64_gauge(metric)
            .with_description(description)
            .with_unit("s")
            .build(),
        attrs: queue_attrs(name),
    })
}

impl MetricsProvider for OtelMetricsProvider {
    /// UpDownCounter: keys ready and waiting for a consumer.
    fn new_depth_metric(&self, name: &str) -> Box<dyn GaugeMetric> {
        Box::new(OtelGauge {
            gauge: meter()
                .i64_up_down_counter("prioq.workqueue.depth")
                .with_description("Current depth of the work queue")
                .build(),
            attrs: queue_attrs(name),
        })
    }

    /// Counter: keys that became ready.
    fn new_adds_metric(&self, name: &str) -> Box<dyn CounterMetric> {
        counter(
            "prioq.workqueue.adds",
            "Total number of adds handled by the work queue",
            name,
        )
    }

    /// Histogram: time between becoming ready and being handed out.
    fn new_latency_metric(&self, name: &str) -> Box<dyn HistogramMetric> {
        histogram(
            "prioq.workqueue.queue_duration",
            "How long a key stays in the work queue before being requested",
            name,
        )
    }

    /// Histogram: time between hand-out and `done`.
    fn new_work_duration_metric(&self, name: &str) -> Box<dyn HistogramMetric> {
        histogram(
            "prioq.workqueue.work_duration",
            "How long processing a key from the work queue takes",
            name,
        )
    }

    /// Gauge: summed age of all in-flight keys.
    fn new_unfinished_work_seconds_metric(&self, name: &str) -> Box<dyn SettableGaugeMetric> {
        settable_gauge(
            "prioq.workqueue.unfinished_work",
            "Seconds of work in progress that has not yet been observed by work_duration",
            name,
        )
    }

    /// Gauge: age of the oldest in-flight key.
    fn new_longest_running_processor_seconds_metric(
        &self,
        name: &str,
    ) -> Box<dyn SettableGaugeMetric> {
        settable_gauge(
            "prioq.workqueue.longest_running_processor",
            "Seconds the longest running processor has been running",
            name,
        )
    }

    /// Counter: delayed (re)queues.
    fn new_retries_metric(&self, name: &str) -> Box<dyn CounterMetric> {
        counter(
            "prioq.workqueue.retries",
            "Total number of retries handled by the work queue",
            name,
        )
    }
}
