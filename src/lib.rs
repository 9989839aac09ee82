//! # prioq
//!
//! De-duplicating, priority- and delay-aware work queue for controllers
//! that reconcile keys.
//!
//! Provides the queue itself ([`PriorityQueue`]), pluggable requeue
//! policies, metrics adapters (no-op or OpenTelemetry), an injectable
//! clock, and tracing setup.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod telemetry;

pub use clock::{Clock, FakeClock, RealClock};
pub use config::QueueConfig;
pub use error::{Error, Result};
pub use queue::{AddOpts, Delivery, PendingItem, PriorityQueue, QueueBuilder, QueueKey};
pub use ratelimit::RateLimiter;
