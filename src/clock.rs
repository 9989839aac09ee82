//! Time source for the queue.
//!
//! Everything time-dependent in the queue (readiness, backoff buckets,
//! metric ages, periodic tasks) goes through a [`Clock`] so tests can
//! drive time by hand with [`FakeClock`].

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// A boxed, sendable future resolving once a sleep has elapsed.
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Injectable time source.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> Instant;

    /// A future that resolves once `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Wall clock backed by tokio's timer.
///
/// Uses `tokio::time::Instant`, so a runtime with paused time
/// (`#[tokio::test(start_paused = true)]`) controls it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Time only moves when [`FakeClock::step`] or [`FakeClock::set`] is
/// called. Pending sleeps resolve as soon as the fake time reaches
/// their deadline.
#[derive(Debug)]
pub struct FakeClock {
    now: watch::Sender<Instant>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Advance the clock by `duration`.
    pub fn step(&self, duration: Duration) {
        self.now.send_modify(|now| *now += duration);
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, to: Instant) {
        self.now.send_if_modified(|now| {
            if to > *now {
                *now = to;
                true
            } else {
                false
            }
        });
    }

    /// Number of sleeps currently waiting on this clock.
    pub fn sleepers(&self) -> usize {
        self.now.receiver_count()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let Some(deadline) = self.now().checked_add(duration) else {
            return Box::pin(std::future::pending());
        };
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|now| *now >= deadline).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_sleep_resolves_after_step() {
        let clock = FakeClock::new();
        let mut sleep = clock.sleep(Duration::from_millis(100));

        let early = tokio::time::timeout(Duration::from_millis(10), &mut sleep).await;
        assert!(early.is_err());

        clock.step(Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(1), sleep)
            .await
            .expect("sleep should resolve once the deadline is reached");
    }

    #[tokio::test]
    async fn fake_sleep_past_the_end_of_time_never_resolves() {
        let clock = FakeClock::new();
        let sleep = clock.sleep(Duration::MAX);
        clock.step(Duration::from_secs(3600));

        let result = tokio::time::timeout(Duration::from_millis(10), sleep).await;
        assert!(result.is_err());
    }

    #[test]
    fn fake_set_never_goes_backwards() {
        let clock = FakeClock::new();
        let start = clock.now();
        clock.step(Duration::from_secs(5));
        clock.set(start);
        assert_eq!(clock.now(), start + Duration::from_secs(5));
    }
}
