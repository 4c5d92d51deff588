//! Receive-path time source.
//!
//! Everything that needs a timestamp (packet arrival, vsync epochs, NACK
//! pacing, statistics intervals) reads the same monotonic clock so tests can
//! drive time explicitly.

use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary epoch.
    fn now_ns(&self) -> u64;
}

/// Wall-process monotonic clock.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { start: Instant::now() })
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Manually advanced clock for deterministic tests.
    pub struct TestClock {
        ns: AtomicU64,
    }

    impl TestClock {
        pub fn new(start_ns: u64) -> Arc<Self> {
            Arc::new(Self { ns: AtomicU64::new(start_ns) })
        }

        pub fn set(&self, ns: u64) {
            self.ns.store(ns, Ordering::Release);
        }

        pub fn advance(&self, delta_ns: u64) {
            self.ns.fetch_add(delta_ns, Ordering::AcqRel);
        }
    }

    impl Clock for TestClock {
        fn now_ns(&self) -> u64 {
            self.ns.load(Ordering::Acquire)
        }
    }
}
