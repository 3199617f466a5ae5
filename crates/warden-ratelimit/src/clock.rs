// Time source for window accounting.
// Production code reads the monotonic clock; tests drive time by hand.
use std::fmt::Debug;
use std::time::Instant;

/// Port for reading the current instant.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use super::Clock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Manually advanced clock. Clones share the same current time.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        pub fn new(start: Instant) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.current.lock() += by;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn mock_clock_clones_share_time() {
        let start = Instant::now();
        let clock = MockClock::new(start);
        let other = clock.clone();
        other.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), start + Duration::from_secs(3));
    }
}
