// Rate-limited diagnostics for hot failure paths.
use std::time::Duration;
use warden_ratelimit::{RateCounter, RateLimitResult};

/// Gate for a noisy log line.
///
/// `admit` returns `Some(suppressed)` when the line may be written, where
/// `suppressed` is how many lines were dropped since the last admitted one.
#[derive(Debug)]
pub struct LogThrottle {
    name: &'static str,
    counter: RateCounter,
}

impl LogThrottle {
    pub fn new(name: &'static str, capacity: u64, window: Duration) -> RateLimitResult<Self> {
        Ok(Self {
            name,
            counter: RateCounter::new(capacity, window)?,
        })
    }

    pub fn from_counter(name: &'static str, counter: RateCounter) -> Self {
        Self { name, counter }
    }

    pub fn admit(&self) -> Option<u64> {
        if self.counter.allow() {
            Some(self.counter.count_blocked())
        } else {
            metrics::counter!("warden_ratelimit_blocked_total", "throttle" => self.name)
                .increment(1);
            None
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
