//! Fixed-capacity time-window admission counter.
//!
//! # Purpose
//! Keeps diagnostic paths (log lines, error reports) from flooding during
//! failure storms. A [`RateCounter`] admits up to `capacity` calls per
//! window and counts the rest as blocked so the caller can report how much
//! was suppressed.
//!
//! # Key invariants
//! - Within one window, calls `1..=capacity` are admitted and call
//!   `capacity + 1` is the first to be refused.
//! - The window rolls forward lazily on the first call past its boundary.
//!   Rollover resets the admitted count only.
//! - The blocked count is cleared exclusively by [`RateCounter::count_blocked`],
//!   so suppressed reports survive rollover until someone reads them.
//!
//! # Concurrency model
//! All state sits behind one short `parking_lot` mutex, which serializes
//! `allow()` and rules out lost updates.
//!
//! # Examples
//! ```rust
//! use std::time::Duration;
//! use warden_ratelimit::RateCounter;
//!
//! let counter = RateCounter::new(2, Duration::from_secs(60)).expect("counter");
//! assert!(counter.allow());
//! assert!(counter.allow());
//! assert!(!counter.allow());
//! assert_eq!(counter.count_blocked(), 1);
//! assert_eq!(counter.count_blocked(), 0);
//! ```
mod clock;

pub use clock::{Clock, SystemClock};

#[cfg(any(test, feature = "test-helpers"))]
pub use clock::MockClock;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate counter capacity must be greater than zero")]
    ZeroCapacity,
    #[error("rate counter window must be greater than zero")]
    ZeroWindow,
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug)]
struct WindowState {
    started_at: Instant,
    allowed: u64,
    blocked: u64,
}

#[derive(Debug)]
pub struct RateCounter {
    capacity: u64,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl RateCounter {
    pub fn new(capacity: u64, window: Duration) -> RateLimitResult<Self> {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    pub fn with_clock(
        capacity: u64,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> RateLimitResult<Self> {
        if capacity == 0 {
            return Err(RateLimitError::ZeroCapacity);
        }
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        let started_at = clock.now();
        Ok(Self {
            capacity,
            window,
            clock,
            state: Mutex::new(WindowState {
                started_at,
                allowed: 0,
                blocked: 0,
            }),
        })
    }

    /// Admit one call against the current window.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.started_at) >= self.window {
            // Fresh window; `blocked` carries over until it is read.
            state.started_at = now;
            state.allowed = 0;
        }
        if state.allowed < self.capacity {
            state.allowed += 1;
            true
        } else {
            state.blocked += 1;
            false
        }
    }

    /// Read and clear the number of refused calls since the previous read.
    pub fn count_blocked(&self) -> u64 {
        std::mem::take(&mut self.state.lock().blocked)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
