//! Time source for poll loops.
//!
//! Polling sleeps through a [`Clock`] so tests can advance time instantly.

use std::thread;
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `thread::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Deadline helper for bounded waits.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| clock.now() + t),
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        self.at.is_some_and(|at| clock.now() >= at)
    }
}
