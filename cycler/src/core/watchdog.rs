//! Cooperative stall timer.
//!
//! `deadline = last_reset_at + timeout`. The orchestrator polls [`Watchdog::expired`]
//! from its event loop; there is no background thread. Callers pass `now`
//! explicitly so tests can drive time without sleeping.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    last_reset_at: Instant,
    enabled: bool,
}

impl Watchdog {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_reset_at: now,
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.last_reset_at + self.timeout
    }

    /// Restart the countdown from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_reset_at = now;
    }

    /// True once `now >= deadline`. Always false while disabled.
    pub fn expired(&self, now: Instant) -> bool {
        self.enabled && now >= self.deadline()
    }

    /// Time since the last reset, saturating at zero.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_reset_at)
    }

    /// Stop raising stalls for the lifetime of this watchdog. Each cycle gets
    /// a fresh one.
    pub fn disable(&mut self) {
        self.enabled = false;
    }
}
