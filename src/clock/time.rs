//! Wall-clock sources.
//!
//! Everything that needs "now" in this crate asks a [`TimeSource`] instead of
//! reading the system clock directly. Production code uses [`SystemTime`];
//! tests and simulations drive a [`ManualTime`] so that scheduler catch-up and
//! phase durations can be exercised without sleeping.

use parking_lot::Mutex;
use std::sync::Arc;

/// Source of wall-clock time as fractional Unix seconds.
pub trait TimeSource: Send + Sync {
    /// Current instant in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Shared handle to a time source.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// The host's real-time clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualTime {
    now: Mutex<f64>,
}

impl ManualTime {
    /// Create a clock frozen at `start`.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a shareable clock frozen at `start`.
    pub fn shared(start: f64) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: f64) {
        *self.now.lock() = instant;
    }

    /// Move forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
