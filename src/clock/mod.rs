//! Sidereal clock and periodic scheduler.
//!
//! [`SuperClock`] bundles the two halves the driving loop needs every tick:
//! a [`SiderealClock`] for timestamps and observation windows, and a
//! [`Scheduler`] for the sampling and housekeeping timers. Calibrating the
//! clock re-anchors the scheduler and persists the calibration pair.

pub mod scheduler;
pub mod sidereal;
pub mod time;

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

pub use scheduler::{Scheduler, Tick, TimerCallback, TimerHandle};
pub use sidereal::{
    estimate_local_sidereal, format_sidereal, parse_sidereal, sidereal_to_solar,
    solar_to_sidereal, time_slug, RaCalibration, SiderealClock, GREEN_BANK_LONGITUDE,
    SECONDS_PER_DAY, SIDEREAL_RATE,
};
pub use time::{ManualTime, SharedTimeSource, SystemTime, TimeSource};

/// Errors from the clock layer.
#[derive(Error, Debug)]
pub enum ClockError {
    /// A sidereal time string was not `HH:MM:SS`.
    #[error("Invalid sidereal time '{0}': expected HH:MM:SS")]
    InvalidTimeString(String),

    /// The RA calibration record could not be parsed.
    #[error("RA calibration record line {line}: invalid value '{value}'")]
    RecordParse { line: usize, value: String },

    /// The RA calibration record could not be read or written.
    #[error("RA calibration record I/O error: {0}")]
    RecordIo(#[from] std::io::Error),
}

/// Sidereal clock plus the timers it paces.
pub struct SuperClock<Ctx> {
    sidereal: SiderealClock,
    scheduler: Scheduler<Ctx>,
    record_path: Option<PathBuf>,
}

impl<Ctx> SuperClock<Ctx> {
    /// Build a clock around an already-calibrated sidereal clock.
    pub fn new(source: SharedTimeSource, sidereal: SiderealClock) -> Self {
        Self {
            sidereal,
            scheduler: Scheduler::new(source),
            record_path: None,
        }
    }

    /// Restore the calibration from `path`, or estimate it for `longitude`
    /// when no usable record exists. Later calibrations are written back to `path`.
    pub fn restore(source: SharedTimeSource, path: impl Into<PathBuf>, longitude: f64) -> Self {
        let path = path.into();
        let sidereal = match RaCalibration::load(&path) {
            Ok(record) => SiderealClock::from_record(source.clone(), record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "No RA calibration, estimating sidereal time");
                SiderealClock::estimated(source.clone(), longitude)
            }
        };
        let mut clock = Self::new(source, sidereal);
        clock.record_path = Some(path);
        clock
    }

    /// Calibrate sidereal time, re-anchor all timers and persist the pair.
    pub fn calibrate(&mut self, sidereal_seconds: f64, epoch: Option<f64>) -> Result<RaCalibration, ClockError> {
        let record = self.sidereal.calibrate(sidereal_seconds, epoch);
        self.scheduler.reset_anchor_at(record.epoch);
        if let Some(path) = &self.record_path {
            record.save(path)?;
        }
        Ok(record)
    }

    /// Current sidereal seconds.
    pub fn now_sidereal(&self) -> f64 {
        self.sidereal.now_sidereal()
    }

    /// Current wall-clock seconds.
    pub fn now_epoch(&self) -> f64 {
        self.sidereal.now_epoch()
    }

    /// The sidereal half.
    pub fn sidereal(&self) -> &SiderealClock {
        &self.sidereal
    }

    /// Register a periodic timer.
    pub fn add_timer<F>(&mut self, name: impl Into<String>, period_ms: u64, callback: F) -> TimerHandle
    where
        F: FnMut(&mut Ctx, Tick) -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler.add_timer(name, period_ms, callback)
    }

    /// Re-periodize a timer.
    pub fn set_period(&mut self, handle: TimerHandle, period_ms: u64) {
        self.scheduler.set_period(handle, period_ms);
    }

    /// Cancel a timer.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.scheduler.cancel(handle);
    }

    /// Zero every timer's offset at the current instant.
    pub fn reset_anchor(&mut self) {
        self.scheduler.reset_anchor();
    }

    /// Run every due timer against `ctx`.
    pub fn run_due(&mut self, ctx: &mut Ctx) -> anyhow::Result<usize> {
        let sidereal = &self.sidereal;
        self.scheduler.run_due(ctx, |epoch| sidereal.sidereal_at(epoch))
    }

    /// The scheduler half.
    pub fn scheduler(&self) -> &Scheduler<Ctx> {
        &self.scheduler
    }
}

impl<Ctx> std::fmt::Debug for SuperClock<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperClock")
            .field("sidereal", &self.sidereal)
            .field("scheduler", &self.scheduler)
            .field("record_path", &self.record_path)
            .finish()
    }
}
