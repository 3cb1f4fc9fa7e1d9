//! Observation state machine.
//!
//! An observation runs through a fixed sequence of phases:
//!
//! ```text
//! Idle ──> Cal1 ──> Bg1 ──> Waiting ──> Data ──> Cal2 ──> Bg2 ──> Complete
//! ```
//!
//! Each sample the driving loop asks [`Observation::decide`] what should
//! happen, applies the persistence part with [`Observation::record`], and
//! acts on the returned [`Signal`]. Signals other than `NoAction` and `Beep`
//! ask the operator to do something; once they have, the loop calls
//! [`Observation::next`] to enter the following phase.
//!
//! Scan, Survey and Spectrum share everything except the data phase, which
//! is delegated to a [`DataStrategy`].

pub mod output;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{sidereal_to_solar, SiderealClock, SECONDS_PER_DAY};
use crate::measurement::CalibratedPoint;
use output::{ObservationMetadata, ObservationOutput};

/// Slack before the first calibration for the operator to respond, seconds.
pub const OPERATOR_BUFFER: f64 = 30.0;

/// Data window length forced on Spectrum observations, seconds.
pub const SPECTRUM_WINDOW: f64 = 180.0;

/// Telescope name used when none is configured.
pub const DEFAULT_TELESCOPE: &str = "The Mighty Forty";

/// Errors raised while configuring or recording an observation.
#[derive(Error, Debug)]
pub enum ObservationError {
    /// No minimum declination given.
    #[error("Minimum declination is not defined")]
    MissingMinDeclination,

    /// Survey observations need both bounds.
    #[error("Survey requires a maximum declination")]
    MissingMaxDeclination,

    /// Maximum declination not above minimum.
    #[error("Maximum declination {max} must be greater than minimum declination {min}")]
    InvalidDeclinationWindow { min: f64, max: f64 },

    /// Data window ends before it starts.
    #[error("Observation window end {end} must be after start {start}")]
    InvalidWindow { start: f64, end: f64 },

    /// No data window set.
    #[error("Observation window is not set")]
    WindowNotSet,

    /// Sampling rate outside (0, 2000] Hz.
    #[error("Sampling rate must be positive and at most 2000 Hz, got {0}")]
    InvalidRate(f64),

    /// Phase durations must be positive.
    #[error("Phase duration must be positive, got {0}")]
    InvalidDuration(f64),

    /// Another observation is already staged or running.
    #[error("Observation '{0}' is already in progress")]
    AlreadyRunning(String),

    /// Writing observation output failed.
    #[error("Observation output error: {0}")]
    Output(#[from] std::io::Error),
}

// =============================================================================
// States and signals
// =============================================================================

/// Observation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationState {
    /// Configured, not yet started
    Idle,
    /// First calibration
    Cal1,
    /// First background
    Bg1,
    /// Waiting for the data window
    Waiting,
    /// Collecting data
    Data,
    /// Second calibration
    Cal2,
    /// Second background
    Bg2,
    /// Finished; output closed
    Complete,
    /// Never entered by the normal sequence; only reachable by override
    Invalid,
}

impl std::fmt::Display for ObservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationState::Idle => write!(f, "Idle"),
            ObservationState::Cal1 => write!(f, "Calibration 1"),
            ObservationState::Bg1 => write!(f, "Background 1"),
            ObservationState::Waiting => write!(f, "Waiting"),
            ObservationState::Data => write!(f, "Data"),
            ObservationState::Cal2 => write!(f, "Calibration 2"),
            ObservationState::Bg2 => write!(f, "Background 2"),
            ObservationState::Complete => write!(f, "Complete"),
            ObservationState::Invalid => write!(f, "Invalid"),
        }
    }
}

impl ObservationState {
    /// The state `next()` moves to; terminal states map to themselves.
    pub fn successor(self) -> Self {
        match self {
            ObservationState::Idle => ObservationState::Cal1,
            ObservationState::Cal1 => ObservationState::Bg1,
            ObservationState::Bg1 => ObservationState::Waiting,
            ObservationState::Waiting => ObservationState::Data,
            ObservationState::Data => ObservationState::Cal2,
            ObservationState::Cal2 => ObservationState::Bg2,
            ObservationState::Bg2 => ObservationState::Complete,
            ObservationState::Complete => ObservationState::Complete,
            ObservationState::Invalid => ObservationState::Invalid,
        }
    }

    /// Calibration phase (either one).
    pub fn is_calibration(self) -> bool {
        matches!(self, ObservationState::Cal1 | ObservationState::Cal2)
    }

    /// Background phase (either one).
    pub fn is_background(self) -> bool {
        matches!(self, ObservationState::Bg1 | ObservationState::Bg2)
    }

    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ObservationState::Complete | ObservationState::Invalid)
    }
}

/// What the observation wants from the driving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Keep sampling
    NoAction,
    /// Audible cue (Spectrum frequency step)
    Beep,
    /// Operator should enable the calibration source
    StartCalibration,
    /// Operator should point off-source for background
    StartBackground,
    /// Background done; wait for the data window
    StartWait,
    /// Data window opened
    StartData,
    /// Generic advance
    Next,
    /// Telescope is south of the survey window
    SendTelescopeNorth,
    /// Telescope is north of the survey window
    SendTelescopeSouth,
    /// Telescope is back inside the survey window
    EndSendTelescope,
    /// Window closed mid-sweep; finish the sweep
    FinishSweep,
    /// Observation over
    Finished,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl Signal {
    /// Survey steering signals.
    pub fn is_directional(self) -> bool {
        matches!(self, Signal::SendTelescopeNorth | Signal::SendTelescopeSouth)
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// What to write for the current sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    /// Nothing
    Nothing,
    /// The calibrated point
    Point,
    /// A phase-boundary separator
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DataUpdate {
    LeftWindow,
    EnteredWindow,
    Beeped(f64),
}

/// The outcome of [`Observation::decide`]: a signal and a persistence effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Signal for the driving loop
    pub signal: Signal,
    /// What [`Observation::record`] writes
    pub persist: Persist,
    update: Option<DataUpdate>,
}

impl Decision {
    fn new(signal: Signal, persist: Persist) -> Self {
        Self {
            signal,
            persist,
            update: None,
        }
    }

    fn only(signal: Signal) -> Self {
        Self::new(signal, Persist::Nothing)
    }

    fn with_update(mut self, update: DataUpdate) -> Self {
        self.update = Some(update);
        self
    }
}

// =============================================================================
// Observation kinds
// =============================================================================

/// Observation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationKind {
    /// Fixed declination, drift through a right-ascension window
    Scan,
    /// Sweep between two declinations across the window
    Survey,
    /// Fixed declination, stepped receiver frequency
    Spectrum,
}

impl std::fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationKind::Scan => write!(f, "Scan"),
            ObservationKind::Survey => write!(f, "Survey"),
            ObservationKind::Spectrum => write!(f, "Spectrum"),
        }
    }
}

/// Data-phase behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum DataStrategy {
    /// Record every point.
    Scan,
    /// Steer the operator between declination bounds, counting sweeps.
    Survey {
        /// Telescope currently outside the declination window
        outside: bool,
        /// Completed entries into the window
        sweeps: u32,
    },
    /// Record every point and beep once per interval.
    Spectrum {
        /// Seconds between frequency steps
        interval: f64,
        /// When the last beep (or first point) happened
        last_beep: Option<f64>,
        /// Fraction of the interval after which to beep, absorbing polling jitter
        margin: f64,
    },
}

impl DataStrategy {
    fn for_kind(kind: ObservationKind) -> Self {
        match kind {
            ObservationKind::Scan => DataStrategy::Scan,
            ObservationKind::Survey => DataStrategy::Survey {
                outside: true,
                sweeps: 0,
            },
            ObservationKind::Spectrum => DataStrategy::Spectrum {
                interval: 1.0,
                last_beep: None,
                margin: 0.97,
            },
        }
    }

    fn kind(&self) -> ObservationKind {
        match self {
            DataStrategy::Scan => ObservationKind::Scan,
            DataStrategy::Survey { .. } => ObservationKind::Survey,
            DataStrategy::Spectrum { .. } => ObservationKind::Spectrum,
        }
    }

    fn decide(&self, point: &CalibratedPoint, t: f64, min_dec: f64, max_dec: Option<f64>) -> Decision {
        match self {
            DataStrategy::Scan => Decision::new(Signal::NoAction, Persist::Point),
            DataStrategy::Survey { outside, .. } => {
                let max_dec = max_dec.unwrap_or(f64::INFINITY);
                let direction = if point.dec < min_dec {
                    Some(Signal::SendTelescopeNorth)
                } else if point.dec > max_dec {
                    Some(Signal::SendTelescopeSouth)
                } else {
                    None
                };
                match (direction, *outside) {
                    (Some(signal), false) => {
                        Decision::new(signal, Persist::Separator).with_update(DataUpdate::LeftWindow)
                    }
                    (Some(signal), true) => Decision::only(signal),
                    (None, true) => Decision::only(Signal::EndSendTelescope)
                        .with_update(DataUpdate::EnteredWindow),
                    (None, false) => Decision::new(Signal::NoAction, Persist::Point),
                }
            }
            DataStrategy::Spectrum {
                interval,
                last_beep,
                margin,
            } => match last_beep {
                None => Decision::new(Signal::NoAction, Persist::Point).with_update(DataUpdate::Beeped(t)),
                Some(last) if t - last < margin * interval => {
                    Decision::new(Signal::NoAction, Persist::Point)
                }
                Some(_) => Decision::new(Signal::Beep, Persist::Point).with_update(DataUpdate::Beeped(t)),
            },
        }
    }

    fn apply(&mut self, update: DataUpdate) {
        match (self, update) {
            (DataStrategy::Survey { outside, .. }, DataUpdate::LeftWindow) => *outside = true,
            (DataStrategy::Survey { outside, sweeps }, DataUpdate::EnteredWindow) => {
                *outside = false;
                *sweeps += 1;
            }
            (DataStrategy::Spectrum { last_beep, .. }, DataUpdate::Beeped(t)) => *last_beep = Some(t),
            (strategy, update) => {
                warn!(?update, kind = %strategy.kind(), "Ignoring data update for another strategy")
            }
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

/// One observation, from configuration to completion.
#[derive(Debug)]
pub struct Observation {
    name: String,
    telescope: String,
    strategy: DataStrategy,
    output: ObservationOutput,

    cal_duration: f64,
    bg_duration: f64,
    cal_rate: f64,
    data_rate: f64,
    rate: f64,

    state: ObservationState,
    window: Option<(f64, f64)>,
    min_dec: Option<f64>,
    max_dec: Option<f64>,

    started_at: Option<f64>,
    finished_at: Option<f64>,
    cal_start: Option<f64>,
    bg_start: Option<f64>,
    data_start: Option<f64>,
}

impl Observation {
    /// An unconfigured observation writing to `output`.
    pub fn new(kind: ObservationKind, name: impl Into<String>, output: ObservationOutput) -> Self {
        let (cal_duration, bg_duration, cal_rate, data_rate) = match kind {
            ObservationKind::Spectrum => (20.0, 20.0, 3.0, 10.0),
            ObservationKind::Scan | ObservationKind::Survey => (60.0, 60.0, 1.0, 6.0),
        };
        Self {
            name: name.into(),
            telescope: DEFAULT_TELESCOPE.to_string(),
            strategy: DataStrategy::for_kind(kind),
            output,
            cal_duration,
            bg_duration,
            cal_rate,
            data_rate,
            rate: cal_rate,
            state: ObservationState::Idle,
            window: None,
            min_dec: None,
            max_dec: None,
            started_at: None,
            finished_at: None,
            cal_start: None,
            bg_start: None,
            data_start: None,
        }
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Set the data window in Unix seconds.
    ///
    /// Spectrum observations always get a fixed-length window from `start`.
    pub fn set_window(&mut self, start: f64, end: f64) -> Result<(), ObservationError> {
        let end = match self.kind() {
            ObservationKind::Spectrum => start + SPECTRUM_WINDOW,
            _ => end,
        };
        if !(end > start) {
            return Err(ObservationError::InvalidWindow { start, end });
        }
        self.window = Some((start, end));
        Ok(())
    }

    /// Set the data window from sidereal times of day, resolved against `clock`.
    ///
    /// The start is taken in the current sidereal day; an end earlier than
    /// the start is taken in the following one.
    pub fn set_sidereal_window(
        &mut self,
        start_sidereal: f64,
        end_sidereal: f64,
        clock: &SiderealClock,
    ) -> Result<(), ObservationError> {
        let (start, end) = resolve_sidereal_window(clock, start_sidereal, end_sidereal);
        self.set_window(start, end)
    }

    /// Set the declination window. `min` is required; `max`, if given, must exceed it.
    ///
    /// On error the previous window is left untouched.
    pub fn set_declination(&mut self, min: Option<f64>, max: Option<f64>) -> Result<(), ObservationError> {
        let min = min.ok_or(ObservationError::MissingMinDeclination)?;
        if let Some(max) = max {
            if !(max > min) {
                return Err(ObservationError::InvalidDeclinationWindow { min, max });
            }
        }
        if self.kind() == ObservationKind::Survey && max.is_none() {
            return Err(ObservationError::MissingMaxDeclination);
        }
        self.min_dec = Some(min);
        self.max_dec = max;
        Ok(())
    }

    /// Sampling rate during the data phase, Hz.
    ///
    /// The rate must leave a sampling period of at least one millisecond.
    pub fn set_data_rate(&mut self, rate: f64) -> Result<(), ObservationError> {
        if !(rate > 0.0 && rate.is_finite()) || period_for(rate) == 0 {
            return Err(ObservationError::InvalidRate(rate));
        }
        self.data_rate = rate;
        if self.state == ObservationState::Data {
            self.rate = rate;
        }
        Ok(())
    }

    /// Calibration and background durations, seconds.
    pub fn set_durations(&mut self, calibration: f64, background: f64) -> Result<(), ObservationError> {
        for duration in [calibration, background] {
            if !(duration > 0.0) {
                return Err(ObservationError::InvalidDuration(duration));
            }
        }
        self.cal_duration = calibration;
        self.bg_duration = background;
        Ok(())
    }

    /// Seconds between Spectrum beeps. Ignored by other kinds.
    pub fn set_beep_interval(&mut self, seconds: f64) -> Result<(), ObservationError> {
        if !(seconds > 0.0) {
            return Err(ObservationError::InvalidDuration(seconds));
        }
        if let DataStrategy::Spectrum { interval, .. } = &mut self.strategy {
            *interval = seconds;
        }
        Ok(())
    }

    /// Telescope name for the metadata block.
    pub fn set_telescope(&mut self, telescope: impl Into<String>) {
        self.telescope = telescope.into();
    }

    /// Check that the observation can be started.
    pub fn validate(&self) -> Result<(), ObservationError> {
        if self.window.is_none() {
            return Err(ObservationError::WindowNotSet);
        }
        if self.min_dec.is_none() {
            return Err(ObservationError::MissingMinDeclination);
        }
        if self.kind() == ObservationKind::Survey && self.max_dec.is_none() {
            return Err(ObservationError::MissingMaxDeclination);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Observation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observation kind.
    pub fn kind(&self) -> ObservationKind {
        self.strategy.kind()
    }

    /// Current phase.
    pub fn state(&self) -> ObservationState {
        self.state
    }

    /// Data-phase strategy and its bookkeeping.
    pub fn strategy(&self) -> &DataStrategy {
        &self.strategy
    }

    /// Completed survey sweeps; `None` for other kinds.
    pub fn sweeps(&self) -> Option<u32> {
        match self.strategy {
            DataStrategy::Survey { sweeps, .. } => Some(sweeps),
            _ => None,
        }
    }

    /// Data window, Unix seconds.
    pub fn window(&self) -> Option<(f64, f64)> {
        self.window
    }

    /// Declination window.
    pub fn declination(&self) -> (Option<f64>, Option<f64>) {
        (self.min_dec, self.max_dec)
    }

    /// Declination the telescope should be parked at before starting.
    ///
    /// Surveys start just below their window so the first sweep enters it.
    pub fn start_declination(&self) -> Option<f64> {
        let min = self.min_dec?;
        Some(match self.kind() {
            ObservationKind::Survey => min - 2.0,
            _ => min,
        })
    }

    /// Active sampling rate, Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Sampling period for the active rate.
    pub fn period_ms(&self) -> u64 {
        period_for(self.rate)
    }

    /// When the first calibration began.
    pub fn started_at(&self) -> Option<f64> {
        self.started_at
    }

    /// When the observation completed.
    pub fn finished_at(&self) -> Option<f64> {
        self.finished_at
    }

    /// When the data phase began.
    pub fn data_started_at(&self) -> Option<f64> {
        self.data_start
    }

    /// Whether output is one composite stream.
    pub fn is_composite(&self) -> bool {
        self.output.is_composite()
    }

    // -------------------------------------------------------------------------
    // Decision and transition
    // -------------------------------------------------------------------------

    /// Decide what `point`, sampled at Unix time `t`, means for the current phase.
    ///
    /// Pure: nothing is written and no bookkeeping changes until the
    /// decision is passed to [`Observation::record`].
    pub fn decide(&self, point: &CalibratedPoint, t: f64) -> Decision {
        let (start, end) = self.window.unwrap_or((f64::INFINITY, f64::INFINITY));
        match self.state {
            ObservationState::Idle => {
                if t < start - (self.bg_duration + self.cal_duration + OPERATOR_BUFFER) {
                    Decision::only(Signal::NoAction)
                } else {
                    Decision::only(Signal::StartCalibration)
                }
            }
            ObservationState::Cal1 | ObservationState::Cal2 => {
                if elapsed(self.cal_start, t) < self.cal_duration {
                    Decision::new(Signal::NoAction, Persist::Point)
                } else {
                    Decision::only(Signal::StartBackground)
                }
            }
            ObservationState::Bg1 => {
                if elapsed(self.bg_start, t) < self.bg_duration {
                    Decision::new(Signal::NoAction, Persist::Point)
                } else {
                    Decision::only(Signal::StartWait)
                }
            }
            ObservationState::Bg2 => {
                if elapsed(self.bg_start, t) < self.bg_duration {
                    Decision::new(Signal::NoAction, Persist::Point)
                } else {
                    Decision::only(Signal::Finished)
                }
            }
            ObservationState::Waiting => {
                if t < start {
                    Decision::only(Signal::NoAction)
                } else {
                    Decision::only(Signal::StartData)
                }
            }
            ObservationState::Data => {
                let min_dec = self.min_dec.unwrap_or(f64::NEG_INFINITY);
                if t < start {
                    Decision::only(Signal::NoAction)
                } else if t < end {
                    self.strategy.decide(point, t, min_dec, self.max_dec)
                } else if self.kind() == ObservationKind::Survey
                    && !self
                        .strategy
                        .decide(point, t, min_dec, self.max_dec)
                        .signal
                        .is_directional()
                {
                    Decision::only(Signal::FinishSweep)
                } else {
                    Decision::only(Signal::StartCalibration)
                }
            }
            ObservationState::Complete => Decision::only(Signal::Finished),
            ObservationState::Invalid => Decision::only(Signal::NoAction),
        }
    }

    /// Apply a decision's persistence effect and bookkeeping.
    pub fn record(&mut self, point: &CalibratedPoint, decision: &Decision) -> Result<(), ObservationError> {
        match decision.persist {
            Persist::Nothing => {}
            Persist::Point => self.output.write_point(point)?,
            Persist::Separator => self.output.separator()?,
        }
        if let Some(update) = decision.update {
            self.strategy.apply(update);
            if update == DataUpdate::EnteredWindow {
                info!(name = %self.name, sweeps = ?self.sweeps(), "Survey sweep entered window");
            }
        }
        Ok(())
    }

    /// Decide and record in one step.
    pub fn communicate(&mut self, point: &CalibratedPoint, t: f64) -> Result<Signal, ObservationError> {
        let decision = self.decide(point, t);
        self.record(point, &decision)?;
        Ok(decision.signal)
    }

    /// Advance one phase at Unix time `now`, or jump to `forced`.
    ///
    /// Entering a phase stamps its start time, writes any separator and
    /// switches the sampling rate; callers re-period their sampling timer to
    /// [`Observation::period_ms`] afterwards. A forced jump skips the entry
    /// effects except that a phase with no recorded start begins at `now`.
    pub fn next(&mut self, now: f64, forced: Option<ObservationState>) -> Result<ObservationState, ObservationError> {
        if let Some(state) = forced {
            warn!(name = %self.name, from = %self.state, to = %state, "Forcing observation state");
            self.state = state;
            let start = match state {
                s if s.is_calibration() => &mut self.cal_start,
                s if s.is_background() => &mut self.bg_start,
                ObservationState::Data => &mut self.data_start,
                _ => return Ok(self.state),
            };
            start.get_or_insert(now);
            return Ok(self.state);
        }

        let next = self.state.successor();
        match next {
            ObservationState::Cal1 => {
                self.started_at = Some(now);
                self.cal_start = Some(now);
                self.rate = self.cal_rate;
            }
            ObservationState::Bg1 | ObservationState::Bg2 => {
                self.output.separator()?;
                self.bg_start = Some(now);
            }
            ObservationState::Waiting => {}
            ObservationState::Data => {
                self.output.separator()?;
                self.data_start = Some(now);
                self.rate = self.data_rate;
            }
            ObservationState::Cal2 => {
                self.output.separator()?;
                self.cal_start = Some(now);
                self.rate = self.cal_rate;
            }
            ObservationState::Complete if self.state != ObservationState::Complete => {
                self.finished_at = Some(now);
                let metadata = ObservationMetadata {
                    telescope: self.telescope.clone(),
                    observation: self.name.clone(),
                    started_at: self.started_at.unwrap_or(now),
                    stopped_at: now,
                };
                self.output.write_metadata(&metadata)?;
                self.output.close()?;
            }
            _ => {
                debug!(name = %self.name, state = %self.state, "No further observation phases");
                return Ok(self.state);
            }
        }
        info!(name = %self.name, from = %self.state, to = %next, rate = self.rate, "Observation phase");
        self.state = next;
        Ok(self.state)
    }
}

fn period_for(rate: f64) -> u64 {
    (1000.0 / rate).round() as u64
}

fn elapsed(since: Option<f64>, t: f64) -> f64 {
    since.map_or(f64::INFINITY, |since| t - since)
}

/// Resolve sidereal times of day to a Unix-time window using `clock`.
pub fn resolve_sidereal_window(clock: &SiderealClock, start_sidereal: f64, end_sidereal: f64) -> (f64, f64) {
    let now = clock.now_epoch();
    let sidereal_now = clock.sidereal_at(now).rem_euclid(SECONDS_PER_DAY);
    let start = now + sidereal_to_solar(start_sidereal - sidereal_now);
    let mut end = now + sidereal_to_solar(end_sidereal - sidereal_now);
    if end < start {
        end += sidereal_to_solar(SECONDS_PER_DAY);
    }
    (start, end)
}
