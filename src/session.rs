//! The driving loop.
//!
//! A [`Session`] owns everything that runs on the tick thread: the
//! [`SuperClock`] with its sampling and status timers, the [`Station`]
//! (instruments, calibrator, current observation) the timers act on, and
//! the [`AlertCoordinator`] whose worker threads talk to the operator.
//!
//! Each [`Session::tick`]:
//! 1. applies completed operator sequences (advance the observation,
//!    re-period and re-anchor the sampling timer),
//! 2. runs due timers; the sampling timer takes one sample, calibrates it
//!    and lets the observation decide and record,
//! 3. turns the observation's signals into operator prompts or direct
//!    phase advances.
//!
//! Only one operator sequence is outstanding at a time; signals arriving
//! while one is pending are dropped, and a steering prompt is not repeated
//! until the signal changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertCoordinator, AlertMessage, LogTask, Prompter, SequenceId, TaskStatus};
use crate::calibration::{CalibrationStatus, DeclinationCalibrator};
use crate::clock::{format_sidereal, RaCalibration, SharedTimeSource, SuperClock, Tick, TimerHandle};
use crate::config::ThreepioConfig;
use crate::error::AppResult;
use crate::hardware::Acquisition;
use crate::measurement::CalibratedPoint;
use crate::observation::{Observation, ObservationError, ObservationKind, ObservationState, Signal};

/// Receiver frequency for Spectrum observations.
pub const SPECTRUM_FREQUENCY: &str = "1319.5MHz";

/// What to do once an operator sequence is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Install the staged observation and start acquiring
    Begin,
    /// Advance the observation one phase
    Advance,
    /// Nothing beyond noting the acknowledgement
    Acknowledge,
}

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Sampling period with no observation running
    pub idle_period_ms: u64,
    /// Status log period; 0 disables the status timer
    pub status_interval_ms: u64,
    /// Telescope name stamped into observation metadata
    pub telescope: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_period_ms: 1000,
            status_interval_ms: 0,
            telescope: crate::observation::DEFAULT_TELESCOPE.to_string(),
        }
    }
}

impl SessionOptions {
    /// Options from station configuration.
    pub fn from_config(config: &ThreepioConfig) -> Self {
        Self {
            idle_period_ms: (1000.0 / config.clock.idle_rate_hz).round() as u64,
            status_interval_ms: config.clock.status_interval_ms,
            telescope: config.telescope.name.clone(),
        }
    }
}

/// State the timers act on.
pub struct Station {
    acquisition: Acquisition,
    calibrator: DeclinationCalibrator,
    observation: Option<Observation>,
    staged: Option<Observation>,
    signals: Vec<Signal>,
    latest: Option<CalibratedPoint>,
    samples: u64,
}

impl Station {
    fn new(acquisition: Acquisition, calibrator: DeclinationCalibrator) -> Self {
        Self {
            acquisition,
            calibrator,
            observation: None,
            staged: None,
            signals: Vec::new(),
            latest: None,
            samples: 0,
        }
    }

    fn on_sample(&mut self, tick: Tick) -> anyhow::Result<()> {
        let Some(sample) = self.acquisition.sample(tick.sidereal) else {
            return Ok(());
        };
        let point = sample.calibrate(&self.calibrator);
        self.latest = Some(point);
        self.samples += 1;

        if let Some(observation) = &mut self.observation {
            let decision = observation.decide(&point, tick.epoch);
            observation
                .record(&point, &decision)
                .with_context(|| format!("Failed to record observation '{}'", observation.name()))?;
            if decision.signal != Signal::NoAction {
                self.signals.push(decision.signal);
            }
        }
        Ok(())
    }

    fn on_status(&self, tick: Tick) {
        let state = self
            .observation
            .as_ref()
            .map_or_else(|| "no observation".to_string(), |o| o.state().to_string());
        match self.latest {
            Some(point) => info!(
                sidereal = %format_sidereal(tick.sidereal),
                %state,
                dec = format_args!("{:.2}", point.dec),
                a = format_args!("{:.4}", point.a),
                b = format_args!("{:.4}", point.b),
                samples = self.samples,
                "Status"
            ),
            None => info!(sidereal = %format_sidereal(tick.sidereal), %state, "Status: no samples yet"),
        }
    }

    /// The running observation.
    pub fn observation(&self) -> Option<&Observation> {
        self.observation.as_ref()
    }

    /// The most recent calibrated sample.
    pub fn latest(&self) -> Option<CalibratedPoint> {
        self.latest
    }

    /// Samples taken since start-up.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Clock, station and operator channel, driven one tick at a time.
pub struct Session {
    clock: SuperClock<Station>,
    station: Station,
    alerts: AlertCoordinator<Followup>,
    sample_timer: TimerHandle,
    awaiting: Option<SequenceId>,
    last_prompted: Option<Signal>,
    tasks: HashMap<SequenceId, LogTask>,
    options: SessionOptions,
    finished: Vec<String>,
}

impl Session {
    /// Assemble a session and register its timers.
    pub fn new(
        mut clock: SuperClock<Station>,
        acquisition: Acquisition,
        calibrator: DeclinationCalibrator,
        prompter: Arc<dyn Prompter>,
        options: SessionOptions,
    ) -> Self {
        let sample_timer = clock.add_timer("sample", options.idle_period_ms, |station: &mut Station, tick| {
            station.on_sample(tick)
        });
        if options.status_interval_ms > 0 {
            clock.add_timer("status", options.status_interval_ms, |station: &mut Station, tick| {
                station.on_status(tick);
                Ok(())
            });
        }
        Self {
            clock,
            station: Station::new(acquisition, calibrator),
            alerts: AlertCoordinator::new(prompter),
            sample_timer,
            awaiting: None,
            last_prompted: None,
            tasks: HashMap::new(),
            options,
            finished: Vec::new(),
        }
    }

    /// Build a session from configuration: restore the clock, load the
    /// declination table, and connect (or simulate) the instruments.
    ///
    /// A malformed calibration table is an error; a missing one is not.
    pub fn from_config(
        config: &ThreepioConfig,
        source: SharedTimeSource,
        prompter: Arc<dyn Prompter>,
    ) -> AppResult<Self> {
        let calibrator = DeclinationCalibrator::load(&config.calibration.table)?;
        if calibrator.status() == CalibrationStatus::Uncalibrated {
            warn!("Declination is uncalibrated; run calibrate-dec before observing");
        }
        let clock = SuperClock::restore(source.clone(), &config.clock.ra_record, config.telescope.longitude);
        let acquisition = Acquisition::connect(&config.hardware, source);
        Ok(Self::new(
            clock,
            acquisition,
            calibrator,
            prompter,
            SessionOptions::from_config(config),
        ))
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Stage `observation` and ask the operator to set the telescope up for it.
    ///
    /// The observation starts receiving samples once the operator confirms.
    pub fn begin(&mut self, mut observation: Observation) -> AppResult<SequenceId> {
        if let Some(current) = self.station.observation.as_ref().or(self.station.staged.as_ref()) {
            return Err(ObservationError::AlreadyRunning(current.name().to_string()).into());
        }
        observation.validate()?;
        observation.set_telescope(self.options.telescope.clone());

        let alerts = start_alerts(&observation);
        let id = self.dispatch(alerts, Followup::Begin, format!("Start {}", observation.name()))?;
        info!(name = %observation.name(), kind = %observation.kind(), "Observation staged");
        self.station.staged = Some(observation);
        Ok(id)
    }

    /// Re-calibrate sidereal time; every timer re-anchors.
    pub fn calibrate_ra(&mut self, sidereal_seconds: f64, epoch: Option<f64>) -> AppResult<RaCalibration> {
        Ok(self.clock.calibrate(sidereal_seconds, epoch)?)
    }

    /// One pass of the loop.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.apply_completions()?;
        self.clock.run_due(&mut self.station)?;
        let signals: Vec<Signal> = self.station.signals.drain(..).collect();
        for signal in signals {
            self.handle_signal(signal)?;
        }
        Ok(())
    }

    /// Tick every `period` until no observation is staged, running or
    /// waiting on the operator.
    pub async fn run(&mut self, period: Duration) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !self.is_idle() {
            interval.tick().await;
            self.tick()?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Nothing staged, running or awaiting the operator.
    pub fn is_idle(&self) -> bool {
        self.station.observation.is_none() && self.station.staged.is_none() && self.awaiting.is_none()
    }

    /// The running observation.
    pub fn observation(&self) -> Option<&Observation> {
        self.station.observation()
    }

    /// Timer-side state.
    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Clock and timers.
    pub fn clock(&self) -> &SuperClock<Station> {
        &self.clock
    }

    /// Current sampling period.
    pub fn sample_period_ms(&self) -> Option<u64> {
        self.clock.scheduler().period(self.sample_timer)
    }

    /// Whether an operator sequence is outstanding.
    pub fn awaiting_operator(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Operator sequences dispatched and not yet applied.
    pub fn alerts_in_flight(&self) -> usize {
        self.alerts.in_flight()
    }

    /// Names of completed observations, oldest first.
    pub fn finished(&self) -> &[String] {
        &self.finished
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn dispatch(&mut self, alerts: Vec<Alert>, followup: Followup, label: String) -> AppResult<SequenceId> {
        let id = self.alerts.dispatch(alerts, followup)?;
        let mut task = LogTask::new(label, Some(format_sidereal(self.clock.now_sidereal())));
        task.set_status(TaskStatus::Pending);
        info!("{}", task);
        self.tasks.insert(id, task);
        self.awaiting = Some(id);
        Ok(id)
    }

    fn apply_completions(&mut self) -> anyhow::Result<()> {
        for completion in self.alerts.drain() {
            if self.awaiting == Some(completion.id) {
                self.awaiting = None;
            }
            let mut task = self.tasks.remove(&completion.id);
            match completion.outcome {
                Ok(()) => {
                    if let Some(task) = &mut task {
                        task.set_status(TaskStatus::Done);
                    }
                    self.follow_up(completion.tag)?;
                }
                Err(err) => {
                    if let Some(task) = &mut task {
                        task.set_status(TaskStatus::Failed);
                    }
                    warn!(error = %err, followup = ?completion.tag, "Operator sequence failed");
                    if completion.tag == Followup::Begin {
                        if let Some(staged) = self.station.staged.take() {
                            warn!(name = %staged.name(), "Observation abandoned before start");
                        }
                    }
                }
            }
            if let Some(task) = task {
                info!("{}", task);
            }
        }
        Ok(())
    }

    fn follow_up(&mut self, followup: Followup) -> anyhow::Result<()> {
        match followup {
            Followup::Begin => {
                let Some(observation) = self.station.staged.take() else {
                    return Ok(());
                };
                self.station
                    .acquisition
                    .start()
                    .context("Failed to start acquisition")?;
                self.clock.set_period(self.sample_timer, observation.period_ms());
                self.clock.reset_anchor();
                info!(name = %observation.name(), "Observation started");
                self.station.observation = Some(observation);
                Ok(())
            }
            Followup::Advance => self.advance(),
            Followup::Acknowledge => Ok(()),
        }
    }

    fn advance(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now_epoch();
        let Some(observation) = self.station.observation.as_mut() else {
            return Ok(());
        };
        let state = observation.next(now, None)?;
        let period = observation.period_ms();
        if state == ObservationState::Complete {
            self.finish();
        } else {
            self.clock.set_period(self.sample_timer, period);
            self.clock.reset_anchor();
        }
        Ok(())
    }

    fn finish(&mut self) {
        let Some(observation) = self.station.observation.take() else {
            return;
        };
        if let Err(err) = self.station.acquisition.stop() {
            warn!(error = %err, "Failed to stop acquisition");
        }
        self.clock.set_period(self.sample_timer, self.options.idle_period_ms);
        self.last_prompted = None;
        info!(name = %observation.name(), sweeps = ?observation.sweeps(), "Observation complete");
        self.finished.push(observation.name().to_string());
    }

    fn handle_signal(&mut self, signal: Signal) -> anyhow::Result<()> {
        if signal == Signal::Beep {
            info!("Beep: step the receiver frequency");
            return Ok(());
        }
        if self.awaiting.is_some() {
            debug!(%signal, "Operator busy, signal dropped");
            return Ok(());
        }
        match signal {
            Signal::NoAction | Signal::Beep => Ok(()),
            Signal::StartWait | Signal::StartData | Signal::Next | Signal::Finished => {
                self.last_prompted = None;
                self.advance()
            }
            Signal::StartCalibration | Signal::StartBackground => {
                self.last_prompted = None;
                self.dispatch(signal_alerts(signal), Followup::Advance, signal_label(signal))?;
                Ok(())
            }
            Signal::SendTelescopeNorth
            | Signal::SendTelescopeSouth
            | Signal::EndSendTelescope
            | Signal::FinishSweep => {
                if self.last_prompted == Some(signal) {
                    return Ok(());
                }
                self.last_prompted = Some(signal);
                self.dispatch(signal_alerts(signal), Followup::Acknowledge, signal_label(signal))?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("clock", &self.clock)
            .field("observation", &self.station.observation.as_ref().map(|o| o.name()))
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

/// Prompts that get the telescope (and receiver) ready for `observation`.
pub fn start_alerts(observation: &Observation) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if let Some(target) = observation.start_declination() {
        alerts.extend(
            AlertMessage::new(format!("Move the telescope to {}° declination", target))
                .button("Okay")
                .confirm(format!("Is the telescope at {}° declination?", target))
                .alerts(),
        );
    }
    if observation.kind() == ObservationKind::Spectrum {
        alerts.extend(
            AlertMessage::new(format!("Set frequency to {}", SPECTRUM_FREQUENCY))
                .button("Okay")
                .confirm(format!("Is the frequency set to {}?", SPECTRUM_FREQUENCY))
                .alerts(),
        );
    }
    alerts
}

/// Prompts shown for a signal that needs the operator.
pub fn signal_alerts(signal: Signal) -> Vec<Alert> {
    match signal {
        Signal::StartCalibration => AlertMessage::new("Turn the calibration source on")
            .button("Okay")
            .confirm("Is the calibration source on?")
            .alerts()
            .to_vec(),
        Signal::StartBackground => AlertMessage::new("Turn the calibration source off")
            .button("Okay")
            .confirm("Is the calibration source off?")
            .alerts()
            .to_vec(),
        Signal::SendTelescopeNorth => vec![Alert::new("Move the telescope north")],
        Signal::SendTelescopeSouth => vec![Alert::new("Move the telescope south")],
        Signal::EndSendTelescope => vec![Alert::new("The telescope is inside the survey window")],
        Signal::FinishSweep => vec![Alert::new("Data window closed, finish the current sweep")],
        Signal::NoAction
        | Signal::Beep
        | Signal::StartWait
        | Signal::StartData
        | Signal::Next
        | Signal::Finished => Vec::new(),
    }
}

fn signal_label(signal: Signal) -> String {
    match signal {
        Signal::StartCalibration => "Calibration".to_string(),
        Signal::StartBackground => "Background".to_string(),
        Signal::SendTelescopeNorth => "Steer north".to_string(),
        Signal::SendTelescopeSouth => "Steer south".to_string(),
        Signal::EndSendTelescope => "Sweep".to_string(),
        Signal::FinishSweep => "Finish sweep".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::output::{MemorySink, ObservationOutput};

    fn observation(kind: ObservationKind) -> Observation {
        let mut obs = Observation::new(
            kind,
            "test",
            ObservationOutput::Composite(Box::new(MemorySink::new())),
        );
        obs.set_window(0.0, 100.0).unwrap();
        obs.set_declination(Some(40.0), Some(50.0)).unwrap();
        obs
    }

    #[test]
    fn start_prompts_target_the_start_declination() {
        let texts: Vec<String> = start_alerts(&observation(ObservationKind::Scan))
            .into_iter()
            .map(|a| a.text)
            .collect();
        assert_eq!(
            texts,
            vec![
                "Move the telescope to 40° declination",
                "Is the telescope at 40° declination?"
            ]
        );
        let survey = start_alerts(&observation(ObservationKind::Survey));
        assert_eq!(survey[0].text, "Move the telescope to 38° declination");
        assert_eq!(survey[1].button, "Yes");
    }

    #[test]
    fn spectrum_adds_frequency_prompts() {
        let alerts = start_alerts(&observation(ObservationKind::Spectrum));
        assert_eq!(alerts.len(), 4);
        assert_eq!(alerts[2].text, "Set frequency to 1319.5MHz");
        assert_eq!(alerts[3].text, "Is the frequency set to 1319.5MHz?");
    }

    #[test]
    fn advancing_signals_need_no_prompt() {
        for signal in [Signal::StartWait, Signal::StartData, Signal::Next, Signal::Finished] {
            assert!(signal_alerts(signal).is_empty());
        }
        assert_eq!(signal_alerts(Signal::StartCalibration).len(), 2);
        assert_eq!(signal_alerts(Signal::SendTelescopeSouth).len(), 1);
    }
}
