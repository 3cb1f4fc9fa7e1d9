//! End-to-end runs of the driving loop against an in-memory front end,
//! a manually driven clock and scripted operators.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use threepio::alert::{Alert, AlertError, AutoPrompter, Prompter};
use threepio::calibration::{CalibrationTable, DeclinationCalibrator};
use threepio::clock::{ManualTime, SharedTimeSource, SiderealClock, SuperClock};
use threepio::config::ThreepioConfig;
use threepio::hardware::{Acquisition, DataqFrontEnd, MemoryHandle, MemoryTransport, DEFAULT_TAGS};
use threepio::observation::output::{MemorySink, ObservationOutput};
use threepio::observation::{Observation, ObservationKind, ObservationState};
use threepio::session::{Session, SessionOptions};
use threepio::ThreepioError;

const T0: f64 = 1_700_000_000.0;

/// Raw counts for 0.2 V, 0.4 V and 0.6 V on the +-5 V range; with the
/// test table (100 degrees per volt) that is roughly 20, 40 and 60 degrees.
const DEC_20: i16 = 1311;
const DEC_40: i16 = 2621;
const DEC_60: i16 = 3932;

fn scan(a: i16, b: i16, angle: i16) -> Vec<u8> {
    [a, b, angle].iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Releases one prompt per message received.
struct GatePrompter {
    release: Mutex<mpsc::Receiver<()>>,
}

impl Prompter for GatePrompter {
    fn prompt(&self, alert: &Alert) -> Result<(), AlertError> {
        let release = self.release.lock().unwrap();
        release
            .recv()
            .map_err(|_| AlertError::Dismissed(alert.text.clone()))
    }
}

/// Dismisses everything.
struct RefusingPrompter;

impl Prompter for RefusingPrompter {
    fn prompt(&self, alert: &Alert) -> Result<(), AlertError> {
        Err(AlertError::Dismissed(alert.text.clone()))
    }
}

struct Rig {
    time: Arc<ManualTime>,
    device: MemoryHandle,
    angle: i16,
    session: Session,
}

impl Rig {
    fn new(prompter: Arc<dyn Prompter>) -> Self {
        let time = ManualTime::shared(T0);
        let source: SharedTimeSource = time.clone();
        let clock = SuperClock::new(source.clone(), SiderealClock::new(source, 0.0));

        let (transport, device) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS).unwrap();
        let table = CalibrationTable::new([(-5.0, -500.0), (5.0, 500.0)]).unwrap();

        let session = Session::new(
            clock,
            Acquisition::new(Box::new(front_end)),
            DeclinationCalibrator::new(table),
            prompter,
            SessionOptions::default(),
        );
        Self {
            time,
            device,
            angle: DEC_40,
            session,
        }
    }

    fn state(&self) -> Option<ObservationState> {
        self.session.observation().map(|o| o.state())
    }

    /// Feed one scan and tick once.
    fn step(&mut self) {
        self.device.push(&scan(16384, 8192, self.angle));
        self.session.tick().unwrap();
    }

    /// Tick at a frozen instant until `done`, giving alert workers time to finish.
    fn pump_until(&mut self, done: impl Fn(&Rig) -> bool) {
        self.drive_until(0.0, done);
    }

    /// Tick, moving the clock `dt` seconds each time, until `done`.
    fn drive_until(&mut self, dt: f64, done: impl Fn(&Rig) -> bool) {
        for _ in 0..500 {
            self.step();
            if done(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
            self.time.advance(dt);
        }
        panic!("condition not reached; state {:?}", self.state());
    }

    fn jump_to(&mut self, offset: f64, state: ObservationState) {
        self.time.set(T0 + offset);
        self.pump_until(|rig| rig.state() == Some(state));
    }
}

fn observation(kind: ObservationKind, sink: &MemorySink) -> Observation {
    let mut obs = Observation::new(kind, "drift", ObservationOutput::Composite(Box::new(sink.clone())));
    obs.set_window(T0 + 200.0, T0 + 260.0).unwrap();
    obs.set_durations(2.0, 2.0).unwrap();
    obs
}

#[test]
fn scan_runs_through_every_phase() {
    let prompter = AutoPrompter::new();
    let mut rig = Rig::new(Arc::new(prompter.clone()));
    let sink = MemorySink::new();
    let mut obs = observation(ObservationKind::Scan, &sink);
    obs.set_declination(Some(40.0), None).unwrap();

    rig.session.begin(obs).unwrap();
    rig.pump_until(|rig| rig.state().is_some());
    assert_eq!(rig.state(), Some(ObservationState::Idle));
    assert!(rig.device.written_text().contains("start\r"));

    // Well before the lead time nothing happens.
    rig.time.set(T0 + 100.0);
    for _ in 0..5 {
        rig.step();
    }
    assert_eq!(rig.state(), Some(ObservationState::Idle));
    assert!(!rig.session.awaiting_operator());

    rig.jump_to(166.0, ObservationState::Cal1);
    rig.jump_to(169.0, ObservationState::Bg1);
    rig.jump_to(172.0, ObservationState::Waiting);
    rig.jump_to(200.0, ObservationState::Data);
    assert_eq!(
        rig.session.sample_period_ms(),
        rig.session.observation().map(|o| o.period_ms())
    );

    rig.time.set(T0 + 230.0);
    rig.step();

    rig.jump_to(260.0, ObservationState::Cal2);
    rig.jump_to(263.0, ObservationState::Bg2);
    rig.time.set(T0 + 266.0);
    rig.pump_until(|rig| rig.session.is_idle());

    assert_eq!(rig.session.finished(), ["drift".to_string()]);
    assert!(sink.is_closed());
    assert!(rig.device.written_text().ends_with("stop\r"));
    assert_eq!(rig.session.sample_period_ms(), Some(1000));

    let lines = sink.lines();
    assert_eq!(lines.iter().filter(|l| l.as_str() == "*").count(), 6);
    let metadata = &lines[lines.len() - 6..];
    assert_eq!(metadata[0], "TELESCOPE: The Mighty Forty");
    assert_eq!(metadata[1], "OBSERVATION: drift");

    let texts = prompter.texts();
    assert_eq!(texts[0], "Move the telescope to 40° declination");
    assert_eq!(
        texts
            .iter()
            .filter(|t| t.as_str() == "Turn the calibration source on")
            .count(),
        2
    );
    assert_eq!(
        texts
            .iter()
            .filter(|t| t.as_str() == "Turn the calibration source off")
            .count(),
        2
    );
}

#[test]
fn survey_steers_the_operator_and_counts_sweeps() {
    let prompter = AutoPrompter::new();
    let mut rig = Rig::new(Arc::new(prompter.clone()));
    let sink = MemorySink::new();
    let mut obs = observation(ObservationKind::Survey, &sink);
    obs.set_declination(Some(30.0), Some(50.0)).unwrap();

    rig.session.begin(obs).unwrap();
    rig.pump_until(|rig| rig.state().is_some());
    assert_eq!(prompter.texts()[0], "Move the telescope to 28° declination");

    rig.jump_to(166.0, ObservationState::Cal1);
    rig.jump_to(169.0, ObservationState::Bg1);
    rig.jump_to(172.0, ObservationState::Waiting);
    rig.angle = DEC_20;
    rig.jump_to(200.0, ObservationState::Data);

    let north = || {
        prompter
            .texts()
            .iter()
            .filter(|t| t.as_str() == "Move the telescope north")
            .count()
    };
    rig.drive_until(0.25, |rig| north() == 1 && !rig.session.awaiting_operator());
    // Still south of the window: the prompt is not repeated.
    for _ in 0..10 {
        rig.time.advance(0.25);
        rig.step();
    }
    assert_eq!(north(), 1);

    rig.angle = DEC_40;
    rig.drive_until(0.25, |rig| {
        rig.session.observation().and_then(|o| o.sweeps()) == Some(1) && !rig.session.awaiting_operator()
    });
    assert!(prompter
        .texts()
        .contains(&"The telescope is inside the survey window".to_string()));

    rig.angle = DEC_60;
    rig.drive_until(0.25, |_| {
        prompter.texts().contains(&"Move the telescope south".to_string())
    });
    rig.drive_until(0.25, |rig| !rig.session.awaiting_operator());

    rig.angle = DEC_40;
    rig.drive_until(0.25, |rig| rig.session.observation().and_then(|o| o.sweeps()) == Some(2));
    assert_eq!(rig.state(), Some(ObservationState::Data));
}

#[test]
fn signals_wait_for_the_operator() {
    let (release, gate) = mpsc::channel();
    let mut rig = Rig::new(Arc::new(GatePrompter {
        release: Mutex::new(gate),
    }));
    let sink = MemorySink::new();
    let mut obs = observation(ObservationKind::Scan, &sink);
    obs.set_declination(Some(40.0), None).unwrap();

    rig.session.begin(obs).unwrap();
    for _ in 0..5 {
        rig.step();
    }
    assert!(rig.session.observation().is_none());
    assert!(rig.session.awaiting_operator());

    release.send(()).unwrap();
    release.send(()).unwrap();
    rig.pump_until(|rig| rig.state() == Some(ObservationState::Idle));

    rig.time.set(T0 + 166.0);
    rig.pump_until(|rig| rig.session.awaiting_operator());
    for _ in 0..10 {
        rig.time.advance(1.0);
        rig.step();
    }
    assert_eq!(rig.session.alerts_in_flight(), 1);
    assert_eq!(rig.state(), Some(ObservationState::Idle));

    release.send(()).unwrap();
    release.send(()).unwrap();
    rig.pump_until(|rig| rig.state() == Some(ObservationState::Cal1));
    assert_eq!(rig.session.alerts_in_flight(), 0);
}

#[test]
fn dismissed_start_abandons_the_observation() {
    let mut rig = Rig::new(Arc::new(RefusingPrompter));
    let sink = MemorySink::new();
    let mut obs = observation(ObservationKind::Scan, &sink);
    obs.set_declination(Some(40.0), None).unwrap();

    rig.session.begin(obs).unwrap();
    rig.pump_until(|rig| rig.session.is_idle());
    assert!(rig.session.observation().is_none());
    assert!(!rig.device.written_text().contains("start\r"));
}

#[test]
fn begin_rejects_incomplete_and_overlapping_observations() {
    let mut rig = Rig::new(Arc::new(AutoPrompter::new()));
    let sink = MemorySink::new();

    let incomplete = observation(ObservationKind::Scan, &sink);
    assert!(matches!(
        rig.session.begin(incomplete),
        Err(ThreepioError::Observation(_))
    ));

    let mut first = observation(ObservationKind::Scan, &sink);
    first.set_declination(Some(40.0), None).unwrap();
    rig.session.begin(first).unwrap();

    let mut second = observation(ObservationKind::Scan, &sink);
    second.set_declination(Some(40.0), None).unwrap();
    assert!(rig.session.begin(second).is_err());
}

fn simulated_config(dir: &std::path::Path) -> ThreepioConfig {
    let mut config = ThreepioConfig::default();
    config.hardware.simulate = true;
    config.clock.ra_record = dir.join("ra-cal.txt");
    config.calibration.table = dir.join("dec-cal.txt");
    config.calibration.backup = dir.join("dec-cal-backup.txt");
    config
}

#[test]
fn from_config_runs_uncalibrated_without_a_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_config(dir.path());
    let session = Session::from_config(&config, ManualTime::shared(T0), Arc::new(AutoPrompter::new())).unwrap();
    assert!(session.is_idle());
    assert_eq!(session.sample_period_ms(), Some(1000));
}

#[test]
fn from_config_rejects_a_malformed_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_config(dir.path());
    std::fs::write(&config.calibration.table, "0.5\nnot a number\n").unwrap();
    let result = Session::from_config(&config, ManualTime::shared(T0), Arc::new(AutoPrompter::new()));
    assert!(matches!(result, Err(ThreepioError::Calibration(_))));
}

#[test]
fn ra_calibration_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_config(dir.path());
    let time = ManualTime::shared(T0);

    let mut session = Session::from_config(&config, time.clone(), Arc::new(AutoPrompter::new())).unwrap();
    session.calibrate_ra(3600.0, None).unwrap();
    assert!(config.clock.ra_record.exists());

    time.advance(60.0);
    let restored = Session::from_config(&config, time, Arc::new(AutoPrompter::new())).unwrap();
    assert_relative_eq!(
        restored.clock().now_sidereal(),
        session.clock().now_sidereal(),
        epsilon = 1e-6
    );
    assert!(restored.clock().now_sidereal() > 3660.0);
}

#[test]
fn run_returns_once_idle() {
    let mut rig = Rig::new(Arc::new(RefusingPrompter));
    let sink = MemorySink::new();
    let mut obs = observation(ObservationKind::Scan, &sink);
    obs.set_declination(Some(40.0), None).unwrap();
    rig.session.begin(obs).unwrap();

    let result = tokio_test::block_on(async {
        tokio::time::timeout(Duration::from_secs(5), rig.session.run(Duration::from_millis(2))).await
    });
    assert!(result.unwrap().is_ok());
    assert!(rig.session.is_idle());
}
