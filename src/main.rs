//! CLI Entry Point for threepio
//!
//! Provides command-line access to the telescope station:
//! - Running a Scan, Survey or Spectrum observation
//! - Listing attached instruments
//! - Calibrating sidereal time and declination
//!
//! # Usage
//!
//! Run a scan between two sidereal times:
//! ```bash
//! threepio observe scan --start 04:30:00 --end 05:10:00 --dec-min 20
//! ```
//!
//! Calibrate the sidereal clock:
//! ```bash
//! threepio calibrate-ra 12:00:00
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use threepio::alert::{Alert, ConsolePrompter, Prompter};
use threepio::calibration::{DecCalibrationRecorder, WalkDirection, WalkProgress};
use threepio::clock::{
    format_sidereal, parse_sidereal, time_slug, SharedTimeSource, SiderealClock, SuperClock, SystemTime,
};
use threepio::config::{ThreepioConfig, DEFAULT_CONFIG_PATH};
use threepio::hardware::{self, Acquisition};
use threepio::observation::output::ObservationOutput;
use threepio::observation::{Observation, ObservationKind, SPECTRUM_WINDOW};
use threepio::session::{Session, Station};

#[derive(Parser)]
#[command(name = "threepio")]
#[command(about = "Radio telescope data-acquisition control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Simulate every instrument
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Scan,
    Survey,
    Spectrum,
}

impl From<Kind> for ObservationKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Scan => ObservationKind::Scan,
            Kind::Survey => ObservationKind::Survey,
            Kind::Spectrum => ObservationKind::Spectrum,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    North,
    South,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one observation to completion
    Observe {
        /// Observation type
        #[arg(value_enum)]
        kind: Kind,

        /// Observation name, used for output files (defaults to the start time)
        #[arg(long)]
        name: Option<String>,

        /// Data window start, sidereal HH:MM:SS
        #[arg(long)]
        start: String,

        /// Data window end, sidereal HH:MM:SS (ignored for spectrum)
        #[arg(long)]
        end: Option<String>,

        /// Minimum (or target) declination, degrees
        #[arg(long, allow_hyphen_values = true)]
        dec_min: f64,

        /// Maximum declination, degrees (required for survey)
        #[arg(long, allow_hyphen_values = true)]
        dec_max: Option<f64>,

        /// Data-phase sampling rate, Hz
        #[arg(long)]
        rate: Option<f64>,

        /// Write a single composite file
        #[arg(long)]
        composite: bool,
    },

    /// List attached instruments
    Discover,

    /// Set the current sidereal time
    CalibrateRa {
        /// Current sidereal time, HH:MM:SS
        sidereal: String,
    },

    /// Walk the telescope through the declination steps and record a new table
    CalibrateDec {
        /// Walk direction
        #[arg(long, value_enum, default_value = "north")]
        direction: Direction,
    },

    /// Print the current sidereal time
    Sidereal,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ThreepioConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.simulate {
        config.hardware.simulate = true;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    threepio::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let source: SharedTimeSource = Arc::new(SystemTime);

    match cli.command {
        Commands::Observe {
            kind,
            name,
            start,
            end,
            dec_min,
            dec_max,
            rate,
            composite,
        } => {
            let request = ObserveRequest {
                kind: kind.into(),
                name,
                start,
                end,
                dec_min,
                dec_max,
                rate,
                composite,
            };
            observe(&config, source, request).await
        }
        Commands::Discover => discover(),
        Commands::CalibrateRa { sidereal } => calibrate_ra(&config, source, &sidereal),
        Commands::CalibrateDec { direction } => calibrate_dec(&config, source, direction).await,
        Commands::Sidereal => {
            let clock: SuperClock<Station> =
                SuperClock::restore(source, &config.clock.ra_record, config.telescope.longitude);
            println!("{}", clock.sidereal().formatted());
            Ok(())
        }
    }
}

struct ObserveRequest {
    kind: ObservationKind,
    name: Option<String>,
    start: String,
    end: Option<String>,
    dec_min: f64,
    dec_max: Option<f64>,
    rate: Option<f64>,
    composite: bool,
}

async fn observe(config: &ThreepioConfig, source: SharedTimeSource, request: ObserveRequest) -> Result<()> {
    let name = request.name.unwrap_or_else(|| time_slug(source.now()));
    let start = parse_sidereal(&request.start)?;
    let end = match (request.kind, &request.end) {
        (ObservationKind::Spectrum, _) => start + SPECTRUM_WINDOW,
        (_, Some(end)) => parse_sidereal(end)?,
        (_, None) => bail!("--end is required for {} observations", request.kind),
    };

    let prompter: Arc<dyn Prompter> = Arc::new(ConsolePrompter::new());
    let mut session = Session::from_config(config, source, prompter)?;

    let composite = request.composite || config.storage.composite;
    std::fs::create_dir_all(&config.storage.output_dir)
        .with_context(|| format!("Failed to create {}", config.storage.output_dir.display()))?;
    let output = ObservationOutput::create(&config.storage.output_dir, &name, request.kind, composite)
        .with_context(|| format!("Failed to create output files for '{}'", name))?;

    let mut observation = Observation::new(request.kind, &name, output);
    observation.set_sidereal_window(start, end, session.clock().sidereal())?;
    observation.set_declination(Some(request.dec_min), request.dec_max)?;
    if let Some(rate) = request.rate {
        observation.set_data_rate(rate)?;
    }

    info!(
        %name,
        kind = %request.kind,
        start = %format_sidereal(start),
        end = %format_sidereal(end),
        now = %session.clock().sidereal().formatted(),
        "Observation requested"
    );
    session.begin(observation)?;

    let tick = Duration::from_millis(config.clock.tick_ms);
    tokio::select! {
        result = session.run(tick) => result?,
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, observation abandoned"),
    }
    if let Some(name) = session.finished().last() {
        println!("Observation '{}' complete", name);
    }
    Ok(())
}

fn discover() -> Result<()> {
    let ports = hardware::discovery::enumerate()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        match port.usb {
            Some(usb) => println!("{}  {}", port.name, usb),
            None => println!("{}", port.name),
        }
    }
    let found = hardware::discovery::classify(&ports);
    println!(
        "Front end: {}",
        found.front_end.as_deref().unwrap_or("not found (will simulate)")
    );
    println!(
        "Angle sensor: {}",
        found.angle_sensor.as_deref().unwrap_or("not found (front-end channel 2)")
    );
    Ok(())
}

fn calibrate_ra(config: &ThreepioConfig, source: SharedTimeSource, sidereal: &str) -> Result<()> {
    let sidereal = parse_sidereal(sidereal)?;
    let mut clock: SuperClock<Station> =
        SuperClock::restore(source, &config.clock.ra_record, config.telescope.longitude);
    clock.calibrate(sidereal, None)?;
    println!("Sidereal time set to {}", clock.sidereal().formatted());
    Ok(())
}

async fn calibrate_dec(config: &ThreepioConfig, source: SharedTimeSource, direction: Direction) -> Result<()> {
    let mut acquisition = Acquisition::connect(&config.hardware, source.clone());
    if acquisition.is_simulated() {
        bail!("Declination calibration needs the physical instruments connected");
    }
    let direction = match direction {
        Direction::North => WalkDirection::SouthToNorth,
        Direction::South => WalkDirection::NorthToSouth,
    };
    let clock = SiderealClock::estimated(source, config.telescope.longitude);
    let prompter = ConsolePrompter::new();
    let mut recorder = DecCalibrationRecorder::new(direction);

    acquisition.start()?;
    while let Some(target) = recorder.current_target() {
        prompter.prompt(&Alert::with_button(
            format!("Move the telescope to {}° declination", target),
            "Record",
        ))?;
        let raw = read_angle(&mut acquisition, &clock).await?;
        match recorder.record(raw) {
            Ok(WalkProgress::Next(next)) => info!(target, raw, next, "Reading recorded"),
            Ok(WalkProgress::Complete) => info!(target, raw, "Final reading recorded"),
            Err(err) => {
                acquisition.stop()?;
                return Err(err).context("Declination walk failed, start again");
            }
        }
    }
    acquisition.stop()?;

    let table = recorder.save(&config.calibration.table, &config.calibration.backup)?;
    println!(
        "Saved {} calibration points to {}",
        table.points().len(),
        config.calibration.table.display()
    );
    Ok(())
}

async fn read_angle(acquisition: &mut Acquisition, clock: &SiderealClock) -> Result<f64> {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(sample) = acquisition.sample(clock.now_sidereal()) {
            return Ok(sample.angle);
        }
    }
    bail!("No reading from the angle sensor after 5 seconds")
}
