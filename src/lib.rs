//! # Threepio Core Library
//!
//! Real-time control core for a small radio telescope's data-acquisition
//! station. The binary (`main.rs`) wraps this library in a command-line
//! front end; everything that matters for an observation lives here.
//!
//! ## Crate Structure
//!
//! - **`clock`**: Sidereal time, the persisted RA calibration, and the
//!   anchor-based periodic [`clock::Scheduler`] that drives sampling.
//! - **`calibration`**: Raw-voltage to declination conversion by piecewise
//!   linear interpolation, and the step-by-step walk that records a new table.
//! - **`hardware`**: The DATAQ front end and declinometer over USB serial,
//!   port discovery, and simulated stand-ins when either is missing.
//! - **`measurement`**: Frames, samples, and calibrated points.
//! - **`observation`**: The per-observation state machine (Scan, Survey,
//!   Spectrum) and its output files.
//! - **`alert`**: Operator prompts, run off the tick thread with completions
//!   delivered back as messages.
//! - **`session`**: The driving loop tying the above together.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: `tracing` subscriber set-up.
//! - **`error`**: The crate-wide [`error::ThreepioError`].

pub mod alert;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod observation;
pub mod session;

pub use error::{AppResult, ThreepioError};
