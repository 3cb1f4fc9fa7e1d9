//! Custom error types for the application.
//!
//! Each component has its own error enum; `ThreepioError` gathers them so
//! callers that span components can use `?` throughout:
//!
//! - **`Config`**: figment could not load or deserialize the configuration.
//! - **`Configuration`**: the configuration loaded but failed validation.
//! - **`Clock`**: sidereal time parsing or RA record persistence.
//! - **`Calibration`**: the declination table is missing data or malformed.
//!   This blocks starting an observation but never takes down the process.
//! - **`Hardware`**: opening or commanding an instrument failed. Polling
//!   never produces this; dropped samples are expected and silent.
//! - **`Observation`**: a bad observation setting, or output I/O.
//! - **`Alert`**: an operator prompt could not be shown.

use thiserror::Error;

use crate::alert::AlertError;
use crate::calibration::CalibrationError;
use crate::clock::ClockError;
use crate::hardware::HardwareError;
use crate::observation::ObservationError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ThreepioError>;

/// Application-wide error.
#[derive(Error, Debug)]
pub enum ThreepioError {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Sidereal clock error
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// Declination calibration error
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Instrument error
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// Observation configuration or output error
    #[error(transparent)]
    Observation(#[from] ObservationError),

    /// Operator prompt error
    #[error(transparent)]
    Alert(#[from] AlertError),

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ThreepioError {
    fn from(err: figment::Error) -> Self {
        ThreepioError::Config(Box::new(err))
    }
}
