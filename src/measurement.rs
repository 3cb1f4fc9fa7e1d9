//! Values flowing from the acquisition channel to the observation.
//!
//! A [`Frame`] is one decoded scan of the hardware, a [`Sample`] is the
//! tick's reading stamped with sidereal time, and a [`CalibratedPoint`] is
//! that sample with its angle converted to true declination.

use crate::calibration::DeclinationCalibrator;

/// One decoded hardware scan: one value per channel, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    values: Vec<f64>,
}

impl Frame {
    /// Wrap decoded channel values.
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Value of channel `index`, if the frame carries it.
    pub fn channel(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Number of channels in the frame.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the frame is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All channel values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// One tick's raw reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Sidereal seconds at the tick that took the sample.
    pub timestamp: f64,
    /// Telescope channel A, volts.
    pub a: f64,
    /// Telescope channel B, volts.
    pub b: f64,
    /// Uncalibrated declinometer reading.
    pub angle: f64,
}

impl Sample {
    /// Replace the angle with calibrated declination.
    pub fn calibrate(&self, calibrator: &DeclinationCalibrator) -> CalibratedPoint {
        CalibratedPoint {
            timestamp: self.timestamp,
            dec: calibrator.calibrate(self.angle),
            a: self.a,
            b: self.b,
        }
    }
}

/// A sample with the angle channel converted to declination in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedPoint {
    /// Sidereal seconds.
    pub timestamp: f64,
    /// True declination, degrees.
    pub dec: f64,
    /// Channel A, volts.
    pub a: f64,
    /// Channel B, volts.
    pub b: f64,
}
