//! Synthetic signal generators used when an instrument is not plugged in.
//!
//! The front-end generator produces a slowly wandering two-channel signal
//! with spiky noise, a polarization split between A and B, and an optional
//! calibration-diode offset. The angle generator either sweeps or holds a
//! fixed reading.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::clock::SharedTimeSource;
use crate::measurement::Frame;

/// Knobs for the synthetic signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationParams {
    /// Noise amplitude, 0 for a clean signal.
    pub noise: f64,
    /// Signal swing multiplier.
    pub variance: f64,
    /// Fraction of the signal removed from channel B.
    pub polarization: f64,
    /// Add the calibration-diode offset.
    pub calibration: bool,
    /// Raw angle reading reported when not sweeping.
    pub angle: f64,
    /// Sweep the angle sinusoidally instead of holding it.
    pub auto_sweep: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            noise: 1.0,
            variance: 1.0,
            polarization: 0.0,
            calibration: false,
            angle: 0.0,
            auto_sweep: false,
        }
    }
}

/// Synthetic three-channel front end: A, B and a raw angle.
pub struct SimulatedFrontEnd {
    source: SharedTimeSource,
    params: SimulationParams,
    rng: StdRng,
}

impl SimulatedFrontEnd {
    /// Generator seeded from the OS.
    pub fn new(source: SharedTimeSource, params: SimulationParams) -> Self {
        Self {
            source,
            params,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible generator.
    pub fn seeded(source: SharedTimeSource, params: SimulationParams, seed: u64) -> Self {
        Self {
            source,
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Current parameters.
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Adjust parameters while running.
    pub fn params_mut(&mut self) -> &mut SimulationParams {
        &mut self.params
    }

    /// One synthetic frame at the current instant.
    pub fn frame(&mut self) -> Frame {
        let x = self.source.now() / 8.0;
        let p = &self.params;

        let sign = if self.rng.gen_bool(0.5) { -0.2 } else { 1.0 };
        let noise =
            sign / (64.0 * (self.rng.gen::<f64>() + 0.02)) * 0.08 * p.noise * p.noise;
        let diode = if p.calibration { 1.0 } else { 0.0 };

        let g = 2.6 / ((2.0 * x).sin() + 1.4) + 0.4 * (8.0 * x).sin() - 0.8 * (4.0 * x).sin()
            + 1.0 / ((8.0 * x).sin() + 1.4);

        let a = g * p.variance + noise + diode;
        let b = a - 0.1 * p.polarization * g * (p.variance / 2.0 + 1.0);
        let normalize = |v: f64| v / 272.0 + diode + 1.0;

        Frame::new(vec![normalize(a), normalize(b), angle_reading(x, p)])
    }
}

/// Synthetic single-axis angle sensor.
pub struct SimulatedAngleSensor {
    source: SharedTimeSource,
    params: SimulationParams,
}

impl SimulatedAngleSensor {
    /// Generator over `source`.
    pub fn new(source: SharedTimeSource, params: SimulationParams) -> Self {
        Self { source, params }
    }

    /// Adjust parameters while running.
    pub fn params_mut(&mut self) -> &mut SimulationParams {
        &mut self.params
    }

    /// One synthetic reading at the current instant.
    pub fn frame(&mut self) -> Frame {
        Frame::new(vec![angle_reading(self.source.now() / 8.0, &self.params)])
    }
}

fn angle_reading(x: f64, params: &SimulationParams) -> f64 {
    if params.auto_sweep {
        (4.0 * x).sin()
    } else {
        params.angle
    }
}
