//! Single-axis angle sensor.
//!
//! An Arduino prints one ASCII decimal per line. Lines that do not parse
//! (boot banners, partial writes after a reset) are skipped.

use tracing::{debug, warn};

use super::simulated::SimulatedAngleSensor;
use super::transport::Transport;
use super::{AcquisitionChannel, HardwareError};
use crate::measurement::Frame;

enum Backend {
    Serial {
        transport: Box<dyn Transport>,
        pending: Vec<u8>,
    },
    Simulated(SimulatedAngleSensor),
}

/// The declinometer, physical or simulated.
pub struct Declinometer {
    backend: Backend,
    acquiring: bool,
}

impl Declinometer {
    /// Attach to a device.
    pub fn connect(transport: Box<dyn Transport>) -> Self {
        Self {
            backend: Backend::Serial {
                transport,
                pending: Vec::new(),
            },
            acquiring: false,
        }
    }

    /// Run on synthetic data.
    pub fn simulated(generator: SimulatedAngleSensor) -> Self {
        warn!("Declinometer not found, simulating data");
        Self {
            backend: Backend::Simulated(generator),
            acquiring: false,
        }
    }

    /// Simulation knobs, when simulated.
    pub fn simulator_mut(&mut self) -> Option<&mut SimulatedAngleSensor> {
        match &mut self.backend {
            Backend::Simulated(generator) => Some(generator),
            Backend::Serial { .. } => None,
        }
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }
}

fn parse_line(line: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(line).ok()?.trim();
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            debug!(line = %text, "Skipping malformed declinometer line");
            None
        }
    }
}

impl AcquisitionChannel for Declinometer {
    fn start(&mut self) -> Result<(), HardwareError> {
        self.acquiring = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        if let Backend::Serial { transport, pending } = &mut self.backend {
            transport.clear_input()?;
            pending.clear();
        }
        self.acquiring = false;
        Ok(())
    }

    fn read_latest(&mut self) -> Option<Frame> {
        match &mut self.backend {
            Backend::Simulated(generator) => Some(generator.frame()),
            Backend::Serial { transport, pending } => {
                if let Err(err) = transport.read_available(pending) {
                    warn!(error = %err, "Declinometer read failed");
                    return None;
                }
                let end = pending.iter().rposition(|&b| b == b'\n')?;
                let latest = pending[..end]
                    .split(|&b| b == b'\n')
                    .filter_map(parse_line)
                    .last();
                pending.drain(..=end);
                latest.map(|angle| Frame::new(vec![angle]))
            }
        }
    }

    fn is_simulated(&self) -> bool {
        matches!(self.backend, Backend::Simulated(_))
    }

    fn channel_count(&self) -> usize {
        1
    }
}
