//! DATAQ Instruments analog front end.
//!
//! The device streams binary scans: one little-endian `i16` per configured
//! channel, in scan-list order, repeated forever. Nothing on the wire says
//! which channel a value belongs to, so frames are only meaningful when read
//! in whole scans of exactly `2 * channels` bytes.
//!
//! Each scan-list entry is a tag: the low two bits are the analog input and
//! the high byte indexes [`RANGE_VOLTS`].

use tracing::{debug, info, warn};

use super::simulated::SimulatedFrontEnd;
use super::transport::Transport;
use super::{AcquisitionChannel, HardwareError};
use crate::measurement::Frame;

/// Full-scale voltage for each range index.
pub const RANGE_VOLTS: [f64; 6] = [10.0, 5.0, 2.0, 1.0, 0.5, 0.2];

/// Telescope A, telescope B and the analog declinometer, all at ±5 V.
pub const DEFAULT_TAGS: [u16; 3] = [0x0100, 0x0101, 0x0102];

/// `dec` and `srate` for ~100 Hz: 60 MHz / (1171 * 512).
const DECIMATION: u32 = 512;
const SAMPLE_RATE_DIVISOR: u32 = 1171;

/// A validated scan-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTag(u16);

impl ChannelTag {
    /// Validate a raw tag.
    pub fn new(tag: u16) -> Result<Self, HardwareError> {
        if usize::from(tag >> 8) >= RANGE_VOLTS.len() {
            return Err(HardwareError::InvalidChannelTag(tag));
        }
        Ok(Self(tag))
    }

    /// Analog input the tag reads.
    pub fn channel(self) -> usize {
        usize::from(self.0 & 3)
    }

    /// Full-scale voltage.
    pub fn range_volts(self) -> f64 {
        RANGE_VOLTS[usize::from(self.0 >> 8)]
    }

    /// The raw tag.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Scale one raw sample to volts.
    pub fn decode(self, bytes: [u8; 2]) -> f64 {
        self.range_volts() * f64::from(i16::from_le_bytes(bytes)) / 32768.0
    }
}

/// Commands that put the device in binary streaming mode with `tags` as scan list.
pub fn setup_commands(tags: &[ChannelTag]) -> Vec<String> {
    let mut commands = vec!["stop".to_string(), "encode 0".to_string(), "ps 0".to_string()];
    commands.extend(
        tags.iter()
            .enumerate()
            .map(|(i, tag)| format!("slist {} {}", i, tag.raw())),
    );
    commands.push(format!("dec {}", DECIMATION));
    commands.push(format!("srate {}", SAMPLE_RATE_DIVISOR));
    commands
}

enum Backend {
    Serial {
        transport: Box<dyn Transport>,
        pending: Vec<u8>,
    },
    Simulated(SimulatedFrontEnd),
}

/// The analog front end, physical or simulated.
pub struct DataqFrontEnd {
    backend: Backend,
    tags: Vec<ChannelTag>,
    acquiring: bool,
}

impl DataqFrontEnd {
    /// Attach to a device and send the setup sequence.
    pub fn connect(transport: Box<dyn Transport>, tags: &[u16]) -> Result<Self, HardwareError> {
        if tags.is_empty() {
            return Err(HardwareError::EmptyScanList);
        }
        let tags = tags
            .iter()
            .map(|&tag| ChannelTag::new(tag))
            .collect::<Result<Vec<_>, _>>()?;
        let mut front_end = Self {
            backend: Backend::Serial {
                transport,
                pending: Vec::new(),
            },
            tags,
            acquiring: false,
        };
        for command in setup_commands(&front_end.tags) {
            front_end.send(&command)?;
        }
        info!(channels = front_end.tags.len(), "DATAQ front end configured");
        Ok(front_end)
    }

    /// Run on synthetic data.
    pub fn simulated(generator: SimulatedFrontEnd) -> Self {
        warn!("DATAQ front end not found, simulating data");
        Self {
            backend: Backend::Simulated(generator),
            tags: DEFAULT_TAGS.iter().map(|&tag| ChannelTag(tag)).collect(),
            acquiring: false,
        }
    }

    /// Configured scan list.
    pub fn tags(&self) -> &[ChannelTag] {
        &self.tags
    }

    /// Whether `start` has been sent without a matching `stop`.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Simulation knobs, when simulated.
    pub fn simulator_mut(&mut self) -> Option<&mut SimulatedFrontEnd> {
        match &mut self.backend {
            Backend::Simulated(generator) => Some(generator),
            Backend::Serial { .. } => None,
        }
    }

    /// Reset the device's counters.
    pub fn reset(&mut self) -> Result<(), HardwareError> {
        self.send("reset 1")
    }

    fn send(&mut self, command: &str) -> Result<(), HardwareError> {
        if let Backend::Serial { transport, .. } = &mut self.backend {
            debug!(command, "DATAQ command");
            transport.write_all(format!("{}\r", command).as_bytes())?;
        }
        Ok(())
    }

    fn scan_bytes(&self) -> usize {
        2 * self.tags.len()
    }

    fn decode_scan(&self, scan: &[u8]) -> Frame {
        let width = self.tags.iter().map(|t| t.channel() + 1).max().unwrap_or(0);
        let mut values = vec![0.0; width];
        for (tag, bytes) in self.tags.iter().zip(scan.chunks_exact(2)) {
            values[tag.channel()] = tag.decode([bytes[0], bytes[1]]);
        }
        Frame::new(values)
    }
}

impl AcquisitionChannel for DataqFrontEnd {
    fn start(&mut self) -> Result<(), HardwareError> {
        self.send("start")?;
        self.acquiring = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.send("stop")?;
        if let Backend::Serial { transport, pending } = &mut self.backend {
            transport.clear_input()?;
            pending.clear();
        }
        self.acquiring = false;
        Ok(())
    }

    fn read_latest(&mut self) -> Option<Frame> {
        let scan_bytes = self.scan_bytes();
        let latest = match &mut self.backend {
            Backend::Simulated(generator) => return Some(generator.frame()),
            Backend::Serial { transport, pending } => {
                if let Err(err) = transport.read_available(pending) {
                    warn!(error = %err, "DATAQ read failed");
                    return None;
                }
                let complete = pending.len() / scan_bytes * scan_bytes;
                if complete == 0 {
                    return None;
                }
                let scans = complete / scan_bytes;
                if scans > 1 {
                    debug!(dropped = scans - 1, "Dropping stale DATAQ scans");
                }
                let latest = pending[complete - scan_bytes..complete].to_vec();
                pending.drain(..complete);
                latest
            }
        };
        Some(self.decode_scan(&latest))
    }

    fn is_simulated(&self) -> bool {
        matches!(self.backend, Backend::Simulated(_))
    }

    fn channel_count(&self) -> usize {
        self.tags.len()
    }
}
