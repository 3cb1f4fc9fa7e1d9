//! Hardware acquisition.
//!
//! Every instrument is an [`AcquisitionChannel`]: started, stopped, and
//! polled once per tick for its most recent frame. Drivers fall back to
//! synthetic generators when their device is absent, so the rest of the
//! station behaves identically in simulation.
//!
//! [`Acquisition`] combines the analog front end with an optional
//! dedicated angle sensor into one [`Sample`] per tick.

pub mod dataq;
pub mod declinometer;
pub mod discovery;
pub mod simulated;
pub mod transport;

use thiserror::Error;
use tracing::{info, warn};

use crate::clock::SharedTimeSource;
use crate::config::HardwareConfig;
use crate::measurement::{Frame, Sample};

pub use dataq::{ChannelTag, DataqFrontEnd, DEFAULT_TAGS, RANGE_VOLTS};
pub use declinometer::Declinometer;
pub use discovery::{discover, DiscoveredPorts, PortInfo, UsbId, ANGLE_SENSOR_ID, FRONT_END_ID};
pub use simulated::{SimulatedAngleSensor, SimulatedFrontEnd, SimulationParams};
#[cfg(feature = "instrument_serial")]
pub use transport::SerialTransport;
pub use transport::{MemoryHandle, MemoryTransport, Transport};

/// Errors from instrument transports and drivers.
///
/// Only setup and control paths return these. Polling absorbs them as
/// "no sample this tick".
#[derive(Error, Debug)]
pub enum HardwareError {
    /// The serial port could not be opened.
    #[error("Failed to open serial port '{port}': {reason}")]
    Open { port: String, reason: String },

    /// The serial driver reported an error.
    #[error("Serial transport error: {0}")]
    Transport(String),

    /// The device went away.
    #[error("Serial port closed")]
    Closed,

    /// A scan-list tag names a voltage range the device does not have.
    #[error("Invalid channel tag {0:#06x}")]
    InvalidChannelTag(u16),

    /// The front end was given no channels to scan.
    #[error("Scan list is empty")]
    EmptyScanList,

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform polling interface over one instrument.
pub trait AcquisitionChannel: Send {
    /// Begin streaming.
    fn start(&mut self) -> Result<(), HardwareError>;

    /// Stop streaming and discard any unread backlog.
    fn stop(&mut self) -> Result<(), HardwareError>;

    /// Drain everything buffered and return only the newest complete frame.
    ///
    /// Never blocks and never fails: transport errors and malformed frames
    /// are logged and reported as `None`.
    fn read_latest(&mut self) -> Option<Frame>;

    /// Whether the channel runs on synthetic data.
    fn is_simulated(&self) -> bool;

    /// Values in each frame.
    fn channel_count(&self) -> usize;
}

/// Open a serial transport, or explain why not.
pub fn open_serial(port: &str, baud_rate: u32) -> Result<Box<dyn Transport>, HardwareError> {
    #[cfg(feature = "instrument_serial")]
    {
        Ok(Box::new(SerialTransport::open(port, baud_rate)?))
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = (port, baud_rate);
        Err(HardwareError::SerialFeatureDisabled)
    }
}

/// Front-end channel carrying the raw angle when there is no dedicated sensor.
pub const ANGLE_CHANNEL: usize = 2;

/// Analog front end plus optional dedicated angle sensor.
pub struct Acquisition {
    front_end: Box<dyn AcquisitionChannel>,
    angle_sensor: Option<Box<dyn AcquisitionChannel>>,
    last_angle: Option<f64>,
}

impl Acquisition {
    /// Angle comes from front-end channel 2.
    ///
    /// A front end scanning fewer than three channels needs
    /// [`with_angle_sensor`](Self::with_angle_sensor), or no sample is ever
    /// produced.
    pub fn new(front_end: Box<dyn AcquisitionChannel>) -> Self {
        Self {
            front_end,
            angle_sensor: None,
            last_angle: None,
        }
    }

    /// Angle comes from a dedicated sensor.
    pub fn with_angle_sensor(mut self, sensor: Box<dyn AcquisitionChannel>) -> Self {
        self.angle_sensor = Some(sensor);
        self
    }

    /// Discover and open the instruments described by `config`, simulating
    /// whichever cannot be found or opened.
    ///
    /// Without a declinometer the angle is read from front-end channel 2. A
    /// simulated declinometer stands in when simulation is requested, when the
    /// sensor port fails to open, or when the front end scans only A and B.
    pub fn connect(config: &HardwareConfig, source: SharedTimeSource) -> Self {
        let ports = if config.simulate {
            info!("Hardware simulation requested");
            DiscoveredPorts::default()
        } else {
            discover()
        };

        let simulated_front_end = || {
            Box::new(DataqFrontEnd::simulated(SimulatedFrontEnd::new(
                source.clone(),
                config.simulation.clone(),
            ))) as Box<dyn AcquisitionChannel>
        };
        let front_end = match &ports.front_end {
            Some(port) => match open_serial(port, config.front_end_baud)
                .and_then(|transport| DataqFrontEnd::connect(transport, &config.channel_tags))
            {
                Ok(front_end) => {
                    info!(port = %port, "DATAQ front end connected");
                    Box::new(front_end) as Box<dyn AcquisitionChannel>
                }
                Err(err) => {
                    warn!(port = %port, error = %err, "DATAQ front end unavailable");
                    simulated_front_end()
                }
            },
            None => simulated_front_end(),
        };

        Self::attach_angle_sensor(front_end, ports.angle_sensor.as_deref(), config, source)
    }

    /// Pair `front_end` with the declinometer on `angle_port`, simulating one
    /// when it is needed but cannot be opened.
    fn attach_angle_sensor(
        front_end: Box<dyn AcquisitionChannel>,
        angle_port: Option<&str>,
        config: &HardwareConfig,
        source: SharedTimeSource,
    ) -> Self {
        let simulated_sensor = || {
            Box::new(Declinometer::simulated(SimulatedAngleSensor::new(
                source.clone(),
                config.simulation.clone(),
            ))) as Box<dyn AcquisitionChannel>
        };
        let angle_sensor = match angle_port {
            Some(port) => match open_serial(port, config.angle_sensor_baud) {
                Ok(transport) => {
                    info!(port = %port, "Declinometer connected");
                    Some(Box::new(Declinometer::connect(transport)) as Box<dyn AcquisitionChannel>)
                }
                Err(err) => {
                    warn!(port = %port, error = %err, "Declinometer unavailable");
                    Some(simulated_sensor())
                }
            },
            None if config.simulate || front_end.channel_count() <= ANGLE_CHANNEL => Some(simulated_sensor()),
            None => None,
        };

        let acquisition = Self::new(front_end);
        match angle_sensor {
            Some(sensor) => acquisition.with_angle_sensor(sensor),
            None => acquisition,
        }
    }

    /// Start every channel.
    pub fn start(&mut self) -> Result<(), HardwareError> {
        self.front_end.start()?;
        if let Some(sensor) = &mut self.angle_sensor {
            sensor.start()?;
        }
        Ok(())
    }

    /// Stop every channel, discarding backlog.
    pub fn stop(&mut self) -> Result<(), HardwareError> {
        self.front_end.stop()?;
        if let Some(sensor) = &mut self.angle_sensor {
            sensor.stop()?;
        }
        self.last_angle = None;
        Ok(())
    }

    /// Whether any channel is simulated.
    pub fn is_simulated(&self) -> bool {
        self.front_end.is_simulated() || self.angle_sensor.as_ref().is_some_and(|s| s.is_simulated())
    }

    /// Take this tick's sample, stamped with `sidereal`.
    ///
    /// `None` when the front end has nothing new, or no angle has been seen yet.
    /// A dedicated sensor that is momentarily silent reuses its last reading.
    pub fn sample(&mut self, sidereal: f64) -> Option<Sample> {
        let frame = self.front_end.read_latest()?;
        let angle = match &mut self.angle_sensor {
            Some(sensor) => {
                if let Some(angle) = sensor.read_latest().and_then(|f| f.channel(0)) {
                    self.last_angle = Some(angle);
                }
                self.last_angle?
            }
            None => frame.channel(ANGLE_CHANNEL)?,
        };
        Some(Sample {
            timestamp: sidereal,
            a: frame.channel(0)?,
            b: frame.channel(1)?,
            angle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;

    fn scan(raw: [i16; 3]) -> Vec<u8> {
        raw.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn angle_from_front_end_channel() {
        let (transport, handle) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS).unwrap();
        let mut acquisition = Acquisition::new(Box::new(front_end));
        assert!(acquisition.sample(10.0).is_none());

        handle.push(&scan([16384, 8192, -16384]));
        let sample = acquisition.sample(10.0).unwrap();
        assert_eq!(sample.timestamp, 10.0);
        assert_eq!((sample.a, sample.b, sample.angle), (2.5, 1.25, -2.5));
    }

    #[test]
    fn dedicated_sensor_reading_is_held() {
        let (transport, handle) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS).unwrap();
        let (sensor_transport, sensor) = MemoryTransport::new();
        let mut acquisition = Acquisition::new(Box::new(front_end))
            .with_angle_sensor(Box::new(Declinometer::connect(Box::new(sensor_transport))));

        handle.push(&scan([0, 0, 0]));
        assert!(acquisition.sample(1.0).is_none());

        sensor.push(b"0.25\n");
        handle.push(&scan([0, 0, 0]));
        assert_eq!(acquisition.sample(2.0).unwrap().angle, 0.25);

        handle.push(&scan([0, 0, 0]));
        assert_eq!(acquisition.sample(3.0).unwrap().angle, 0.25);
    }

    #[test]
    fn simulated_config_never_touches_ports() {
        let config = HardwareConfig {
            simulate: true,
            ..HardwareConfig::default()
        };
        let mut acquisition = Acquisition::connect(&config, ManualTime::shared(100.0));
        assert!(acquisition.is_simulated());
        acquisition.start().unwrap();
        assert!(acquisition.sample(5.0).is_some());
        assert!(acquisition.angle_sensor.as_ref().is_some_and(|s| s.is_simulated()));
    }

    #[test]
    fn two_channel_front_end_gets_a_simulated_angle_sensor() {
        let (transport, handle) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS[..2]).unwrap();
        let config = HardwareConfig {
            simulation: SimulationParams {
                angle: 0.4,
                ..SimulationParams::default()
            },
            ..HardwareConfig::default()
        };
        let mut acquisition =
            Acquisition::attach_angle_sensor(Box::new(front_end), None, &config, ManualTime::shared(0.0));
        assert!(acquisition.is_simulated());
        acquisition.start().unwrap();

        handle.push(&scan([16384, 8192, 0])[..4]);
        let sample = acquisition.sample(7.0).unwrap();
        assert_eq!((sample.a, sample.b, sample.angle), (2.5, 1.25, 0.4));
    }

    #[test]
    fn three_channel_front_end_keeps_its_angle_channel() {
        let (transport, _handle) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS).unwrap();
        let acquisition = Acquisition::attach_angle_sensor(
            Box::new(front_end),
            None,
            &HardwareConfig::default(),
            ManualTime::shared(0.0),
        );
        assert!(acquisition.angle_sensor.is_none());
        assert!(!acquisition.is_simulated());
    }

    #[test]
    fn unopenable_angle_sensor_is_simulated() {
        let (transport, handle) = MemoryTransport::new();
        let front_end = DataqFrontEnd::connect(Box::new(transport), &DEFAULT_TAGS).unwrap();
        let mut acquisition = Acquisition::attach_angle_sensor(
            Box::new(front_end),
            Some("/dev/threepio-no-such-port"),
            &HardwareConfig::default(),
            ManualTime::shared(0.0),
        );
        assert!(acquisition.is_simulated());

        handle.push(&scan([0, 0, 16384]));
        assert_eq!(acquisition.sample(1.0).unwrap().angle, 0.0);
    }
}
