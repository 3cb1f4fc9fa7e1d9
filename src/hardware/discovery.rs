//! USB device discovery.
//!
//! Both instruments enumerate as USB serial ports. They are told apart by
//! vendor/product id only; port names change between machines and boots.

use tracing::{debug, info, warn};

/// USB vendor/product identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    /// Vendor id.
    pub vid: u16,
    /// Product id.
    pub pid: u16,
}

impl std::fmt::Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// DATAQ Instruments analog front end.
pub const FRONT_END_ID: UsbId = UsbId {
    vid: 0x0683,
    pid: 0x4109,
};

/// Arduino Uno running the declinometer sketch.
pub const ANGLE_SENSOR_ID: UsbId = UsbId {
    vid: 0x2341,
    pid: 0x0043,
};

/// One enumerated serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS port path.
    pub name: String,
    /// USB id, when the port is a USB device.
    pub usb: Option<UsbId>,
}

/// Ports matched to the two instruments; `None` means "run simulated".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredPorts {
    /// Analog front end port.
    pub front_end: Option<String>,
    /// Angle sensor port.
    pub angle_sensor: Option<String>,
}

/// Match enumerated ports against the instrument ids. Last match wins.
pub fn classify(ports: &[PortInfo]) -> DiscoveredPorts {
    let mut found = DiscoveredPorts::default();
    for port in ports {
        match port.usb {
            Some(id) if id == FRONT_END_ID => found.front_end = Some(port.name.clone()),
            Some(id) if id == ANGLE_SENSOR_ID => found.angle_sensor = Some(port.name.clone()),
            _ => debug!(port = %port.name, "Ignoring serial port"),
        }
    }
    found
}

/// Enumerate serial ports on this machine.
#[cfg(feature = "instrument_serial")]
pub fn enumerate() -> Result<Vec<PortInfo>, super::HardwareError> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports()
        .map_err(|err| super::HardwareError::Transport(err.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|port| PortInfo {
            usb: match port.port_type {
                SerialPortType::UsbPort(info) => Some(UsbId {
                    vid: info.vid,
                    pid: info.pid,
                }),
                _ => None,
            },
            name: port.port_name,
        })
        .collect())
}

/// Without serial support nothing can be enumerated.
#[cfg(not(feature = "instrument_serial"))]
pub fn enumerate() -> Result<Vec<PortInfo>, super::HardwareError> {
    Ok(Vec::new())
}

/// Enumerate and classify. Enumeration failure counts as "no devices".
pub fn discover() -> DiscoveredPorts {
    let ports = match enumerate() {
        Ok(ports) => ports,
        Err(err) => {
            warn!(error = %err, "Could not enumerate serial ports");
            Vec::new()
        }
    };
    let found = classify(&ports);
    info!(
        front_end = ?found.front_end,
        angle_sensor = ?found.angle_sensor,
        "Hardware discovery complete"
    );
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, usb: Option<UsbId>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            usb,
        }
    }

    #[test]
    fn matches_both_instruments() {
        let ports = vec![
            port("/dev/ttyS0", None),
            port("/dev/ttyACM0", Some(ANGLE_SENSOR_ID)),
            port("/dev/ttyACM1", Some(FRONT_END_ID)),
            port("/dev/ttyUSB0", Some(UsbId { vid: 0x0403, pid: 0x6001 })),
        ];
        let found = classify(&ports);
        assert_eq!(found.front_end.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(found.angle_sensor.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn nothing_plugged_in_is_not_an_error() {
        assert_eq!(classify(&[]), DiscoveredPorts::default());
    }

    #[test]
    fn usb_id_displays_like_hwid() {
        assert_eq!(FRONT_END_ID.to_string(), "0683:4109");
    }
}
