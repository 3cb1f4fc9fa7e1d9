//! Byte transports under the instrument drivers.
//!
//! Drivers never block: they ask how much is buffered, take exactly that,
//! and decode what they can. [`SerialTransport`] talks to a USB serial
//! device; [`MemoryTransport`] is a scripted stand-in for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::HardwareError;

/// Non-blocking byte pipe to an instrument.
pub trait Transport: Send {
    /// Move every byte currently buffered by the device into `buf`.
    ///
    /// Returns the number of bytes appended; zero when nothing is waiting.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, HardwareError>;

    /// Write all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), HardwareError>;

    /// Discard everything buffered on the input side.
    fn clear_input(&mut self) -> Result<(), HardwareError>;
}

// =============================================================================
// Serial
// =============================================================================

/// A USB serial device opened through `serialport`.
#[cfg(feature = "instrument_serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    /// Open `port_name` at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, HardwareError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(std::time::Duration::from_millis(100))
            .open()
            .map_err(|err| HardwareError::Open {
                port: port_name.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }

    /// Port path, e.g. `/dev/ttyACM0`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, HardwareError> {
        let waiting = self
            .port
            .bytes_to_read()
            .map_err(|err| HardwareError::Transport(err.to_string()))? as usize;
        if waiting == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + waiting, 0);
        match std::io::Read::read(&mut self.port, &mut buf[start..]) {
            Ok(read) => {
                buf.truncate(start + read);
                Ok(read)
            }
            Err(err) => {
                buf.truncate(start);
                Err(err.into())
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), HardwareError> {
        std::io::Write::write_all(&mut self.port, data)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), HardwareError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|err| HardwareError::Transport(err.to_string()))
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    closed: bool,
}

/// Scripted transport: bytes pushed through a [`MemoryHandle`] become readable.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

/// Test-side end of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// New transport plus the handle that feeds it.
    pub fn new() -> (Self, MemoryHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                state: state.clone(),
            },
            MemoryHandle { state },
        )
    }
}

impl MemoryHandle {
    /// Make `bytes` readable by the driver.
    pub fn push(&self, bytes: &[u8]) {
        self.state.lock().incoming.extend(bytes.iter().copied());
    }

    /// Everything the driver has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Written bytes as text.
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().written).into_owned()
    }

    /// Bytes still unread by the driver.
    pub fn pending(&self) -> usize {
        self.state.lock().incoming.len()
    }

    /// Make every later transport call fail as if the port was unplugged.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }
}

impl Transport for MemoryTransport {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, HardwareError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HardwareError::Closed);
        }
        let read = state.incoming.len();
        buf.extend(state.incoming.drain(..));
        Ok(read)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HardwareError::Closed);
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HardwareError::Closed);
        }
        state.incoming.clear();
        Ok(())
    }
}
