//! Physical channel abstraction
//!
//! The link worker talks to the display through a [`LinkChannel`], obtained
//! from a [`ChannelOpener`] on every (re)connect attempt. The serial
//! implementation wraps a `serialport` handle; tests inject in-memory
//! channels through the same seam.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

use super::serial::{clear_buffers, configure_port, list_ports, open_port};
use super::LinkError;

/// A bidirectional byte channel to the display
pub trait LinkChannel: Read + Write + Send {
    /// Discard anything the peer sent before we were ready
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Get number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Human-readable channel name for logs
    fn name(&self) -> String;
}

/// Produces a fresh channel for each connection attempt
pub trait ChannelOpener: Send {
    fn open(&mut self) -> Result<Box<dyn LinkChannel>, LinkError>;
}

/// Serial port wrapper implementing LinkChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>, name: String) -> Self {
        Self { port, name }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl LinkChannel for SerialChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Opens the display's serial port, auto-detecting it when no name is set
pub struct SerialOpener {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(port_name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout,
        }
    }

    fn resolve_port(&self) -> Result<String, LinkError> {
        if !self.port_name.is_empty() {
            return Ok(self.port_name.clone());
        }
        // Microcontroller boards enumerate as ttyACM*/ttyUSB*, which sort first
        list_ports()
            .into_iter()
            .next()
            .map(|p| p.name)
            .ok_or(LinkError::NoPortFound)
    }
}

impl ChannelOpener for SerialOpener {
    fn open(&mut self) -> Result<Box<dyn LinkChannel>, LinkError> {
        let name = self.resolve_port()?;
        debug!(port = %name, baud = self.baud_rate, "opening serial port");
        let mut port = open_port(&name, Some(self.baud_rate), self.timeout)?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        Ok(Box::new(SerialChannel::new(port, name)))
    }
}
