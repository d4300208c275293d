//! Serial transport abstraction
//!
//! [SerialInterface] is the narrow seam between the protocol code and the
//! actual serial port: byte IO, timeouts, baud-rate changes and the RTS/DTR
//! lines used to strap the chip into download mode. Production code uses
//! [Interface], a thin wrapper around a [serialport::SerialPort]; tests
//! substitute a scripted implementation.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};

/// Operations the connection needs from a serial port
pub trait SerialInterface: Read + Write {
    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()>;

    fn timeout(&self) -> Duration;

    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()>;

    fn baud_rate(&self) -> serialport::Result<u32>;

    /// Set the RTS line (wired to chip enable / reset on dev boards)
    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()>;

    /// Set the DTR line (wired to GPIO0, the boot-strap pin, on dev boards)
    fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()>;

    /// Throw away any bytes already received but not yet read
    fn discard_input(&mut self) -> serialport::Result<()>;
}

/// Wrapper around [SerialPort] implementing [SerialInterface]
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
}

impl Interface {
    pub fn new(serial_port: Box<dyn SerialPort>) -> Self {
        Interface { serial_port }
    }

    /// Open a serial port with the given baud rate
    ///
    /// Setting the baud rate in a separate step is a workaround for the
    /// CH341 driver on some Linux versions, which opens at 9600 and then
    /// reconfigures.
    pub fn open(path: &str, baud: u32) -> serialport::Result<Self> {
        let mut serial_port = serialport::new(path, 9600).open()?;
        serial_port.set_baud_rate(baud)?;

        Ok(Interface { serial_port })
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }
}

impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}

impl Write for Interface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.serial_port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.serial_port.flush()
    }
}

impl SerialInterface for Interface {
    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.serial_port.set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        self.serial_port.timeout()
    }

    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
        self.serial_port.set_baud_rate(baud)
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        self.serial_port.baud_rate()
    }

    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_request_to_send(level)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> serialport::Result<()> {
        self.serial_port.write_data_terminal_ready(level)
    }

    fn discard_input(&mut self) -> serialport::Result<()> {
        self.serial_port.clear(ClearBuffer::Input)
    }
}
