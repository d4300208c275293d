//! Shared test support

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::Duration,
};

use crate::interface::SerialInterface;

/// In-memory serial port for unit tests
///
/// Reads drain a pre-loaded queue and report [io::ErrorKind::TimedOut] once
/// it is empty; writes are captured for inspection.
pub struct MockSerial {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    timeout: Duration,
    baud: u32,
}

impl MockSerial {
    pub fn new() -> Self {
        MockSerial {
            rx: VecDeque::new(),
            tx: Vec::new(),
            timeout: Duration::from_secs(3),
            baud: 115_200,
        }
    }

    pub fn with_input(input: &[u8]) -> Self {
        let mut serial = Self::new();
        serial.feed(input);
        serial
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }
}

impl Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialInterface for MockSerial {
    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.baud)
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn discard_input(&mut self) -> serialport::Result<()> {
        self.rx.clear();
        Ok(())
    }
}
