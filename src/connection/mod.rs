//! Connection to the chip's serial bootloader
//!
//! [Connection] owns the serial port, resets the chip into download mode,
//! synchronizes with the auto-bauding UART and exchanges SLIP-framed
//! request/response pairs with the loader.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{
    connection::{
        command::{Command, CommandType},
        reset::{ClassicReset, HardReset, ResetStrategy},
        slip::SlipDecoder,
    },
    error::{ConnectionError, Error, RomError},
    interface::SerialInterface,
};

pub mod command;
pub mod reset;
pub mod slip;

/// Number of chip resets attempted before giving up on connecting
const MAX_RESET_ATTEMPTS: usize = 4;
/// Number of sync exchanges attempted per reset
const MAX_SYNC_ATTEMPTS: usize = 4;
/// Stale or unrelated response frames tolerated while waiting for a reply
const MAX_RESPONSE_TRIES: usize = 100;

/// Value and trailing bytes carried by a bootloader response
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub value: u32,
    pub data: Vec<u8>,
}

/// Payload of a successfully checked command
///
/// Most commands answer in the header's value word; a few (flash MD5, some
/// stub replies) answer with a byte payload instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Value(u32),
    Bytes(Vec<u8>),
}

impl CommandResult {
    pub fn value(&self) -> u32 {
        match self {
            CommandResult::Value(value) => *value,
            CommandResult::Bytes(_) => 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            CommandResult::Value(_) => &[],
            CommandResult::Bytes(bytes) => bytes,
        }
    }
}

/// An active connection to a bootloader
pub struct Connection {
    serial: Box<dyn SerialInterface>,
    decoder: SlipDecoder,
}

impl Connection {
    pub fn new(serial: impl SerialInterface + 'static) -> Self {
        Connection {
            serial: Box::new(serial),
            decoder: SlipDecoder::new(),
        }
    }

    /// Reset the chip into download mode and synchronize with its loader
    pub fn begin(&mut self) -> Result<(), ConnectionError> {
        let mut last_error = None;

        for reset_attempt in 0..MAX_RESET_ATTEMPTS {
            debug!("Resetting chip (attempt {})", reset_attempt + 1);
            ClassicReset.reset(&mut *self.serial)?;

            for _ in 0..MAX_SYNC_ATTEMPTS {
                self.serial.discard_input()?;
                self.decoder.reset();

                match self.sync() {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        last_error = Some(err);
                        sleep(Duration::from_millis(50));
                    }
                }
            }
        }

        Err(last_error.unwrap_or(ConnectionError::ConnectionFailed))
    }

    /// One sync exchange: send the sync frame, read its reply, then drain
    /// the burst of identical replies the loader sends after it
    ///
    /// The loader echoes the reply seven more times; a missing echo means
    /// the UART has not locked on yet, so the whole attempt fails and the
    /// caller retries.
    fn sync(&mut self) -> Result<(), ConnectionError> {
        self.with_timeout(CommandType::Sync.timeout(), |conn| {
            conn.write_command(Command::Sync)?;
            conn.wait_for_response(Some(CommandType::Sync))?;

            for _ in 0..7 {
                conn.wait_for_response(None)?;
            }

            Ok(())
        })
    }

    /// Send `command` and wait for the matching response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, ConnectionError> {
        self.command_with_timeout(command, command.timeout())
    }

    /// Send `command` with an explicit response timeout
    pub fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, ConnectionError> {
        let command_type = command.command_type();
        self.with_timeout(timeout, |conn| {
            conn.write_command(command)?;
            conn.wait_for_response(Some(command_type))
        })
    }

    /// Read response frames until one matches, tolerating a bounded number
    /// of stale frames left over from earlier requests
    fn wait_for_response(
        &mut self,
        command: Option<CommandType>,
    ) -> Result<CommandResponse, ConnectionError> {
        for _ in 0..MAX_RESPONSE_TRIES {
            let frame = self.decoder.read_frame(&mut *self.serial)?;
            if frame.len() < 8 {
                debug!("Response frame too short ({} bytes), skipping", frame.len());
                continue;
            }

            let direction = frame[0];
            let opcode = frame[1];
            if direction != 1 {
                continue;
            }
            if let Some(expected) = command {
                if opcode != expected as u8 {
                    debug!(
                        "Response for opcode {:#04x} while waiting for {:?}, skipping",
                        opcode, expected
                    );
                    continue;
                }
            }

            let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            return Ok(CommandResponse {
                value,
                data: frame[8..].to_vec(),
            });
        }

        Err(ConnectionError::ResponseMismatch)
    }

    /// Read a register over the serial protocol
    ///
    /// The value travels in the response header, so this works before the
    /// chip type, and with it the status-byte layout, is known; only the
    /// leading success flag of the status is checked.
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address: reg })?;
        match response.data.first() {
            Some(0) => Ok(response.value),
            _ => Err(RomError::new("read register", response.data).into()),
        }
    }

    /// Set the ambient serial timeout
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    /// Run `f` with the serial timeout set to `timeout`, restoring the
    /// previous timeout afterwards
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, ConnectionError>
    where
        F: FnMut(&mut Connection) -> Result<T, ConnectionError>,
    {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;
        let result = f(self);
        self.serial.set_timeout(old_timeout)?;

        result
    }

    fn write_command(&mut self, command: Command<'_>) -> Result<(), ConnectionError> {
        debug!("Writing command: {}", command.command_type());

        let mut payload = Vec::new();
        command.write(&mut payload)?;
        self.write_packet(&payload)
    }

    /// SLIP-frame `payload` and write it out
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let framed = slip::encode(payload);
        self.serial.write_all(&framed)?;
        self.serial.flush()?;

        Ok(())
    }

    /// Write bytes without SLIP framing
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.serial.write_all(bytes)?;
        self.serial.flush()?;

        Ok(())
    }

    /// Read the next SLIP frame
    pub fn read_packet(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.decoder.read_frame(&mut *self.serial)
    }

    /// Change the local baud rate, dropping anything buffered at the old
    /// rate
    pub fn set_baud(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.serial.set_baud_rate(baud)?;
        self.serial.discard_input()?;
        self.decoder.reset();

        Ok(())
    }

    pub fn baud(&self) -> Result<u32, ConnectionError> {
        Ok(self.serial.baud_rate()?)
    }

    pub fn discard_input(&mut self) -> Result<(), ConnectionError> {
        self.serial.discard_input()?;
        self.decoder.reset();

        Ok(())
    }

    /// Reset the chip back into download mode
    pub fn reset(&mut self) -> Result<(), ConnectionError> {
        ClassicReset.reset(&mut *self.serial)
    }

    /// Reset the chip so it boots the firmware in flash
    pub fn reset_after_flash(&mut self) -> Result<(), ConnectionError> {
        HardReset.reset(&mut *self.serial)
    }

    pub fn into_serial(self) -> Box<dyn SerialInterface> {
        self.serial
    }
}
