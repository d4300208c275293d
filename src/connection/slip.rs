//! SLIP framing over the serial byte stream
//!
//! The bootloader frames every packet between `0xC0` delimiters and escapes
//! any `0xC0`/`0xDB` inside the payload. The decoder here is a restartable
//! state machine: it holds partial frames and left-over bytes across calls,
//! so one noisy read does not lose the bytes that follow it.

use std::{collections::VecDeque, io};

use crate::{
    error::{ConnectionError, SlipWait},
    interface::SerialInterface,
};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode a payload as a single SLIP frame
///
/// `0xDB` is replaced before `0xC0` so the escape byte introduced for
/// `0xC0` is not itself escaped again.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(payload.len() + 2);
    encoded.push(END);
    for byte in payload {
        match *byte {
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            other => encoded.push(other),
        }
    }
    encoded.push(END);

    encoded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    Accumulating,
    InEscape,
}

/// Streaming SLIP decoder
///
/// Yields one decoded frame per [SlipDecoder::read_frame] call, blocking on
/// the underlying port. A framing violation aborts the current frame
/// attempt; retrying is the command layer's job.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
    frame: Vec<u8>,
    pending: VecDeque<u8>,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingHeader,
            frame: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Drop any partial frame and buffered bytes, e.g. after a reset or a
    /// baud-rate change.
    pub fn reset(&mut self) {
        self.state = State::AwaitingHeader;
        self.frame.clear();
        self.pending.clear();
    }

    /// Read and decode the next frame from `serial`
    pub fn read_frame(
        &mut self,
        serial: &mut dyn SerialInterface,
    ) -> Result<Vec<u8>, ConnectionError> {
        loop {
            while let Some(byte) = self.pending.pop_front() {
                if let Some(frame) = self.advance(byte)? {
                    return Ok(frame);
                }
            }

            let mut buf = [0u8; 1024];
            match serial.read(&mut buf) {
                Ok(0) => return Err(self.timeout()),
                Ok(n) => self.pending.extend(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => return Err(self.timeout()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn advance(&mut self, byte: u8) -> Result<Option<Vec<u8>>, ConnectionError> {
        match self.state {
            State::AwaitingHeader => {
                if byte == END {
                    self.state = State::Accumulating;
                    Ok(None)
                } else {
                    Err(ConnectionError::InvalidFrameHeader(byte))
                }
            }
            State::Accumulating => match byte {
                END => {
                    self.state = State::AwaitingHeader;
                    Ok(Some(std::mem::take(&mut self.frame)))
                }
                ESC => {
                    self.state = State::InEscape;
                    Ok(None)
                }
                other => {
                    self.frame.push(other);
                    Ok(None)
                }
            },
            State::InEscape => match byte {
                ESC_END => {
                    self.frame.push(END);
                    self.state = State::Accumulating;
                    Ok(None)
                }
                ESC_ESC => {
                    self.frame.push(ESC);
                    self.state = State::Accumulating;
                    Ok(None)
                }
                other => {
                    self.abort_frame();
                    Err(ConnectionError::InvalidEscape(other))
                }
            },
        }
    }

    fn abort_frame(&mut self) {
        self.state = State::AwaitingHeader;
        self.frame.clear();
    }

    fn timeout(&mut self) -> ConnectionError {
        let wait = if self.state == State::AwaitingHeader {
            SlipWait::Header
        } else {
            SlipWait::Content
        };
        self.abort_frame();

        ConnectionError::Timeout(wait)
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}
