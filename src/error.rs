//! Library errors

use std::io;

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::targets::Chip;

/// All possible errors returned by esploader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Unrecognized UART datecode value: {0:#010x}")]
    #[diagnostic(
        code(esploader::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(u32),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("The flasher stub returned status {status:#04x} while trying to {operation}")]
    #[diagnostic(code(esploader::stub::status))]
    StubStatus { operation: &'static str, status: u8 },

    #[error("Unexpected packet while trying to {operation}: {}", hex(.packet))]
    #[diagnostic(code(esploader::stub::unexpected_packet))]
    UnexpectedPacket {
        operation: &'static str,
        packet: Vec<u8>,
    },

    #[error("MD5 digest mismatch: expected {}, received {}", hex(.expected), hex(.received))]
    #[diagnostic(
        code(esploader::digest_mismatch),
        help("The data in flash does not match what was sent; not retrying automatically")
    )]
    DigestMismatch {
        expected: Vec<u8>,
        received: Vec<u8>,
    },

    #[error("Address {addr:#x} and length {len:#x} must be multiples of the {sector_size:#x} byte flash sector size")]
    #[diagnostic(code(esploader::unaligned))]
    UnalignedFlashOperation {
        addr: u32,
        len: usize,
        sector_size: usize,
    },

    #[error("The {chip} does not support {feature}")]
    #[diagnostic(code(esploader::unsupported_feature))]
    UnsupportedFeature { chip: Chip, feature: &'static str },

    #[error("Flash size '{0}' is not supported by this chip type")]
    #[diagnostic(code(esploader::invalid_flash_size))]
    InvalidFlashSize(String),

    #[error("Unknown OUI in OTP MAC words")]
    #[diagnostic(code(esploader::unknown_oui))]
    UnknownOui,

    #[error("Stub requires {expected} parameter words, {provided} provided")]
    #[diagnostic(code(esploader::stub::params))]
    StubParameterCount { expected: u32, provided: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Image(#[from] ImageError),

    #[error("Internal error")]
    InternalError,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// Errors concerning the serial connection and SLIP framing
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Invalid head of packet ({0:#04x})")]
    #[diagnostic(
        code(esploader::slip_framing),
        help("Try hard-resetting the device and try again")
    )]
    InvalidFrameHeader(u8),

    #[error("Invalid SLIP escape sequence (0xdb, {0:#04x})")]
    #[diagnostic(code(esploader::slip_escape))]
    InvalidEscape(u8),

    #[error("Timed out waiting for packet {0}")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(SlipWait),

    #[error("Response doesn't match request")]
    #[diagnostic(
        code(esploader::response_mismatch),
        help("The bootloader kept replying to a different request; try resetting the device")
    )]
    ResponseMismatch,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(esploader::stub_handshake))]
    InvalidStubHandshake,

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),
}

/// What the SLIP decoder was waiting for when the port timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SlipWait {
    Header,
    Content,
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(SlipWait::Header),
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err.into()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(io::ErrorKind::TimedOut) => ConnectionError::Timeout(SlipWait::Header),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// Reason codes reported in the second status byte of a failed response
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[default]
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A command the device's bootloader rejected.
///
/// Carries the raw status bytes from the response so they can be inspected
/// when the reason code alone is not enough.
#[derive(Clone, Debug, Diagnostic, Error)]
#[error("Failed to {operation} (status bytes: {})", hex(.status))]
#[non_exhaustive]
pub struct RomError {
    operation: &'static str,
    status: Vec<u8>,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(operation: &'static str, status: Vec<u8>) -> RomError {
        // the first status byte flags the failure, the second is the reason
        let kind = status.get(1).copied().map(RomErrorKind::from).unwrap_or_default();
        RomError {
            operation,
            status,
            kind,
        }
    }

    pub fn status(&self) -> &[u8] {
        &self.status
    }
}

/// Errors raised while loading or saving a firmware image
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ImageError {
    #[error("Invalid firmware image magic {magic:#04x} (segment count {segments})")]
    #[diagnostic(code(esploader::image::magic))]
    InvalidMagic { magic: u8, segments: u8 },

    #[error("End of file reading segment {addr:#x}, length {expected} (actual length {actual})")]
    #[diagnostic(code(esploader::image::truncated))]
    TruncatedSegment {
        addr: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Image checksum {actual:#04x} does not match computed checksum {expected:#04x}")]
    #[diagnostic(code(esploader::image::checksum))]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Found {0} segments that could be irom0; expected exactly one")]
    #[diagnostic(
        code(esploader::image::irom_segments),
        help("Bad ELF file? The IROM map window must contain a single segment")
    )]
    AmbiguousIromSegment(usize),

    #[error(
        "Segment loaded at {addr:#010x} lands in same 64KB flash mapping as segment loaded at {last_addr:#010x}"
    )]
    #[diagnostic(
        code(esploader::image::mapping_collision),
        help("Can't generate binary. Suggest changing linker script or ELF to merge sections")
    )]
    MappingCollision { addr: u32, last_addr: u32 },

    #[error("IO error while reading or writing image: {0}")]
    #[diagnostic(code(esploader::image::io))]
    Io(#[from] io::Error),
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:#04x}", b))
        .collect::<Vec<_>>()
        .join(", ")
}
