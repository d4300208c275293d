//! A library for programming Espressif devices over their serial bootloader.
//!
//! The ROM bootloader on the ESP8266, ESP31 and ESP32 speaks a small binary
//! request/response protocol over an auto-bauding UART, framed with SLIP.
//! This crate drives that protocol: it resets the chip into download mode,
//! synchronizes with it, detects which family it is talking to, and then
//! writes, reads and verifies the external SPI flash either through the raw
//! ROM protocol or through a flasher stub uploaded into RAM.
//!
//! It also reads and writes the firmware image formats the bootloaders
//! expect on flash; see the [image_format] module.
//!
//! Command-line handling, ELF parsing and file plumbing are intentionally
//! out of scope; callers hand in `(address, bytes)` segments and an
//! entrypoint.

pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod interface;
pub mod targets;

#[cfg(test)]
pub(crate) mod tests;

pub use crate::{
    connection::Connection,
    error::Error,
    flasher::{Flasher, StubFlasher},
    targets::Chip,
};

/// Crate version, for embedding in user-facing tools.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
