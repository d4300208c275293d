//! The RAM flasher stub and its streaming protocol
//!
//! The stub is uploaded through the ROM's RAM download commands and then
//! speaks its own, much denser protocol: single-byte commands, raw
//! unframed data bursts with a sliding in-flight window, and whole-payload
//! MD5 digests instead of per-block checksums.

use base64::{engine::general_purpose, Engine};
use log::{debug, warn};
use md5::{Digest, Md5};
use serde::Deserialize;

use crate::{
    error::{ConnectionError, Error},
    flasher::{Flasher, DEFAULT_BAUD},
};

const STUB_TOML: &str = include_str!("../../resources/stubs/esp8266.toml");

/// Commands understood by the running stub
mod cmd {
    pub const FLASH_WRITE: u8 = 1;
    pub const FLASH_READ: u8 = 2;
    pub const FLASH_DIGEST: u8 = 3;
    pub const FLASH_ERASE_CHIP: u8 = 5;
    pub const BOOT_FW: u8 = 6;
}

/// Without hardware flow control, writes must not outrun the device's
/// receive FIFO; the stub acknowledges progress and we cap the gap.
const MAX_BYTES_IN_FLIGHT: usize = 5120;
const WRITE_CHUNK: usize = 1024;

/// Read-side equivalents; USB serial adapters have small FIFOs, so the
/// stub sends small packets and keeps few of them in flight.
const READ_BLOCK_SIZE: u32 = 32;
const READ_MAX_IN_FLIGHT: u32 = 64;

/// The embedded stub binary and its load layout
#[derive(Debug, Clone, Deserialize)]
pub struct FlashStub {
    entry: u32,
    params_start: u32,
    data_start: u32,
    num_params: u32,
    code: String,
    data: Option<String>,
}

impl FlashStub {
    pub fn get() -> Self {
        // compile time asset, known to parse
        toml::from_str(STUB_TOML).unwrap()
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    fn code(&self) -> Vec<u8> {
        general_purpose::STANDARD.decode(&self.code).unwrap()
    }

    fn data(&self) -> Option<Vec<u8>> {
        self.data
            .as_ref()
            .map(|data| general_purpose::STANDARD.decode(data).unwrap())
    }
}

/// A flasher whose stub is up and greeting
pub struct StubFlasher<'a> {
    flasher: &'a mut Flasher,
}

impl<'a> StubFlasher<'a> {
    /// Upload and start the stub, optionally negotiating a higher baud
    /// rate, and wait for its greeting
    pub fn start(flasher: &'a mut Flasher, baud: Option<u32>) -> Result<StubFlasher<'a>, Error> {
        if flasher.stub_active() {
            return Ok(StubFlasher { flasher });
        }

        debug!("Uploading flasher stub");
        let stub = FlashStub::get();
        // staying at the sync rate is signalled as zero
        let baud = baud.filter(|baud| *baud > DEFAULT_BAUD).unwrap_or(0);
        Self::upload(flasher, &stub, &[baud])?;

        if baud > 0 {
            flasher.connection().set_baud(baud)?;
        }

        let greeting = flasher.connection().read_packet()?;
        if greeting != b"OHAI" {
            return Err(ConnectionError::InvalidStubHandshake.into());
        }
        debug!("Flasher stub is running");
        flasher.set_stub_active();

        Ok(StubFlasher { flasher })
    }

    /// Upload the stub image and jump to its entrypoint
    ///
    /// The parameter words land directly in front of the code, at the
    /// address the stub expects to find them.
    fn upload(flasher: &mut Flasher, stub: &FlashStub, params: &[u32]) -> Result<(), Error> {
        if stub.num_params as usize != params.len() {
            return Err(Error::StubParameterCount {
                expected: stub.num_params,
                provided: params.len(),
            });
        }

        let mut image: Vec<u8> = params.iter().flat_map(|param| param.to_le_bytes()).collect();
        image.extend_from_slice(&stub.code());

        flasher.mem_begin(image.len() as u32, 1, image.len() as u32, stub.params_start)?;
        flasher.mem_block(&image, 0)?;

        if let Some(data) = stub.data() {
            flasher.mem_begin(data.len() as u32, 1, data.len() as u32, stub.data_start)?;
            flasher.mem_block(&data, 0)?;
        }

        flasher.mem_finish(stub.entry)
    }

    /// Stream `data` into flash at `addr` and verify the stub's digest of
    /// what it wrote
    pub fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let sector_size = self.flasher.profile().flash_sector_size as usize;
        if addr as usize % sector_size != 0 || data.len() % sector_size != 0 {
            return Err(Error::UnalignedFlashOperation {
                addr,
                len: data.len(),
                sector_size,
            });
        }

        debug!("Writing {} bytes at {:#x}", data.len(), addr);
        let connection = self.flasher.connection();
        connection.write_packet(&[cmd::FLASH_WRITE])?;

        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(&addr.to_le_bytes());
        header.extend_from_slice(&(data.len() as u32).to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        connection.write_packet(&header)?;

        let mut num_sent = 0usize;
        let mut num_written = 0usize;
        while num_written < data.len() {
            let packet = connection.read_packet().map_err(Error::Flashing)?;
            match packet.len() {
                4 => {
                    num_written =
                        u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
                    // the stub cannot have written bytes it never received
                    if num_written > num_sent {
                        return Err(Error::UnexpectedPacket {
                            operation: "write to flash",
                            packet,
                        });
                    }
                }
                1 => {
                    return Err(Error::StubStatus {
                        operation: "write to flash",
                        status: packet[0],
                    });
                }
                _ => {
                    return Err(Error::UnexpectedPacket {
                        operation: "write to flash",
                        packet,
                    });
                }
            }

            // top the window back up with raw, unframed data
            while num_sent < data.len() && num_sent - num_written < MAX_BYTES_IN_FLIGHT {
                let end = usize::min(num_sent + WRITE_CHUNK, data.len());
                connection.write_raw(&data[num_sent..end])?;
                num_sent = end;
            }
        }

        self.check_digest("write to flash", data)?;
        self.read_status("write to flash")
    }

    /// Read `len` bytes of flash starting at `addr`
    pub fn flash_read(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, Error> {
        debug!("Reading {} bytes at {:#x}", len, addr);
        let connection = self.flasher.connection();
        connection.write_packet(&[cmd::FLASH_READ])?;

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&addr.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&READ_BLOCK_SIZE.to_le_bytes());
        header.extend_from_slice(&READ_MAX_IN_FLIGHT.to_le_bytes());
        connection.write_packet(&header)?;

        let mut data = Vec::with_capacity(len as usize);
        while (data.len() as u32) < len {
            let packet = connection.read_packet().map_err(Error::Flashing)?;
            data.extend_from_slice(&packet);
            // acknowledge total progress so the stub keeps sending
            connection.write_packet(&(data.len() as u32).to_le_bytes())?;

            if data.len() as u32 > len {
                return Err(Error::UnexpectedPacket {
                    operation: "read flash",
                    packet,
                });
            }
        }

        self.check_digest("read flash", &data)?;
        self.read_status("read flash")?;

        Ok(data)
    }

    /// Ask the stub for per-block digests plus one whole-region digest
    pub fn flash_digest(
        &mut self,
        addr: u32,
        len: u32,
        block_size: u32,
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
        let connection = self.flasher.connection();
        connection.write_packet(&[cmd::FLASH_DIGEST])?;

        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(&addr.to_le_bytes());
        header.extend_from_slice(&len.to_le_bytes());
        header.extend_from_slice(&block_size.to_le_bytes());
        connection.write_packet(&header)?;

        let mut digests: Vec<Vec<u8>> = Vec::new();
        loop {
            let packet = connection.read_packet().map_err(Error::Flashing)?;
            match packet.len() {
                16 => digests.push(packet),
                1 => {
                    if packet[0] != 0 {
                        return Err(Error::StubStatus {
                            operation: "digest flash",
                            status: packet[0],
                        });
                    }
                    break;
                }
                _ => {
                    return Err(Error::UnexpectedPacket {
                        operation: "digest flash",
                        packet,
                    });
                }
            }
        }

        let overall = digests.pop().ok_or(Error::InternalError)?;

        Ok((overall, digests))
    }

    /// Verify a flash region against `data` without reading it back
    ///
    /// Only on a digest mismatch is the region read back, to report how
    /// many bytes actually differ.
    pub fn verify(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let (digest, _) = self.flash_digest(addr, data.len() as u32, 0)?;

        let expected = Md5::digest(data);
        if digest == expected.to_vec() {
            return Ok(());
        }

        let flashed = self.flash_read(addr, data.len() as u32)?;
        let differing = flashed.iter().zip(data).filter(|(a, b)| a != b).count();
        warn!(
            "Verification failed: {} of {} bytes differ",
            differing,
            data.len()
        );

        Err(Error::DigestMismatch {
            expected: expected.to_vec(),
            received: digest,
        })
    }

    /// Erase the entire flash chip
    pub fn erase_chip(&mut self) -> Result<(), Error> {
        self.flasher
            .connection()
            .write_packet(&[cmd::FLASH_ERASE_CHIP])?;
        self.read_status("erase chip")
    }

    /// Leave the stub and boot the firmware in flash
    pub fn boot_fw(&mut self) -> Result<(), Error> {
        self.flasher.connection().write_packet(&[cmd::BOOT_FW])?;
        self.read_status("boot firmware")
    }

    /// Compare the stub's 16 byte digest packet with our own MD5
    fn check_digest(&mut self, operation: &'static str, data: &[u8]) -> Result<(), Error> {
        let packet = self
            .flasher
            .connection()
            .read_packet()
            .map_err(Error::Flashing)?;
        if packet.len() != 16 {
            return Err(Error::UnexpectedPacket { operation, packet });
        }

        let expected = Md5::digest(data);
        if packet != expected.to_vec() {
            return Err(Error::DigestMismatch {
                expected: expected.to_vec(),
                received: packet,
            });
        }

        Ok(())
    }

    /// Read the single status byte terminating a stub operation
    fn read_status(&mut self, operation: &'static str) -> Result<(), Error> {
        let packet = self
            .flasher
            .connection()
            .read_packet()
            .map_err(Error::Flashing)?;
        match packet.as_slice() {
            [0] => Ok(()),
            [status] => Err(Error::StubStatus {
                operation,
                status: *status,
            }),
            _ => Err(Error::UnexpectedPacket { operation, packet }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_stub_decodes() {
        let stub = FlashStub::get();
        assert_eq!(stub.num_params, 1);
        assert_ne!(stub.entry(), 0);
        assert!(!stub.code().is_empty());
        assert!(stub.data().is_some());
        assert_ne!(stub.params_start, 0);
        assert_ne!(stub.data_start, 0);
    }
}
