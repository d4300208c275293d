//! High level flashing engine
//!
//! [Flasher] wraps a connected bootloader: it detects the chip family,
//! exposes the raw ROM protocol operations (register access, RAM and flash
//! downloads) and, on the newer families, the compressed download path.
//! On families with a flasher stub, whole-flash operations go through
//! [StubFlasher] instead, which uploads the stub and speaks its faster,
//! digest-verified protocol.

use std::{thread::sleep, time::Duration};

use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use strum::{Display, EnumString, VariantNames};

use crate::{
    connection::{
        command::{Command, CommandType},
        CommandResult, Connection,
    },
    error::{Error, ResultExt, RomError},
    image_format::{FirmwareImage, ESP_MAGIC},
    interface::SerialInterface,
    targets::{
        self, Chip, ChipProfile, CHIP_DETECT_REG, ESP8266_OTP_MAC0, ESP8266_OTP_MAC1,
        ESP8266_OTP_MAC3, SPI_CMD_READ_ID,
    },
};

pub mod stub;

pub use stub::{FlashStub, StubFlasher};

/// Baud rate the ROM loaders sync at
pub const DEFAULT_BAUD: u32 = 115_200;

/// Ambient serial timeout once connected
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Flash sizes ≥ 2MB need the loader's flash parameters reconfigured
const SPI_PARAM_SET_THRESHOLD: u32 = 2 * 1024 * 1024;

/// SPI interface mode the flash chip is strapped for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    #[default]
    Dio = 2,
    Dout = 3,
}

/// SPI clock frequency for the flash chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, VariantNames)]
#[non_exhaustive]
pub enum FlashFrequency {
    #[strum(serialize = "20m")]
    Flash20M,
    #[strum(serialize = "26m")]
    Flash26M,
    #[default]
    #[strum(serialize = "40m")]
    Flash40M,
    #[strum(serialize = "80m")]
    Flash80M,
}

impl FlashFrequency {
    fn code(self) -> u8 {
        match self {
            FlashFrequency::Flash40M => 0x0,
            FlashFrequency::Flash26M => 0x1,
            FlashFrequency::Flash20M => 0x2,
            FlashFrequency::Flash80M => 0xf,
        }
    }
}

/// Flash geometry an image header gets patched with when flashing to
/// address 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashParams {
    mode: FlashMode,
    size_code: u8,
    frequency: FlashFrequency,
}

impl FlashParams {
    /// The `(mode, size | freq)` byte pair at offset 2 of an image header
    pub fn encode(&self) -> (u8, u8) {
        (self.mode as u8, self.size_code + self.frequency.code())
    }

    pub fn mode(&self) -> FlashMode {
        self.mode
    }
}

/// Patch the flash geometry bytes into an image that starts with a
/// bootable header, leaving anything else untouched
pub(crate) fn update_image_flash_params(addr: u32, image: &mut [u8], params: FlashParams) {
    if addr == 0 && image.first() == Some(&ESP_MAGIC) && image.len() >= 4 {
        let (mode, size_freq) = params.encode();
        debug!("Flash params set to {:#04x}{:02x}", mode, size_freq);
        image[2] = mode;
        image[3] = size_freq;
    }
}

/// A detected chip with an active bootloader connection
pub struct Flasher {
    connection: Connection,
    chip: Chip,
    stub_active: bool,
}

impl Flasher {
    /// Reset the chip into its bootloader, sync, and identify the family
    pub fn connect(serial: impl SerialInterface + 'static) -> Result<Flasher, Error> {
        let mut connection = Connection::new(serial);
        connection.begin()?;
        connection.set_timeout(DEFAULT_TIMEOUT)?;

        let value = connection.read_reg(CHIP_DETECT_REG)?;
        let chip = Chip::from_date_reg(value)?;
        info!("Detected chip type: {}", chip);

        Ok(Flasher {
            connection,
            chip,
            stub_active: false,
        })
    }

    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn profile(&self) -> &'static ChipProfile {
        self.chip.profile()
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }

    /// Build the flash parameter pair for this chip from user-facing names
    pub fn flash_params(
        &self,
        mode: FlashMode,
        size: &str,
        frequency: FlashFrequency,
    ) -> Result<FlashParams, Error> {
        Ok(FlashParams {
            mode,
            size_code: self.chip.flash_size_code(size)?,
            frequency,
        })
    }

    /// Run a command and check its trailing status bytes
    fn check_command(
        &mut self,
        operation: &'static str,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResult, Error> {
        let response = self.connection.command_with_timeout(command, timeout)?;

        let status_len = self.profile().status_bytes_len;
        if response.data.len() < status_len {
            return Err(RomError::new(operation, response.data).into());
        }

        let (payload, status) = response.data.split_at(response.data.len() - status_len);
        // only the first status byte signals failure, the second is a
        // reason code
        if status[0] != 0 {
            return Err(RomError::new(operation, status.to_vec()).into());
        }

        if payload.is_empty() {
            Ok(CommandResult::Value(response.value))
        } else {
            Ok(CommandResult::Bytes(payload.to_vec()))
        }
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        self.connection.read_reg(addr)
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.check_command(
            "write target memory",
            Command::WriteReg {
                address: addr,
                value,
                mask,
            },
            CommandType::WriteReg.timeout(),
        )?;

        Ok(())
    }

    pub(crate) fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        self.check_command(
            "enter RAM download mode",
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            },
            CommandType::MemBegin.timeout(),
        )?;

        Ok(())
    }

    pub(crate) fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.check_command(
            "write to target RAM",
            Command::MemData { data, sequence },
            CommandType::MemData.timeout(),
        )?;

        Ok(())
    }

    pub(crate) fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        self.check_command(
            "leave RAM download mode",
            Command::MemEnd { entry },
            CommandType::MemEnd.timeout(),
        )?;

        Ok(())
    }

    /// Enter flash download mode, erasing enough flash for `size` bytes at
    /// `offset`
    pub fn flash_begin(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        let block_size = self.profile().flash_block_size;
        let blocks = size.div_ceil(block_size);
        // the loader erases whole blocks
        let erase_size = self.chip.erase_size(offset, blocks * block_size);

        self.check_command(
            "enter Flash download mode",
            Command::FlashBegin {
                size: erase_size,
                blocks,
                block_size,
                offset,
            },
            CommandType::FlashBegin.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    pub fn flash_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        let block_size = self.profile().flash_block_size;
        self.check_command(
            "write to target Flash",
            Command::FlashData {
                data,
                pad_to: block_size as usize,
                pad_byte: 0xFF,
                sequence,
            },
            CommandType::FlashData.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.check_command(
            "leave Flash download mode",
            Command::FlashEnd { reboot },
            CommandType::FlashEnd.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    /// Run the application already in flash
    pub fn run(&mut self, reboot: bool) -> Result<(), Error> {
        // a zero length flash session, begin immediately followed by end
        self.flash_begin(0, 0)?;
        self.flash_finish(reboot)
    }

    /// Read the SPI flash manufacturer and device id
    pub fn flash_id(&mut self) -> Result<u32, Error> {
        let profile = self.profile();
        let (spi_w0, spi_cmd) = (profile.spi_w0_reg, profile.spi_cmd_reg);

        self.flash_begin(0, 0)?;
        self.write_reg(spi_w0, 0x0, None)?;
        self.write_reg(spi_cmd, SPI_CMD_READ_ID, None)?;
        let flash_id = self.read_reg(spi_w0)?;
        self.flash_finish(false)?;

        Ok(flash_id)
    }

    /// Leave flash in write mode after a DIO flash session
    ///
    /// A plain flash-end would write protect the chip again, so instead the
    /// loader is pointed back at its own entrypoint through a RAM download.
    pub fn flash_unlock_dio(&mut self) -> Result<(), Error> {
        self.flash_begin(0, 0)?;
        self.mem_begin(0, 0, 0, 0x4010_0000)?;
        self.mem_finish(0x4000_0080)
    }

    /// Read the chip's factory MAC address
    pub fn read_mac(&mut self) -> Result<[u8; 6], Error> {
        match self.chip {
            Chip::Esp8266 => {
                let mac0 = self.read_reg(ESP8266_OTP_MAC0)?;
                let mac1 = self.read_reg(ESP8266_OTP_MAC1)?;
                let mac3 = self.read_reg(ESP8266_OTP_MAC3)?;
                targets::mac_from_otp(mac0, mac1, mac3)
            }
            Chip::Esp31 | Chip::Esp32 => {
                let word16 = self.read_efuse(16)?;
                let word17 = self.read_efuse(17)?;
                Ok(targets::mac_from_efuse(word16, word17))
            }
        }
    }

    /// Read the chip's unique id
    pub fn chip_id(&mut self) -> Result<u64, Error> {
        match self.chip {
            Chip::Esp8266 => {
                let id0 = self.read_reg(ESP8266_OTP_MAC0)?;
                let id1 = self.read_reg(ESP8266_OTP_MAC1)?;
                Ok(targets::chip_id_from_otp(id0, id1))
            }
            Chip::Esp31 | Chip::Esp32 => {
                let word16 = self.read_efuse(16)?;
                let word17 = self.read_efuse(17)?;
                Ok(targets::chip_id_from_efuse(word16, word17))
            }
        }
    }

    /// Read the nth word of the eFuse region
    fn read_efuse(&mut self, n: u32) -> Result<u32, Error> {
        let base = self
            .profile()
            .efuse_base
            .ok_or(Error::UnsupportedFeature {
                chip: self.chip,
                feature: "eFuse reads",
            })?;
        self.read_reg(base + 4 * n)
    }

    /// Ask the loader to switch baud rate, then follow it
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Changing baud rate to {}", baud);
        self.connection
            .command(Command::ChangeBaudrate { new_baud: baud })?;
        // bytes sent during the switch arrive garbled at either rate
        sleep(Duration::from_millis(50));
        self.connection.set_baud(baud)?;

        Ok(())
    }

    /// Configure which SPI pins the flash is attached to
    pub fn spi_attach(&mut self, hspi: u32, legacy: u8) -> Result<(), Error> {
        self.check_command(
            "configure SPI Flash attachment",
            Command::SpiAttach { hspi, legacy },
            CommandType::SpiAttach.timeout(),
        )?;

        Ok(())
    }

    /// Tell the loader about a flash chip larger than its default
    /// assumption
    pub fn spi_set_params(&mut self, total_size: u32) -> Result<(), Error> {
        self.check_command(
            "configure flash parameters",
            Command::SpiSetParams { size: total_size },
            CommandType::SpiSetParams.timeout(),
        )?;

        Ok(())
    }

    /// Enter compressed flash download mode
    pub fn flash_defl_begin(
        &mut self,
        size: u32,
        compressed_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        let block_size = self.profile().flash_block_size;
        let blocks = compressed_size.div_ceil(block_size);
        let erase_blocks = size.div_ceil(block_size);

        if size > 0 && offset + size >= SPI_PARAM_SET_THRESHOLD {
            // the loader assumes a small flash by default and would wrap
            self.spi_set_params(16 * 1024 * 1024)?;
        }

        debug!(
            "Compressed download: {} bytes uncompressed, {} compressed, {} blocks",
            size, compressed_size, blocks
        );
        self.check_command(
            "enter compressed flash mode",
            Command::FlashDeflBegin {
                size: erase_blocks * block_size,
                blocks,
                block_size,
                offset,
            },
            CommandType::FlashDeflBegin.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    pub fn flash_defl_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.check_command(
            "write compressed data to flash",
            Command::FlashDeflData { data, sequence },
            CommandType::FlashDeflData.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.check_command(
            "leave compressed flash mode",
            Command::FlashDeflEnd { reboot },
            CommandType::FlashDeflEnd.timeout(),
        )
        .flashing()?;

        Ok(())
    }

    /// Ask the loader for the MD5 digest of a flash region
    pub fn flash_md5sum(&mut self, addr: u32, size: u32) -> Result<[u8; 16], Error> {
        let result = self.check_command(
            "calculate md5sum",
            Command::FlashMd5 { addr, size },
            CommandType::FlashMd5.timeout_for_size(size),
        )?;

        // the loader answers with 32 ascii hex characters
        let bytes = result.bytes();
        parse_hex_digest(bytes).ok_or_else(|| Error::UnexpectedPacket {
            operation: "calculate md5sum",
            packet: bytes.to_vec(),
        })
    }

    /// Upload an image to RAM and jump to its entrypoint
    pub fn load_ram(&mut self, image: &FirmwareImage) -> Result<(), Error> {
        let ram_block = self.profile().ram_block_size;

        for segment in image.segments() {
            debug!(
                "Downloading {} bytes at {:#010x}",
                segment.size(),
                segment.addr
            );
            let blocks = segment.size().div_ceil(ram_block);
            self.mem_begin(segment.size(), blocks, ram_block, segment.addr)?;

            for (sequence, chunk) in segment.data().chunks(ram_block as usize).enumerate() {
                self.mem_block(chunk, sequence as u32)?;
            }
        }

        debug!("All segments done, executing at {:#010x}", image.entry());
        self.mem_finish(image.entry())
    }

    /// Write `data` to flash at `addr`, choosing the strategy for the
    /// detected chip
    ///
    /// On families with a stub the data goes through the stub's streaming
    /// protocol; the ESP32 is written with the ROM loader's (optionally
    /// compressed) protocol instead. Either path verifies the written
    /// bytes with an MD5 digest.
    pub fn write_flash(
        &mut self,
        addr: u32,
        data: &[u8],
        params: Option<FlashParams>,
        compress: bool,
    ) -> Result<(), Error> {
        let sector_size = self.profile().flash_sector_size;

        let mut image = data.to_vec();
        if let Some(params) = params {
            update_image_flash_params(addr, &mut image, params);
        }

        if self.chip.uses_stub() {
            // the stub only writes whole sectors
            let partial = image.len() % sector_size as usize;
            if partial != 0 {
                image.resize(image.len() + sector_size as usize - partial, 0xFF);
            }

            let mut stub = StubFlasher::start(self, None)?;
            stub.flash_write(addr, &image)?;
            stub.boot_fw()?;

            Ok(())
        } else {
            self.write_flash_rom(addr, &image, compress)?;

            match params.map(|p| p.mode()) {
                Some(FlashMode::Dio) => self.flash_unlock_dio(),
                _ => {
                    self.flash_begin(0, 0)?;
                    if compress {
                        self.flash_defl_finish(false)
                    } else {
                        self.flash_finish(false)
                    }
                }
            }
        }
    }

    fn write_flash_rom(&mut self, addr: u32, image: &[u8], compress: bool) -> Result<(), Error> {
        let block_size = self.profile().flash_block_size as usize;

        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            std::io::Write::write_all(&mut encoder, image)
                .map_err(|err| Error::Flashing(err.into()))?;
            let compressed = encoder
                .finish()
                .map_err(|err| Error::Flashing(err.into()))?;
            self.flash_defl_begin(image.len() as u32, compressed.len() as u32, addr)?;
            compressed
        } else {
            self.flash_begin(addr, image.len() as u32)?;
            image.to_vec()
        };

        for (sequence, block) in payload.chunks(block_size).enumerate() {
            debug!(
                "Writing at {:#010x}",
                addr + sequence as u32 * block_size as u32
            );
            if compress {
                self.flash_defl_block(block, sequence as u32)?;
            } else {
                self.flash_block(block, sequence as u32)?;
            }
        }

        let digest = self.flash_md5sum(addr, image.len() as u32)?;
        let expected = Md5::digest(image);
        if digest != *expected {
            return Err(Error::DigestMismatch {
                expected: expected.to_vec(),
                received: digest.to_vec(),
            });
        }
        debug!("Hash of flashed data verified");

        Ok(())
    }

    /// Verify a flash region against `data` without a full read-back
    pub fn verify_flash(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        if self.chip.uses_stub() {
            let mut stub = StubFlasher::start(self, None)?;
            stub.verify(addr, data)
        } else {
            let digest = self.flash_md5sum(addr, data.len() as u32)?;
            let expected = Md5::digest(data);
            if digest != *expected {
                return Err(Error::DigestMismatch {
                    expected: expected.to_vec(),
                    received: digest.to_vec(),
                });
            }

            Ok(())
        }
    }

    /// Reset the chip and boot whatever is in flash
    pub fn reset_after_flash(&mut self) -> Result<(), Error> {
        self.connection.reset_after_flash()?;
        Ok(())
    }

    pub(crate) fn stub_active(&self) -> bool {
        self.stub_active
    }

    pub(crate) fn set_stub_active(&mut self) {
        if self.stub_active {
            warn!("Flasher stub is already running");
        }
        self.stub_active = true;
    }
}

fn parse_hex_digest(ascii: &[u8]) -> Option<[u8; 16]> {
    if ascii.len() != 32 {
        return None;
    }

    let mut digest = [0u8; 16];
    for (i, pair) in ascii.chunks_exact(2).enumerate() {
        let text = std::str::from_utf8(pair).ok()?;
        digest[i] = u8::from_str_radix(text, 16).ok()?;
    }

    Some(digest)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flash_params_encoding() {
        let params = FlashParams {
            mode: FlashMode::Dio,
            size_code: 0x40,
            frequency: FlashFrequency::Flash80M,
        };
        assert_eq!(params.encode(), (2, 0x4f));
    }

    #[test]
    fn image_header_patching() {
        let params = FlashParams {
            mode: FlashMode::Qio,
            size_code: 0x20,
            frequency: FlashFrequency::Flash40M,
        };

        let mut image = vec![ESP_MAGIC, 0x03, 0xAA, 0xBB, 0x01, 0x02];
        update_image_flash_params(0, &mut image, params);
        assert_eq!(image, vec![ESP_MAGIC, 0x03, 0x00, 0x20, 0x01, 0x02]);

        // only applies at address 0
        let mut image = vec![ESP_MAGIC, 0x03, 0xAA, 0xBB];
        update_image_flash_params(0x1000, &mut image, params);
        assert_eq!(image[2], 0xAA);

        // and only to bootable images
        let mut image = vec![0x00, 0x03, 0xAA, 0xBB];
        update_image_flash_params(0, &mut image, params);
        assert_eq!(image[2], 0xAA);
    }

    #[test]
    fn flash_mode_names() {
        assert_eq!("dio".parse::<FlashMode>().unwrap(), FlashMode::Dio);
        assert_eq!("80m".parse::<FlashFrequency>().unwrap(), FlashFrequency::Flash80M);
        assert!("160m".parse::<FlashFrequency>().is_err());
    }

    #[test]
    fn hex_digest_parsing() {
        let ascii = b"d41d8cd98f00b204e9800998ecf8427e";
        let digest = parse_hex_digest(ascii).unwrap();
        assert_eq!(digest[0], 0xd4);
        assert_eq!(digest[15], 0x7e);

        assert!(parse_hex_digest(b"xyz").is_none());
        assert!(parse_hex_digest(&[0xFF; 32]).is_none());
    }
}
