//! Supported chip families and their protocol constants
//!
//! The bootloader protocol is the same on every family; what differs is a
//! table of constants (status-byte width, block sizes, register addresses,
//! flash-size encodings) plus a couple of genuinely divergent behaviors
//! like the erase-size formula and MAC derivation. The constants live in a
//! per-family [ChipProfile], the behaviors are matched on [Chip].

use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use crate::error::Error;

/// UART peripheral datecode register, mapped at the same address on every
/// supported family, read once to identify the chip
pub const CHIP_DETECT_REG: u32 = 0x6000_0078;

/// SPI peripheral command bit that triggers a "read id" flash transaction
pub const SPI_CMD_READ_ID: u32 = 0x1000_0000;

// ESP8266 OTP words holding the MAC address and chip id
pub(crate) const ESP8266_OTP_MAC0: u32 = 0x3ff0_0050;
pub(crate) const ESP8266_OTP_MAC1: u32 = 0x3ff0_0054;
pub(crate) const ESP8266_OTP_MAC3: u32 = 0x3ff0_005c;

/// Protocol constants fixed once the chip family is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    pub name: &'static str,
    /// Expected value of [CHIP_DETECT_REG] on this family
    pub date_reg_value: u32,
    /// Trailing bytes of each response that carry the command status
    pub status_bytes_len: usize,
    /// Block size for RAM downloads
    pub ram_block_size: u32,
    /// Block size for flash downloads
    pub flash_block_size: u32,
    /// Smallest erasable flash unit
    pub flash_sector_size: u32,
    /// Flash size names and their image-header encoding
    pub flash_sizes: &'static [(&'static str, u8)],
    /// Address window through which flash is mapped for code
    pub irom_map: (u32, u32),
    /// Data mapping window, on families that have one
    pub drom_map: Option<(u32, u32)>,
    pub spi_cmd_reg: u32,
    pub spi_w0_reg: u32,
    /// Base address of the eFuse block, on families that have one
    pub efuse_base: Option<u32>,
}

const ESP8266_FLASH_SIZES: &[(&str, u8)] = &[
    ("512KB", 0x00),
    ("256KB", 0x10),
    ("1MB", 0x20),
    ("2MB", 0x30),
    ("4MB", 0x40),
    ("2MB-c1", 0x50),
    ("4MB-c1", 0x60),
    ("4MB-c2", 0x70),
];

const ESP3X_FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
];

const ESP8266_PROFILE: ChipProfile = ChipProfile {
    name: "ESP8266",
    date_reg_value: 0x0006_2000,
    status_bytes_len: 2,
    ram_block_size: 0x1800,
    flash_block_size: 0x400,
    flash_sector_size: 0x1000,
    flash_sizes: ESP8266_FLASH_SIZES,
    irom_map: (0x4020_0000, 0x4030_0000),
    drom_map: None,
    spi_cmd_reg: 0x6000_0200,
    spi_w0_reg: 0x6000_0240,
    efuse_base: None,
};

const ESP31_PROFILE: ChipProfile = ChipProfile {
    name: "ESP31",
    date_reg_value: 0x1505_2100,
    status_bytes_len: 2,
    ram_block_size: 0x1800,
    flash_block_size: 0x400,
    flash_sector_size: 0x1000,
    flash_sizes: ESP3X_FLASH_SIZES,
    irom_map: (0x4020_0000, 0x4030_0000),
    drom_map: None,
    spi_cmd_reg: 0x6000_3000,
    spi_w0_reg: 0x6000_3040,
    efuse_base: Some(0x6001_a000),
};

const ESP32_PROFILE: ChipProfile = ChipProfile {
    name: "ESP32",
    date_reg_value: 0x1512_2500,
    status_bytes_len: 4,
    ram_block_size: 0x1800,
    flash_block_size: 0x400,
    flash_sector_size: 0x1000,
    flash_sizes: ESP3X_FLASH_SIZES,
    irom_map: (0x400d_0000, 0x4040_0000),
    drom_map: Some((0x3f40_0000, 0x3f70_0000)),
    spi_cmd_reg: 0x6000_3000,
    spi_w0_reg: 0x6000_3040,
    efuse_base: Some(0x6001_a000),
};

/// All chip families this library can program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, VariantNames)]
#[non_exhaustive]
pub enum Chip {
    #[strum(serialize = "ESP8266")]
    Esp8266,
    #[strum(serialize = "ESP31")]
    Esp31,
    #[strum(serialize = "ESP32")]
    Esp32,
}

impl Chip {
    /// Identify the chip family from the UART datecode register value
    pub fn from_date_reg(value: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.profile().date_reg_value == value)
            .ok_or(Error::ChipDetectError(value))
    }

    pub fn profile(&self) -> &'static ChipProfile {
        match self {
            Chip::Esp8266 => &ESP8266_PROFILE,
            Chip::Esp31 => &ESP31_PROFILE,
            Chip::Esp32 => &ESP32_PROFILE,
        }
    }

    /// Number of bytes the begin command should ask the loader to erase
    /// when writing `size` bytes at `offset`
    ///
    /// The ESP8266 ROM erase engine over-erases: it treats the region as a
    /// leading run of sectors up to the next 16-sector block boundary plus
    /// full blocks after it, so the requested erase size has to be shrunk
    /// asymmetrically to compensate. The formula is a known workaround and
    /// must stay exactly as the ROM expects it.
    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        match self {
            Chip::Esp8266 => {
                let sector_size = self.profile().flash_sector_size;
                let sectors_per_block = 16;

                let num_sectors = size.div_ceil(sector_size);
                let start_sector = offset / sector_size;

                let mut head_sectors = sectors_per_block - (start_sector % sectors_per_block);
                if num_sectors < head_sectors {
                    head_sectors = num_sectors;
                }

                if num_sectors < 2 * head_sectors {
                    (num_sectors + 1) / 2 * sector_size
                } else {
                    (num_sectors - head_sectors) * sector_size
                }
            }
            Chip::Esp31 | Chip::Esp32 => size,
        }
    }

    /// Look up the image-header encoding of a named flash size
    pub fn flash_size_code(&self, size: &str) -> Result<u8, Error> {
        self.profile()
            .flash_sizes
            .iter()
            .find(|(name, _)| *name == size)
            .map(|(_, code)| *code)
            .ok_or_else(|| Error::InvalidFlashSize(size.into()))
    }

    /// Whether flashing goes through the uploaded stub or the raw ROM
    /// protocol on this family
    pub fn uses_stub(&self) -> bool {
        !matches!(self, Chip::Esp32)
    }
}

/// Derive the ESP8266 MAC address from its OTP words
///
/// Old chips store no OUI; it is inferred from a revision marker in the
/// second word.
pub(crate) fn mac_from_otp(mac0: u32, mac1: u32, mac3: u32) -> Result<[u8; 6], Error> {
    let oui: [u8; 3] = if mac3 != 0 {
        [(mac3 >> 16) as u8, (mac3 >> 8) as u8, mac3 as u8]
    } else if (mac1 >> 16) & 0xff == 0 {
        [0x18, 0xfe, 0x34]
    } else if (mac1 >> 16) & 0xff == 1 {
        [0xac, 0xd0, 0x74]
    } else {
        return Err(Error::UnknownOui);
    };

    Ok([
        oui[0],
        oui[1],
        oui[2],
        (mac1 >> 8) as u8,
        mac1 as u8,
        (mac0 >> 24) as u8,
    ])
}

/// Derive a MAC address from a pair of eFuse words on the ESP31/ESP32
pub(crate) fn mac_from_efuse(low_word: u32, high_word: u32) -> [u8; 6] {
    [
        (high_word >> 16) as u8,
        (high_word >> 8) as u8,
        high_word as u8,
        (low_word >> 24) as u8,
        (low_word >> 16) as u8,
        (low_word >> 8) as u8,
    ]
}

pub(crate) fn chip_id_from_otp(id0: u32, id1: u32) -> u64 {
    u64::from((id0 >> 24) | ((id1 & 0x00ff_ffff) << 8))
}

pub(crate) fn chip_id_from_efuse(word16: u32, word17: u32) -> u64 {
    (u64::from(word17 & 0x00ff_ffff) << 24) | u64::from((word16 >> 8) & 0x00ff_ffff)
}
