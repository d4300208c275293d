//! Commands understood by the bootloader
//!
//! Every request is an 8 byte header followed by a command specific body.
//! The header carries the direction (always 0 for requests), the opcode,
//! the body length and, for the block-data commands, a checksum over the
//! block payload.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

/// Initial value for the XOR-fold payload checksum
pub const CHECKSUM_INIT: u8 = 0xEF;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const FLASH_BEGIN_TIMEOUT: Duration = Duration::from_secs(20);

/// The sync payload: a recognizable preamble plus 32 `0x55` bytes the
/// auto-bauding UART locks onto.
pub const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

/// XOR-fold `data` into `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= byte;
    }

    checksum
}

/// Command opcodes
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
    SpiSetParams = 0x0b,
    SpiAttach = 0x0d,
    ChangeBaudrate = 0x0f,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
}

impl CommandType {
    /// How long to wait for the response to this command
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashBegin | CommandType::FlashDeflBegin => FLASH_BEGIN_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Response timeout scaled by the amount of flash the command touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout.as_millis() as f64 * mb) as u64),
            )
        }

        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => calc_timeout(FLASH_MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct BeginParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct BlockParams {
    size: u32,
    sequence: u32,
    dummy1: u32,
    dummy2: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct WriteRegParams {
    addr: u32,
    value: u32,
    mask: u32,
    delay_us: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct EntryParams {
    no_entry: u32,
    entry: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct SpiParams {
    id: u32,
    total_size: u32,
    block_size: u32,
    sector_size: u32,
    page_size: u32,
    status_mask: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct Md5Params {
    addr: u32,
    size: u32,
    reserved0: u32,
    reserved1: u32,
}

/// A single bootloader request with its payload
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    Sync,
    ReadReg {
        address: u32,
    },
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    ChangeBaudrate {
        new_baud: u32,
    },
    SpiSetParams {
        size: u32,
    },
    SpiAttach {
        hspi: u32,
        legacy: u8,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        addr: u32,
        size: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    /// Serialize the command, header and body, without SLIP framing
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match *self {
            Command::Sync => write_command(writer, self.command_type(), &SYNC_FRAME, 0),
            Command::ReadReg { address } => {
                write_command(writer, self.command_type(), &address.to_le_bytes(), 0)
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us: 0,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                let params = BeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => data_command(writer, self.command_type(), data, pad_to, pad_byte, sequence),
            Command::FlashEnd { reboot } => {
                let flag = u32::from(!reboot);
                write_command(writer, self.command_type(), &flag.to_le_bytes(), 0)
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                let params = BeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::MemData { data, sequence } => {
                data_command(writer, self.command_type(), data, 0, 0, sequence)
            }
            Command::MemEnd { entry } => {
                let params = EntryParams {
                    no_entry: u32::from(entry == 0),
                    entry,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::ChangeBaudrate { new_baud } => {
                let params = [new_baud, 0];
                write_command(writer, self.command_type(), bytemuck::cast_slice(&params), 0)
            }
            Command::SpiSetParams { size } => {
                let params = SpiParams {
                    id: 0,
                    total_size: size,
                    block_size: 64 * 1024,
                    sector_size: 4 * 1024,
                    page_size: 256,
                    status_mask: 0xFFFF,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::SpiAttach { hspi, legacy } => {
                // the last three bytes are reserved
                let mut body = [0u8; 8];
                body[..4].copy_from_slice(&hspi.to_le_bytes());
                body[4] = legacy;
                write_command(writer, self.command_type(), &body, 0)
            }
            Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                let params = BeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
            Command::FlashDeflData { data, sequence } => {
                data_command(writer, self.command_type(), data, 0, 0, sequence)
            }
            Command::FlashDeflEnd { reboot } => {
                let flag = u32::from(!reboot);
                write_command(writer, self.command_type(), &flag.to_le_bytes(), 0)
            }
            Command::FlashMd5 { addr, size } => {
                let params = Md5Params {
                    addr,
                    size,
                    reserved0: 0,
                    reserved1: 0,
                };
                write_command(writer, self.command_type(), bytes_of(&params), 0)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct CommandHeader {
    direction: u8,
    command: u8,
    size: u16,
    check: u32,
}

fn write_command<W: Write>(
    writer: &mut W,
    command: CommandType,
    body: &[u8],
    check: u32,
) -> std::io::Result<()> {
    let header = CommandHeader {
        direction: 0,
        command: command as u8,
        size: body.len() as u16,
        check,
    };
    writer.write_all(bytes_of(&header))?;
    writer.write_all(body)?;

    Ok(())
}

/// Write a block-transfer command: block params, then the data itself padded
/// up to `pad_to`, with the checksum over data and padding in the header
fn data_command<W: Write>(
    writer: &mut W,
    command: CommandType,
    data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    let padding = if pad_to > 0 {
        (pad_to - data.len() % pad_to) % pad_to
    } else {
        0
    };

    let mut check = checksum(data, CHECKSUM_INIT);
    for _ in 0..padding {
        check ^= pad_byte;
    }

    let params = BlockParams {
        size: (data.len() + padding) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let total = size_of::<BlockParams>() + data.len() + padding;
    let header = CommandHeader {
        direction: 0,
        command: command as u8,
        size: total as u16,
        check: check as u32,
    };

    writer.write_all(bytes_of(&header))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(data)?;
    for _ in 0..padding {
        writer.write_all(&[pad_byte])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sync_wire_format() {
        let mut encoded = Vec::new();
        Command::Sync.write(&mut encoded).unwrap();

        assert_eq!(&encoded[..8], &[0x00, 0x08, 36, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&encoded[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(encoded[12..].iter().all(|b| *b == 0x55));
        assert_eq!(encoded.len(), 8 + 36);
    }

    #[test]
    fn read_reg_wire_format() {
        let mut encoded = Vec::new();
        Command::ReadReg {
            address: 0x60000078,
        }
        .write(&mut encoded)
        .unwrap();

        assert_eq!(
            encoded,
            vec![0x00, 0x0a, 4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x78, 0x00, 0x00, 0x60]
        );
    }

    #[test]
    fn flash_data_pads_and_checksums() {
        let mut encoded = Vec::new();
        Command::FlashData {
            data: &[0x01, 0x02, 0x03],
            pad_to: 8,
            pad_byte: 0xFF,
            sequence: 2,
        }
        .write(&mut encoded)
        .unwrap();

        // 16 bytes of block params plus 8 bytes of padded data
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 24);

        // checksum covers data and pad bytes, seeded with 0xEF
        let expected = 0xEFu8 ^ 0x01 ^ 0x02 ^ 0x03 ^ 0xFF ^ 0xFF ^ 0xFF ^ 0xFF ^ 0xFF;
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]),
            expected as u32
        );

        // declared block size includes the padding
        assert_eq!(
            u32::from_le_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]),
            8
        );
        assert_eq!(&encoded[24..], &[0x01, 0x02, 0x03, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn already_aligned_data_gets_no_padding() {
        let mut encoded = Vec::new();
        Command::FlashData {
            data: &[0xAA; 16],
            pad_to: 16,
            pad_byte: 0xFF,
            sequence: 0,
        }
        .write(&mut encoded)
        .unwrap();

        assert_eq!(encoded.len(), 8 + 16 + 16);
    }

    #[test]
    fn mem_end_entry_flag() {
        let mut encoded = Vec::new();
        Command::MemEnd { entry: 0x4010_0000 }.write(&mut encoded).unwrap();
        assert_eq!(&encoded[8..12], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&encoded[12..16], &0x4010_0000u32.to_le_bytes());

        let mut encoded = Vec::new();
        Command::MemEnd { entry: 0 }.write(&mut encoded).unwrap();
        assert_eq!(&encoded[8..12], &[0x01, 0x00, 0x00, 0x00]);
    }
}
