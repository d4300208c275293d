//! Firmware image formats understood by the bootloaders
//!
//! Three on-disk layouts share the same bones: an 8 byte header, a list of
//! `(address, length, data)` segment records and an XOR-fold checksum in
//! the last byte of the 16-byte-aligned file. They differ in magic bytes,
//! in how flash-mapped code is represented and, for the newer chips, in a
//! reserved header region and flash-mapping alignment rules.
//!
//! Callers hand segments in as `(address, bytes)` pairs; ELF extraction is
//! someone else's job.

use std::{
    fs,
    io::{Cursor, Read},
    path::Path,
};

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::warn;

use crate::{error::ImageError, targets::Chip};

pub mod esp32;
pub mod esp8266;
pub mod ota;

pub use esp32::Esp32Image;
pub use esp8266::Esp8266Image;
pub use ota::OtaImage;

/// First byte of a directly bootable image
pub const ESP_MAGIC: u8 = 0xe9;
/// First byte of a "v2" image handled by a software bootloader
pub const V2_MAGIC: u8 = 0xea;
/// The v2 header's segment-count slot holds this constant instead of a
/// real count
pub(crate) const V2_SEGMENT_COUNT: u8 = 4;

pub(crate) const ESP_CHECKSUM_MAGIC: u8 = 0xef;
pub(crate) const MAX_SEGMENT_COUNT: u8 = 16;
pub(crate) const SEG_HEADER_LEN: usize = 8;

/// XOR-fold `data` into the running image checksum
pub(crate) fn update_checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= byte;
    }

    checksum
}

/// Common 8 byte header at the start of every image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub flash_mode: u8,
    /// Packed flash size and frequency codes
    pub flash_config: u8,
    pub entry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct SegmentHeader {
    addr: u32,
    length: u32,
}

/// A contiguous blob of image data and the address it loads at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    data: Vec<u8>,
    /// Where in the image file this segment's header started, when loaded
    /// from a file
    pub file_offset: Option<u32>,
}

impl Segment {
    /// Create a segment, padding the data out to a 4 byte multiple
    pub fn new(addr: u32, mut data: Vec<u8>) -> Self {
        let pad = data.len() % 4;
        if pad != 0 {
            data.resize(data.len() + 4 - pad, 0);
        }

        Segment {
            addr,
            data,
            file_offset: None,
        }
    }

    /// The same data mapped at a different address
    pub fn with_new_address(&self, addr: u32) -> Segment {
        Segment {
            addr,
            data: self.data.clone(),
            file_offset: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Any of the supported image layouts
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FirmwareImage {
    Esp8266(Esp8266Image),
    Ota(OtaImage),
    Esp32(Esp32Image),
}

impl FirmwareImage {
    /// Parse an image for the given chip, picking the v1/v2 layout by magic
    /// byte on the older families
    pub fn load(chip: Chip, bytes: &[u8]) -> Result<FirmwareImage, ImageError> {
        if chip == Chip::Esp32 {
            return Ok(FirmwareImage::Esp32(Esp32Image::load(bytes)?));
        }

        match bytes.first() {
            Some(&ESP_MAGIC) => Ok(FirmwareImage::Esp8266(Esp8266Image::load(bytes)?)),
            Some(&V2_MAGIC) => Ok(FirmwareImage::Ota(OtaImage::load(bytes)?)),
            first => Err(ImageError::InvalidMagic {
                magic: first.copied().unwrap_or(0),
                segments: 0,
            }),
        }
    }

    pub fn load_from_file(chip: Chip, path: impl AsRef<Path>) -> Result<FirmwareImage, ImageError> {
        let bytes = fs::read(path)?;
        Self::load(chip, &bytes)
    }

    pub fn save(&self) -> Result<Vec<u8>, ImageError> {
        match self {
            FirmwareImage::Esp8266(image) => Ok(image.save()),
            FirmwareImage::Ota(image) => image.save(),
            FirmwareImage::Esp32(image) => image.save(),
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let bytes = self.save()?;
        fs::write(path, bytes)?;

        Ok(())
    }

    pub fn entry(&self) -> u32 {
        match self {
            FirmwareImage::Esp8266(image) => image.entry,
            FirmwareImage::Ota(image) => image.entry,
            FirmwareImage::Esp32(image) => image.entry,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        match self {
            FirmwareImage::Esp8266(image) => &image.segments,
            FirmwareImage::Ota(image) => &image.segments,
            FirmwareImage::Esp32(image) => &image.segments,
        }
    }
}

/// Read and validate the common 8 byte header
pub(crate) fn load_common_header(
    cursor: &mut Cursor<&[u8]>,
    expected_magic: u8,
) -> Result<ImageHeader, ImageError> {
    let mut raw = [0u8; 8];
    cursor.read_exact(&mut raw)?;
    let header: ImageHeader = pod_read_unaligned(&raw);

    if header.magic != expected_magic || header.segment_count > MAX_SEGMENT_COUNT {
        return Err(ImageError::InvalidMagic {
            magic: header.magic,
            segments: header.segment_count,
        });
    }

    Ok(header)
}

/// Read the next segment record
pub(crate) fn load_segment(
    cursor: &mut Cursor<&[u8]>,
    is_irom_segment: bool,
) -> Result<Segment, ImageError> {
    let file_offset = cursor.position() as u32;

    let mut raw = [0u8; 8];
    cursor.read_exact(&mut raw)?;
    let header: SegmentHeader = pod_read_unaligned(&raw);

    if !is_irom_segment {
        // ROMs are permissive about odd segments, so are we
        let sane_addr = (0x3ffe_0000..=0x4020_0000).contains(&header.addr);
        if !sane_addr && header.length > 65536 {
            warn!(
                "Suspicious segment {:#x}, length {}",
                header.addr, header.length
            );
        }
    }

    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if remaining < header.length as usize {
        return Err(ImageError::TruncatedSegment {
            addr: header.addr,
            expected: header.length as usize,
            actual: remaining,
        });
    }

    let mut data = vec![0; header.length as usize];
    cursor.read_exact(&mut data)?;

    let mut segment = Segment::new(header.addr, data);
    segment.file_offset = Some(file_offset);

    Ok(segment)
}

/// Append a segment record, returning the updated running checksum
pub(crate) fn save_segment(out: &mut Vec<u8>, segment: &Segment, checksum: u8) -> u8 {
    let header = SegmentHeader {
        addr: segment.addr,
        length: segment.size(),
    };
    out.extend_from_slice(bytes_of(&header));
    out.extend_from_slice(segment.data());

    update_checksum(segment.data(), checksum)
}

/// Read the checksum byte stored in the last byte of the 16-byte-aligned
/// file
pub(crate) fn read_checksum(cursor: &mut Cursor<&[u8]>) -> Result<u8, ImageError> {
    let align = 15 - (cursor.position() % 16);
    cursor.set_position(cursor.position() + align);

    let mut checksum = [0u8; 1];
    cursor.read_exact(&mut checksum)?;

    Ok(checksum[0])
}

/// Pad the file to a 16 byte multiple, checksum in the final byte
pub(crate) fn append_checksum(out: &mut Vec<u8>, checksum: u8) {
    let align = 15 - (out.len() % 16);
    out.resize(out.len() + align, 0);
    out.push(checksum);
}
