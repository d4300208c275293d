//! "Version 1" image, segments loaded directly by the ROM bootloader

use std::io::Cursor;

use crate::{
    error::ImageError,
    image_format::{
        append_checksum, load_common_header, load_segment, read_checksum, save_segment,
        update_checksum, ImageHeader, Segment, ESP_CHECKSUM_MAGIC, ESP_MAGIC,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp8266Image {
    pub flash_mode: u8,
    pub flash_config: u8,
    pub entry: u32,
    pub segments: Vec<Segment>,
    pub checksum: u8,
}

impl Esp8266Image {
    pub fn new(entry: u32, segments: Vec<Segment>) -> Self {
        let checksum = segments
            .iter()
            .fold(ESP_CHECKSUM_MAGIC, |sum, segment| {
                update_checksum(segment.data(), sum)
            });

        Esp8266Image {
            flash_mode: 0,
            flash_config: 0,
            entry,
            segments,
            checksum,
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = Cursor::new(bytes);
        let header = load_common_header(&mut cursor, ESP_MAGIC)?;

        let mut segments = Vec::with_capacity(header.segment_count as usize);
        for _ in 0..header.segment_count {
            segments.push(load_segment(&mut cursor, false)?);
        }

        let checksum = read_checksum(&mut cursor)?;
        let computed = segments
            .iter()
            .fold(ESP_CHECKSUM_MAGIC, |sum, segment| {
                update_checksum(segment.data(), sum)
            });
        if computed != checksum {
            return Err(ImageError::ChecksumMismatch {
                expected: computed,
                actual: checksum,
            });
        }

        Ok(Esp8266Image {
            flash_mode: header.flash_mode,
            flash_config: header.flash_config,
            entry: header.entry,
            segments,
            checksum,
        })
    }

    pub fn save(&self) -> Vec<u8> {
        let header = ImageHeader {
            magic: ESP_MAGIC,
            segment_count: self.segments.len() as u8,
            flash_mode: self.flash_mode,
            flash_config: self.flash_config,
            entry: self.entry,
        };

        let mut out = Vec::new();
        out.extend_from_slice(bytemuck::bytes_of(&header));

        let mut checksum = ESP_CHECKSUM_MAGIC;
        for segment in &self.segments {
            checksum = save_segment(&mut out, segment, checksum);
        }
        append_checksum(&mut out, checksum);

        out
    }
}
