//! "Version 2" OTA image, loaded by a software bootloader
//!
//! The flash-mapped blob comes first so the bootloader can map it in place:
//! a v2 header, then the irom segment stored with load address 0, then a
//! second, v1-style header describing the directly loaded segments. The
//! irom segment's real address is its position in the file plus the start
//! of the mapping window.

use std::io::Cursor;

use log::warn;

use crate::{
    error::ImageError,
    image_format::{
        append_checksum, load_common_header, load_segment, read_checksum, save_segment,
        update_checksum, ImageHeader, Segment, ESP_CHECKSUM_MAGIC, ESP_MAGIC, V2_MAGIC,
        V2_SEGMENT_COUNT,
    },
};

const IROM_MAP_START: u32 = 0x4020_0000;
const IROM_MAP_END: u32 = 0x4030_0000;

fn is_irom_addr(addr: u32) -> bool {
    (IROM_MAP_START..IROM_MAP_END).contains(&addr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaImage {
    pub flash_mode: u8,
    pub flash_config: u8,
    pub entry: u32,
    /// All segments, including the re-addressed irom segment
    pub segments: Vec<Segment>,
    pub checksum: u8,
}

impl OtaImage {
    pub fn new(entry: u32, segments: Vec<Segment>) -> Self {
        let checksum = segments
            .iter()
            .filter(|segment| !is_irom_addr(segment.addr))
            .fold(ESP_CHECKSUM_MAGIC, |sum, segment| {
                update_checksum(segment.data(), sum)
            });

        OtaImage {
            flash_mode: 0,
            flash_config: 0,
            entry,
            segments,
            checksum,
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = Cursor::new(bytes);

        let first = load_common_header(&mut cursor, V2_MAGIC)?;
        if first.segment_count != V2_SEGMENT_COUNT {
            // not a real segment count in this header, but it is expected
            // to hold a constant
            warn!(
                "V2 header has unexpected \"segment\" count {} (usually {})",
                first.segment_count, V2_SEGMENT_COUNT
            );
        }

        // the irom blob is stored with load address 0; its real address is
        // where it sits in the file, offset into the mapping window
        let irom_offset = cursor.position() as u32;
        let irom_segment = load_segment(&mut cursor, true)?;
        let irom_segment = Segment {
            addr: irom_offset + IROM_MAP_START,
            ..irom_segment
        };

        let second = load_common_header(&mut cursor, ESP_MAGIC)?;
        if first.flash_mode != second.flash_mode {
            warn!(
                "Flash mode value in first header ({:#04x}) disagrees with second ({:#04x}). Using second value.",
                first.flash_mode, second.flash_mode
            );
        }
        if first.flash_config != second.flash_config {
            warn!(
                "Flash size/freq value in first header ({:#04x}) disagrees with second ({:#04x}). Using second value.",
                first.flash_config, second.flash_config
            );
        }
        if first.entry != second.entry {
            warn!(
                "Entrypoint address in first header ({:#010x}) disagrees with second header ({:#010x}). Using second value.",
                first.entry, second.entry
            );
        }

        let mut segments = vec![irom_segment];
        for _ in 0..second.segment_count {
            segments.push(load_segment(&mut cursor, false)?);
        }

        let checksum = read_checksum(&mut cursor)?;
        let computed = segments[1..]
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

        Ok(OtaImage {
            flash_mode: second.flash_mode,
            flash_config: second.flash_config,
            entry: second.entry,
            segments,
            checksum,
        })
    }

    fn irom_segment(&self) -> Result<Option<&Segment>, ImageError> {
        let irom: Vec<&Segment> = self
            .segments
            .iter()
            .filter(|segment| is_irom_addr(segment.addr))
            .collect();

        match irom.len() {
            0 => Ok(None),
            1 => Ok(Some(irom[0])),
            count => Err(ImageError::AmbiguousIromSegment(count)),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, ImageError> {
        let irom_segment = self.irom_segment()?;
        let normal_segments: Vec<&Segment> = self
            .segments
            .iter()
            .filter(|segment| !is_irom_addr(segment.addr))
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(bytemuck::bytes_of(&ImageHeader {
            magic: V2_MAGIC,
            segment_count: V2_SEGMENT_COUNT,
            flash_mode: self.flash_mode,
            flash_config: self.flash_config,
            entry: self.entry,
        }));

        if let Some(segment) = irom_segment {
            // stored with load address 0; the loader reconstructs it
            save_segment(&mut out, &segment.with_new_address(0), 0);
        }

        out.extend_from_slice(bytemuck::bytes_of(&ImageHeader {
            magic: ESP_MAGIC,
            segment_count: normal_segments.len() as u8,
            flash_mode: self.flash_mode,
            flash_config: self.flash_config,
            entry: self.entry,
        }));

        let mut checksum = ESP_CHECKSUM_MAGIC;
        for segment in normal_segments {
            checksum = save_segment(&mut out, segment, checksum);
        }
        append_checksum(&mut out, checksum);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_image() -> OtaImage {
        let mut image = OtaImage::new(
            0x4010_0000,
            vec![
                // the irom segment lands at file offset 8 on save, so this
                // address survives a round trip
                Segment::new(IROM_MAP_START + 8, vec![0xAB; 48]),
                Segment::new(0x4010_0000, vec![0x11; 32]),
                Segment::new(0x3ffe_8000, (0..64).collect()),
            ],
        );
        image.flash_mode = 2;
        image.flash_config = 0x40;
        image
    }

    #[test]
    fn round_trip() {
        let image = test_image();
        let loaded = OtaImage::load(&image.save().unwrap()).unwrap();

        assert_eq!(loaded.entry, image.entry);
        assert_eq!(loaded.flash_mode, image.flash_mode);
        assert_eq!(loaded.flash_config, image.flash_config);
        assert_eq!(loaded.checksum, image.checksum);
        assert_eq!(loaded.segments.len(), image.segments.len());
        for (loaded, original) in loaded.segments.iter().zip(&image.segments) {
            assert_eq!(loaded.addr, original.addr);
            assert_eq!(loaded.data(), original.data());
        }
    }

    #[test]
    fn irom_segment_is_stored_with_zero_address() {
        let bytes = test_image().save().unwrap();

        // first segment header directly after the v2 header
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]), 48);
    }

    #[test]
    fn second_header_wins_on_disagreement() {
        let mut bytes = test_image().save().unwrap();
        // corrupt the flash mode in the first header only
        bytes[2] = 0x03;

        let loaded = OtaImage::load(&bytes).unwrap();
        assert_eq!(loaded.flash_mode, 2);
    }

    #[test]
    fn two_irom_segments_are_ambiguous() {
        let image = OtaImage::new(
            0x4010_0000,
            vec![
                Segment::new(IROM_MAP_START + 8, vec![0xAB; 16]),
                Segment::new(IROM_MAP_START + 0x1000, vec![0xCD; 16]),
            ],
        );

        match image.save() {
            Err(ImageError::AmbiguousIromSegment(2)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
