//! ESP32 image: a v1-style image with an extra 16 byte reserved header and
//! flash-mapped segments placed inline at 64KB-congruent file offsets
//!
//! The MMU maps flash in 64KB pages, so a flash-mapped segment's data must
//! sit at a file offset congruent to its virtual address modulo 64KB. On
//! save this is arranged by inserting zero-filled padding segments; two
//! real segments mapping into the same 64KB page cannot be represented and
//! are rejected.

use std::io::{Cursor, Read};

use crate::{
    error::ImageError,
    image_format::{
        append_checksum, load_common_header, load_segment, read_checksum, save_segment,
        update_checksum, ImageHeader, Segment, ESP_CHECKSUM_MAGIC, ESP_MAGIC, SEG_HEADER_LEN,
    },
    targets::Chip,
};

const IROM_ALIGN: u32 = 65536;

fn is_flash_addr(addr: u32) -> bool {
    let profile = Chip::Esp32.profile();
    let (irom_start, irom_end) = profile.irom_map;
    let (drom_start, drom_end) = profile.drom_map.unwrap_or((0, 0));

    (irom_start..irom_end).contains(&addr) || (drom_start..drom_end).contains(&addr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp32Image {
    pub flash_mode: u8,
    pub flash_config: u8,
    pub entry: u32,
    /// Reserved region after the common header, kept verbatim
    pub reserved_header: [u8; 16],
    pub segments: Vec<Segment>,
    pub checksum: u8,
}

impl Esp32Image {
    pub fn new(entry: u32, segments: Vec<Segment>) -> Self {
        let checksum = segments
            .iter()
            .fold(ESP_CHECKSUM_MAGIC, |sum, segment| {
                update_checksum(segment.data(), sum)
            });

        Esp32Image {
            flash_mode: 0,
            flash_config: 0,
            entry,
            reserved_header: [0; 16],
            segments,
            checksum,
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = Cursor::new(bytes);
        let header = load_common_header(&mut cursor, ESP_MAGIC)?;

        let mut reserved_header = [0u8; 16];
        cursor.read_exact(&mut reserved_header)?;

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

        Ok(Esp32Image {
            flash_mode: header.flash_mode,
            flash_config: header.flash_config,
            entry: header.entry,
            reserved_header,
            segments,
            checksum,
        })
    }

    pub fn save(&self) -> Result<Vec<u8>, ImageError> {
        let mut out = Vec::new();
        out.extend_from_slice(bytemuck::bytes_of(&ImageHeader {
            magic: ESP_MAGIC,
            segment_count: self.segments.len() as u8,
            flash_mode: self.flash_mode,
            flash_config: self.flash_config,
            entry: self.entry,
        }));
        out.extend_from_slice(&self.reserved_header);

        let mut sorted: Vec<&Segment> = self.segments.iter().collect();
        sorted.sort_by_key(|segment| segment.addr);

        let mut checksum = ESP_CHECKSUM_MAGIC;
        let mut last_addr: Option<u32> = None;
        let mut padding_segments = 0usize;

        for segment in sorted {
            // two sections in one 64KB mapping page is almost always a
            // broken linker script; there is no file layout that maps both
            if let Some(last) = last_addr {
                if is_flash_addr(last)
                    && is_flash_addr(segment.addr)
                    && segment.addr / IROM_ALIGN == last / IROM_ALIGN
                {
                    return Err(ImageError::MappingCollision {
                        addr: segment.addr,
                        last_addr: last,
                    });
                }
            }
            last_addr = Some(segment.addr);

            if is_flash_addr(segment.addr) {
                // place the next segment header so that the data that
                // follows it is 64KB-congruent to the virtual address
                let align_past = (segment.addr % IROM_ALIGN) as i64 - SEG_HEADER_LEN as i64;
                let mut pad_len = (IROM_ALIGN as i64 - (out.len() as i64 % IROM_ALIGN as i64))
                    + align_past
                    - SEG_HEADER_LEN as i64;
                if pad_len < 0 {
                    pad_len += IROM_ALIGN as i64;
                }
                if pad_len > 0 {
                    let padding = Segment::new(0, vec![0; pad_len as usize]);
                    checksum = save_segment(&mut out, &padding, checksum);
                    padding_segments += 1;
                }

                debug_assert_eq!(
                    (out.len() as u32 + SEG_HEADER_LEN as u32) % IROM_ALIGN,
                    segment.addr % IROM_ALIGN
                );
            }

            checksum = save_segment(&mut out, segment, checksum);
        }

        append_checksum(&mut out, checksum);

        // the header's segment count must include the padding segments;
        // luckily the header itself is not checksummed
        out[1] = (self.segments.len() + padding_segments) as u8;

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip_ram_only() {
        let mut image = Esp32Image::new(
            0x4008_0000,
            vec![
                Segment::new(0x4008_0000, vec![0x11; 32]),
                Segment::new(0x3ffb_0000, (0..64).collect()),
            ],
        );
        image.flash_mode = 2;
        image.flash_config = 0x20;
        image.reserved_header[0] = 0xAA;

        let loaded = Esp32Image::load(&image.save().unwrap()).unwrap();
        assert_eq!(loaded.entry, image.entry);
        assert_eq!(loaded.reserved_header, image.reserved_header);
        assert_eq!(loaded.segments.len(), 2);
    }

    #[test]
    fn flash_mapped_segments_are_aligned() {
        let image = Esp32Image::new(
            0x400d_0010,
            vec![
                Segment::new(0x3ffb_0000, vec![0x22; 16]),
                // virtual address 0x10 past a 64KB boundary
                Segment::new(0x400d_0010, vec![0x33; 256]),
            ],
        );

        let bytes = image.save().unwrap();
        let loaded = Esp32Image::load(&bytes).unwrap();

        let mapped = loaded
            .segments
            .iter()
            .find(|segment| segment.addr == 0x400d_0010)
            .unwrap();
        // data begins 8 bytes after the segment header
        let data_offset = mapped.file_offset.unwrap() + SEG_HEADER_LEN as u32;
        assert_eq!(data_offset % IROM_ALIGN, mapped.addr % IROM_ALIGN);
        assert_eq!(mapped.data(), &[0x33; 256]);

        // padding shows up as an extra zero-address segment
        assert_eq!(loaded.segments.len(), 3);
    }

    #[test]
    fn same_mapping_page_is_fatal() {
        let image = Esp32Image::new(
            0x400d_0000,
            vec![
                Segment::new(0x400d_0000, vec![0x11; 16]),
                Segment::new(0x400d_8000, vec![0x22; 16]),
            ],
        );

        match image.save() {
            Err(ImageError::MappingCollision { addr, last_addr }) => {
                assert_eq!(last_addr, 0x400d_0000);
                assert_eq!(addr, 0x400d_8000);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn different_mapping_pages_are_fine() {
        let image = Esp32Image::new(
            0x400d_0000,
            vec![
                Segment::new(0x3f40_0020, vec![0x11; 16]),
                Segment::new(0x400d_0020, vec![0x22; 16]),
            ],
        );

        assert!(image.save().is_ok());
    }

    #[test]
    fn segment_count_includes_padding() {
        let image = Esp32Image::new(
            0x400d_0010,
            vec![
                Segment::new(0x3ffb_0000, vec![0x22; 16]),
                Segment::new(0x400d_0010, vec![0x33; 16]),
            ],
        );

        let bytes = image.save().unwrap();
        assert_eq!(bytes[1], 3);
    }
}
