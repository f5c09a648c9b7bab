//! TDAT record stream format
//!
//! A flat sequence of `(id: 1 byte, length: 3 bytes LE, payload)` records
//! starting at offset 1, covering the whole buffer with no gaps. The first
//! pass validates exact coverage; the second extracts the configuration and
//! firmware records. Both extracted sections carry a length-prefixed header
//! that is stripped before the data is exposed.

use log::debug;

use crate::error::ParseError;
use crate::image_format::{checked_block, slice, Block, ImageMetadata};

const RECORD_CONFIG: u8 = 1;
const RECORD_FIRMWARE: u8 = 2;
const CONFIG_SUB_ID_UI: u16 = 0x0001;
const BUILD_ID_SIZE: usize = 3;

fn record_length(data: &[u8], offset: usize) -> Result<usize, ParseError> {
    let raw = slice(data, offset + 1, 3)?;
    Ok((raw[2] as usize) << 16 | (raw[1] as usize) << 8 | raw[0] as usize)
}

/// Strip the `first_byte + 1` header section off an extracted block.
fn strip_section_header(data: &[u8], block: Block) -> Result<Block, ParseError> {
    let section = slice(data, block.offset, block.len)?;
    let skip = *section.first().ok_or(ParseError::Misaligned)? as usize + 1;
    if skip > block.len {
        return Err(ParseError::Overflow {
            offset: block.offset,
            len: skip,
            image_size: data.len(),
        });
    }
    Ok(Block::new(block.offset + skip, block.len - skip))
}

/// Config records nest `(id: 2 LE, skip: 1, length: 2 LE)` sub-records; the
/// UI configuration hides behind sub-id 0x0001.
fn find_ui_config(data: &[u8], section: Block) -> Result<Option<Block>, ParseError> {
    let mut found = None;
    let mut offset = section.offset;
    let end = section.offset + section.len;

    while offset < end {
        let raw = slice(data, offset, 5)?;
        let id = (raw[1] as u16) << 8 | raw[0] as u16;
        let length = (raw[4] as usize) << 8 | raw[3] as usize;
        if id == CONFIG_SUB_ID_UI {
            found = Some(checked_block(data, offset + 5, length)?);
        }
        offset += length + 5;
    }

    Ok(found)
}

pub(super) fn parse(data: &[u8]) -> Result<ImageMetadata, ParseError> {
    // First pass: record lengths must span the buffer exactly.
    let mut offset = 1;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(ParseError::Misaligned);
        }
        let length = record_length(data, offset)?;
        let end = offset
            .checked_add(length + 4)
            .ok_or(ParseError::Misaligned)?;
        if end > data.len() {
            return Err(ParseError::Misaligned);
        }
        offset = end;
    }
    if offset != data.len() {
        return Err(ParseError::Misaligned);
    }

    let mut metadata = ImageMetadata::default();

    let mut offset = 1;
    while offset < data.len() {
        let id = data[offset];
        let length = record_length(data, offset)?;
        let section = Block::new(offset + 4, length);

        match id {
            RECORD_CONFIG => {
                if let Some(config) = find_ui_config(data, section)? {
                    metadata.ui_config = strip_section_header(data, config)?;
                }
            }
            RECORD_FIRMWARE => {
                let raw = slice(data, section.offset, section.len)?;
                if raw.len() < 1 + BUILD_ID_SIZE {
                    return Err(ParseError::Truncated {
                        need: 1 + BUILD_ID_SIZE,
                        have: raw.len(),
                    });
                }
                metadata.contains_firmware_id = true;
                metadata.firmware_id =
                    (raw[3] as u32) << 16 | (raw[2] as u32) << 8 | raw[1] as u32;
                metadata.ui_firmware = strip_section_header(data, section)?;
            }
            other => debug!("skipping TDAT record id {}", other),
        }

        offset += length + 4;
    }

    Ok(metadata)
}
