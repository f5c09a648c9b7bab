//! Firmware image formats
//!
//! Three container formats have shipped over the controller generations: a
//! fixed legacy header (versions 0x05/0x06), a nested container layout
//! (header version 0x10) and the flat TDAT record stream. All three parse
//! into the same [`ImageMetadata`] shape; the orchestrator never cares which
//! one the blob arrived in beyond the gating rules in the reflash flow.

use log::debug;

use crate::error::ParseError;

mod container;
mod legacy;
mod tdat;

/// Offset of the firmware payload area in legacy images. The 0x50 bytes
/// immediately before it hold the lockdown data.
pub(crate) const IMAGE_AREA_OFFSET: usize = 0x100;
pub(crate) const LOCKDOWN_SIZE: usize = 0x50;
pub(crate) const PRODUCT_ID_SIZE: usize = 10;

const TDAT_LEADING_BYTE: u8 = 0x31;
const HEADER_VERSION_OFFSET: usize = 0x07;
pub(crate) const HEADER_VERSION_05: u8 = 0x05;
pub(crate) const HEADER_VERSION_06: u8 = 0x06;
pub(crate) const HEADER_VERSION_10: u8 = 0x10;

/// Which container format the image arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Legacy,
    Container,
    Tdat,
}

/// Location of one named area inside the image buffer.
///
/// A parsed block is guaranteed to lie inside the buffer; a zero-length
/// block means the area is absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub offset: usize,
    pub len: usize,
}

impl Block {
    pub(crate) fn new(offset: usize, len: usize) -> Self {
        Block { offset, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Everything the orchestrator needs to know about a parsed image.
#[derive(Clone, Debug, Default)]
pub struct ImageMetadata {
    pub checksum: u32,
    pub firmware_id: u32,
    pub bootloader_version: u8,
    pub product_id: String,
    pub cstmr_product_id: String,

    pub contains_firmware_id: bool,
    pub contains_bootloader: bool,
    pub contains_disp_config: bool,
    pub contains_guest_code: bool,
    pub contains_flash_config: bool,

    pub bootloader: Block,
    pub ui_firmware: Block,
    pub ui_config: Block,
    pub dp_config: Block,
    pub fl_config: Block,
    pub bl_config: Block,
    pub guest_code: Block,
    pub lockdown: Block,
}

/// A firmware blob plus the metadata derived from it. Immutable once parsed.
pub struct FirmwareImage {
    data: Vec<u8>,
    kind: ImageKind,
    pub metadata: ImageMetadata,
}

impl FirmwareImage {
    /// Auto-detect the container format and parse the blob.
    pub fn parse(data: Vec<u8>) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::Truncated { need: 1, have: 0 });
        }

        let (kind, metadata) = if data[0] == TDAT_LEADING_BYTE {
            (ImageKind::Tdat, tdat::parse(&data)?)
        } else {
            let version = *data
                .get(HEADER_VERSION_OFFSET)
                .ok_or(ParseError::Truncated {
                    need: HEADER_VERSION_OFFSET + 1,
                    have: data.len(),
                })?;
            match version {
                HEADER_VERSION_05 | HEADER_VERSION_06 => {
                    (ImageKind::Legacy, legacy::parse(&data)?)
                }
                HEADER_VERSION_10 => (ImageKind::Container, container::parse(&data)?),
                other => return Err(ParseError::UnsupportedFormat(other)),
            }
        };

        debug!(
            "parsed {:?} image: fw {} bytes, ui config {} bytes, build id {:#010x}",
            kind, metadata.ui_firmware.len, metadata.ui_config.len, metadata.firmware_id
        );

        Ok(FirmwareImage {
            data,
            kind,
            metadata,
        })
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of a parsed block. Parsing validated the range, so this cannot
    /// leave the buffer.
    pub fn block(&self, block: Block) -> &[u8] {
        &self.data[block.offset..block.offset + block.len]
    }
}

/// Bounds-checked sub-slice; embedded length fields are never trusted.
pub(crate) fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::Overflow {
        offset,
        len,
        image_size: data.len(),
    })?;
    data.get(offset..end).ok_or(ParseError::Overflow {
        offset,
        len,
        image_size: data.len(),
    })
}

pub(crate) fn checked_block(data: &[u8], offset: usize, len: usize) -> Result<Block, ParseError> {
    slice(data, offset, len)?;
    Ok(Block::new(offset, len))
}

pub(crate) fn le32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let raw = slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
