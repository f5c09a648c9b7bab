//! Legacy fixed-header image format (header versions 0x05 and 0x06)
//!
//! The header occupies the first 0x54 bytes; the firmware payload area
//! starts at a fixed 0x100 offset, preceded by the lockdown data. Area
//! locations are cumulative offset arithmetic from there.

use bytemuck::{Pod, Zeroable};

use crate::error::ParseError;
use crate::image_format::{
    checked_block, le32, slice, ImageMetadata, HEADER_VERSION_06, IMAGE_AREA_OFFSET, LOCKDOWN_SIZE,
    PRODUCT_ID_SIZE,
};

const OPT_FIRMWARE_ID: u8 = 1 << 0;
const OPT_BOOTLOADER: u8 = 1 << 1;
#[allow(dead_code)]
const OPT_GUEST_CODE: u8 = 1 << 2;
const OPT_TDDI: u8 = 1 << 3;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct LegacyHeader {
    checksum: [u8; 4],
    reserved_04: u8,
    reserved_05: u8,
    options: u8,
    header_version: u8,
    firmware_size: [u8; 4],
    config_size: [u8; 4],
    product_id: [u8; PRODUCT_ID_SIZE],
    package_id: [u8; 2],
    package_id_revision: [u8; 2],
    product_info: [u8; 2],
    bootloader_addr: [u8; 4],
    bootloader_size: [u8; 4],
    ui_addr: [u8; 4],
    ui_size: [u8; 4],
    ds_id: [u8; 16],
    // Overlaid with the custom product id when no display config is carried.
    dsp_cfg_addr: [u8; 4],
    dsp_cfg_size: [u8; 4],
    reserved_48_4f: [u8; 8],
    firmware_id: [u8; 4],
}

fn product_id_string(raw: &[u8; PRODUCT_ID_SIZE]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub(super) fn parse(data: &[u8]) -> Result<ImageMetadata, ParseError> {
    // The lockdown block butts up against the image area, so anything
    // shorter than the image area base cannot be a legacy image.
    if data.len() < IMAGE_AREA_OFFSET {
        return Err(ParseError::Truncated {
            need: IMAGE_AREA_OFFSET,
            have: data.len(),
        });
    }

    let raw = slice(data, 0, std::mem::size_of::<LegacyHeader>())?;
    let header: &LegacyHeader =
        bytemuck::from_bytes(raw);

    let mut metadata = ImageMetadata {
        checksum: u32::from_le_bytes(header.checksum),
        bootloader_version: header.header_version,
        product_id: product_id_string(&header.product_id),
        ..ImageMetadata::default()
    };

    metadata.contains_bootloader = header.options & OPT_BOOTLOADER != 0;
    let bootloader_size = if metadata.contains_bootloader {
        u32::from_le_bytes(header.bootloader_size) as usize
    } else {
        0
    };
    if metadata.contains_bootloader {
        metadata.bootloader = checked_block(data, IMAGE_AREA_OFFSET, bootloader_size)?;
    }

    let firmware_size = u32::from_le_bytes(header.firmware_size) as usize;
    if firmware_size != 0 {
        let mut offset = IMAGE_AREA_OFFSET + bootloader_size;
        // TDDI v6 images keep the firmware at the image area base even when
        // a bootloader payload is present.
        if header.header_version == HEADER_VERSION_06 && header.options & OPT_TDDI != 0 {
            offset = IMAGE_AREA_OFFSET;
        }
        metadata.ui_firmware = checked_block(data, offset, firmware_size)?;
    }

    let config_size = u32::from_le_bytes(header.config_size) as usize;
    if config_size != 0 {
        metadata.ui_config = checked_block(
            data,
            metadata.ui_firmware.offset + metadata.ui_firmware.len,
            config_size,
        )?;
    }

    metadata.contains_disp_config =
        metadata.contains_bootloader || header.options & OPT_TDDI != 0;
    if metadata.contains_disp_config {
        let dp_offset = u32::from_le_bytes(header.dsp_cfg_addr) as usize;
        let dp_size = le32(&header.dsp_cfg_size, 0)? as usize;
        metadata.dp_config = checked_block(data, dp_offset, dp_size)?;
    } else {
        // Custom product id shares the display-config header bytes.
        let raw = slice(data, 0x40, PRODUCT_ID_SIZE)?;
        let mut cstmr = [0u8; PRODUCT_ID_SIZE];
        cstmr.copy_from_slice(raw);
        metadata.cstmr_product_id = product_id_string(&cstmr);
    }

    metadata.contains_firmware_id = header.options & OPT_FIRMWARE_ID != 0;
    if metadata.contains_firmware_id {
        metadata.firmware_id = u32::from_le_bytes(header.firmware_id);
    }

    metadata.lockdown = checked_block(data, IMAGE_AREA_OFFSET - LOCKDOWN_SIZE, LOCKDOWN_SIZE)?;

    Ok(metadata)
}
