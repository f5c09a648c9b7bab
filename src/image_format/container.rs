//! Container image format (header version 0x10)
//!
//! The header points at a top-level container whose content is a flat array
//! of 4-byte descriptor addresses. Each descriptor names a container id and
//! locates its content; the bootloader container nests its own descriptor
//! array for the bootloader-config and lockdown-info sub-containers.

use bytemuck::{Pod, Zeroable};

use crate::error::ParseError;
use crate::image_format::{checked_block, le32, slice, Block, ImageMetadata};

const TOP_LEVEL_CONTAINER_ADDR_OFFSET: usize = 0x0c;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct ContainerDescriptor {
    content_checksum: [u8; 4],
    container_id: [u8; 2],
    minor_version: u8,
    major_version: u8,
    reserved_08: [u8; 4],
    container_option_flags: [u8; 4],
    content_options_length: [u8; 4],
    content_options_address: [u8; 4],
    content_length: [u8; 4],
    content_address: [u8; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(u16)]
enum ContainerId {
    TopLevel = 0,
    Ui = 1,
    UiConfig = 2,
    Bl = 3,
    BlImage = 4,
    BlConfig = 5,
    BlLockdownInfo = 6,
    PermanentConfig = 7,
    GuestCode = 8,
    BlProtocolDescriptor = 9,
    UiProtocolDescriptor = 10,
    RmiSelfDiscovery = 11,
    RmiPageContent = 12,
    GeneralInformation = 13,
    DeviceConfig = 14,
    FlashConfig = 15,
    GuestSerialization = 16,
    GlobalParameters = 17,
    CoreCode = 18,
    CoreConfig = 19,
    DisplayConfig = 20,
}

struct Container {
    id: Option<ContainerId>,
    content: Block,
}

fn descriptor_at(data: &[u8], addr: usize) -> Result<Container, ParseError> {
    let raw = slice(data, addr, std::mem::size_of::<ContainerDescriptor>())?;
    let descriptor: &ContainerDescriptor = bytemuck::from_bytes(raw);

    let id = u16::from_le_bytes(descriptor.container_id);
    let content_addr = u32::from_le_bytes(descriptor.content_address) as usize;
    let length = u32::from_le_bytes(descriptor.content_length) as usize;

    Ok(Container {
        id: ContainerId::from_repr(id),
        content: checked_block(data, content_addr, length)?,
    })
}

/// The bootloader container content is a version word followed by descriptor
/// addresses for its sub-containers.
fn parse_bl_container(
    data: &[u8],
    bootloader: Block,
    metadata: &mut ImageMetadata,
) -> Result<(), ParseError> {
    let sub_containers = bootloader.len.saturating_sub(4) / 4;

    for ii in 1..=sub_containers {
        let addr = le32(data, bootloader.offset + ii * 4)? as usize;
        let container = descriptor_at(data, addr)?;
        match container.id {
            Some(ContainerId::BlConfig) | Some(ContainerId::GlobalParameters) => {
                metadata.bl_config = container.content;
            }
            Some(ContainerId::BlLockdownInfo) | Some(ContainerId::DeviceConfig) => {
                metadata.lockdown = container.content;
            }
            _ => {}
        }
    }

    Ok(())
}

pub(super) fn parse(data: &[u8]) -> Result<ImageMetadata, ParseError> {
    let mut metadata = ImageMetadata {
        checksum: le32(data, 0)?,
        ..ImageMetadata::default()
    };

    let top_level_addr = le32(data, TOP_LEVEL_CONTAINER_ADDR_OFFSET)? as usize;
    let top_level = descriptor_at(data, top_level_addr)?;

    let mut offset = top_level.content.offset;
    let containers = top_level.content.len / 4;

    for _ in 0..containers {
        let addr = le32(data, offset)? as usize;
        offset += 4;
        let container = descriptor_at(data, addr)?;
        match container.id {
            Some(ContainerId::Ui) | Some(ContainerId::CoreCode) => {
                metadata.ui_firmware = container.content;
            }
            Some(ContainerId::UiConfig) | Some(ContainerId::CoreConfig) => {
                metadata.ui_config = container.content;
            }
            Some(ContainerId::Bl) => {
                let content = slice(data, container.content.offset, container.content.len)?;
                metadata.bootloader_version = *content.first().ok_or(ParseError::Overflow {
                    offset: container.content.offset,
                    len: 1,
                    image_size: data.len(),
                })?;
                metadata.contains_bootloader = true;
                metadata.bootloader = container.content;
                parse_bl_container(data, container.content, &mut metadata)?;
            }
            Some(ContainerId::GuestCode) => {
                metadata.contains_guest_code = true;
                metadata.guest_code = container.content;
            }
            Some(ContainerId::DisplayConfig) => {
                metadata.contains_disp_config = true;
                metadata.dp_config = container.content;
            }
            Some(ContainerId::FlashConfig) => {
                metadata.contains_flash_config = true;
                metadata.fl_config = container.content;
            }
            Some(ContainerId::GeneralInformation) => {
                metadata.contains_firmware_id = true;
                metadata.firmware_id = le32(data, container.content.offset + 4)?;
            }
            // Unrecognized ids are skipped without error.
            _ => {}
        }
    }

    Ok(metadata)
}
