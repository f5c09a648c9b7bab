//! Partition table model for bootloader v7/v8
//!
//! The flash-config partition holds the device's partition table as fixed
//! 8-byte entries starting at byte 2. The same layout appears inside a v7/v8
//! image's flash-config area, which is how the flasher decides whether the
//! partition geometry has to be recreated.

use log::debug;

use crate::error::ParseError;
use crate::targets::{BlockCounts, FlashProperties, PartitionId, PhysicalAddresses};

pub(crate) const ENTRY_SIZE: usize = 8;
pub(crate) const TABLE_HEADER_SIZE: usize = 2;

/// Decode a raw partition table into per-area block counts and physical
/// addresses. Unknown partition ids are ignored.
pub fn parse_partition_table(
    raw: &[u8],
    partitions: u8,
) -> Result<(BlockCounts, PhysicalAddresses), ParseError> {
    let mut counts = BlockCounts::default();
    let mut addresses = PhysicalAddresses::default();

    for ii in 0..partitions as usize {
        let index = ii * ENTRY_SIZE + TABLE_HEADER_SIZE;
        let entry = raw
            .get(index..index + ENTRY_SIZE)
            .ok_or(ParseError::Overflow {
                offset: index,
                len: ENTRY_SIZE,
                image_size: raw.len(),
            })?;

        let id = entry[0] & 0x1f;
        let length = (entry[3] as u16) << 8 | entry[2] as u16;
        let address = (entry[5] as u16) << 8 | entry[4] as u16;

        match PartitionId::from_repr(id) {
            Some(PartitionId::CoreCode) => {
                counts.ui_firmware = length;
                addresses.ui_firmware = address;
            }
            Some(PartitionId::CoreConfig) => {
                counts.ui_config = length;
                addresses.ui_config = address;
            }
            Some(PartitionId::DisplayConfig) => {
                counts.dp_config = length;
                addresses.dp_config = address;
            }
            Some(PartitionId::FlashConfig) => {
                counts.fl_config = length;
            }
            Some(PartitionId::GuestCode) => {
                counts.guest_code = length;
                addresses.guest_code = address;
            }
            Some(PartitionId::GuestSerialization) => {
                counts.pm_config = length;
            }
            Some(PartitionId::GlobalParameters) => {
                counts.bl_config = length;
            }
            Some(PartitionId::DeviceConfig) => {
                counts.lockdown = length;
            }
            other => {
                debug!("partition entry {}: id {:#04x} ({:?}) ignored", ii, id, other);
            }
        }
    }

    Ok((counts, addresses))
}

/// A table is "new" when any comparable physical address differs; recreating
/// it on the device is destructive and therefore gated on force_update.
pub fn tables_differ(
    device: &PhysicalAddresses,
    image: &PhysicalAddresses,
    properties: FlashProperties,
    has_guest_code: bool,
) -> bool {
    if device.ui_firmware != image.ui_firmware {
        return true;
    }
    if device.ui_config != image.ui_config {
        return true;
    }
    if properties.contains(FlashProperties::HAS_DISP_CONFIG) && device.dp_config != image.dp_config
    {
        return true;
    }
    if has_guest_code && device.guest_code != image.guest_code {
        return true;
    }
    false
}
