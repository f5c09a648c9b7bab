//! Bootloader v5/v6 protocol
//!
//! A single command register drives everything. Block transfers move one
//! block per transaction; the configuration area selector rides in the high
//! bits of the second block-number byte, and flash-unlocking commands carry
//! the bootloader id in the payload register first.

use log::debug;

use crate::{
    command::{ConfigArea, FlashCommand},
    connection::Connection,
    error::Error,
    targets::{BootloaderVersion, DeviceProfile, ProtocolAdapter, StatusSnapshot},
};

const BOOTLOADER_ID_OFFSET: u16 = 0;

const V5_PROPERTIES_OFFSET: u16 = 2;
const V5_BLOCK_SIZE_OFFSET: u16 = 3;
const V5_BLOCK_COUNT_OFFSET: u16 = 5;
const V5_BLOCK_NUMBER_OFFSET: u16 = 0;
const V5_BLOCK_DATA_OFFSET: u16 = 2;

const V6_PROPERTIES_OFFSET: u16 = 1;
const V6_BLOCK_SIZE_OFFSET: u16 = 2;
const V6_BLOCK_COUNT_OFFSET: u16 = 3;
const V6_PROPERTIES_2_OFFSET: u16 = 4;
const V6_GUEST_CODE_BLOCK_COUNT_OFFSET: u16 = 5;
const V6_BLOCK_NUMBER_OFFSET: u16 = 0;
const V6_BLOCK_DATA_OFFSET: u16 = 1;
const V6_FLASH_COMMAND_OFFSET: u16 = 2;
const V6_FLASH_STATUS_OFFSET: u16 = 3;

const PROPERTIES_2_HAS_GUEST_CODE: u8 = 1 << 0;

const CMD_IDLE: u8 = 0x0;
const CMD_WRITE_FW: u8 = 0x2;
const CMD_ERASE_ALL: u8 = 0x3;
const CMD_WRITE_LOCKDOWN: u8 = 0x4;
const CMD_READ_CONFIG: u8 = 0x5;
const CMD_WRITE_CONFIG: u8 = 0x6;
const CMD_ERASE_UI_CONFIG: u8 = 0x7;
const CMD_ERASE_BL_CONFIG: u8 = 0x9;
const CMD_ERASE_DISP_CONFIG: u8 = 0xa;
const CMD_ERASE_GUEST_CODE: u8 = 0xb;
const CMD_WRITE_GUEST_CODE: u8 = 0xc;
const CMD_ENABLE_FLASH_PROG: u8 = 0xf;

pub(crate) struct V5V6Adapter;

impl V5V6Adapter {
    fn opcode(cmd: FlashCommand) -> Result<u8, Error> {
        let opcode = match cmd {
            FlashCommand::Idle => CMD_IDLE,
            FlashCommand::WriteFirmware => CMD_WRITE_FW,
            FlashCommand::WriteConfig(_) => CMD_WRITE_CONFIG,
            FlashCommand::WriteLockdown => CMD_WRITE_LOCKDOWN,
            FlashCommand::WriteGuestCode => CMD_WRITE_GUEST_CODE,
            FlashCommand::ReadConfig(_) => CMD_READ_CONFIG,
            FlashCommand::EraseAll => CMD_ERASE_ALL,
            FlashCommand::EraseConfig(ConfigArea::Ui) => CMD_ERASE_UI_CONFIG,
            FlashCommand::EraseConfig(ConfigArea::Bootloader) => CMD_ERASE_BL_CONFIG,
            FlashCommand::EraseConfig(ConfigArea::Display) => CMD_ERASE_DISP_CONFIG,
            FlashCommand::EraseGuestCode => CMD_ERASE_GUEST_CODE,
            FlashCommand::EnterBootloader => CMD_ENABLE_FLASH_PROG,
            _ => return Err(Error::UnsupportedCommand(cmd)),
        };
        Ok(opcode)
    }

    /// The area selector rides in bits 5..7 of the second block-number byte.
    fn write_block_number(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        cmd: FlashCommand,
    ) -> Result<(), Error> {
        let area = cmd.config_area().map(ConfigArea::selector).unwrap_or(0);
        let block_number = [0, area << 5];
        conn.write(
            profile.flash_fn.data_base + profile.regs.block_number,
            &block_number,
        )?;
        Ok(())
    }
}

impl ProtocolAdapter for V5V6Adapter {
    fn read_queries(
        &self,
        conn: &mut Connection,
        profile: &mut DeviceProfile,
    ) -> Result<(), Error> {
        let base = profile.flash_fn.query_base;

        let mut bootloader_id = [0u8; 2];
        conn.read(base + BOOTLOADER_ID_OFFSET, &mut bootloader_id)?;
        profile.bootloader_id = bootloader_id;

        match profile.version {
            BootloaderVersion::V5 => {
                profile.regs.properties = V5_PROPERTIES_OFFSET;
                profile.regs.block_size = V5_BLOCK_SIZE_OFFSET;
                profile.regs.block_count = V5_BLOCK_COUNT_OFFSET;
                profile.regs.block_number = V5_BLOCK_NUMBER_OFFSET;
                profile.regs.payload = V5_BLOCK_DATA_OFFSET;
            }
            _ => {
                profile.regs.properties = V6_PROPERTIES_OFFSET;
                profile.regs.properties_2 = V6_PROPERTIES_2_OFFSET;
                profile.regs.block_size = V6_BLOCK_SIZE_OFFSET;
                profile.regs.block_count = V6_BLOCK_COUNT_OFFSET;
                profile.regs.gc_block_count = V6_GUEST_CODE_BLOCK_COUNT_OFFSET;
                profile.regs.block_number = V6_BLOCK_NUMBER_OFFSET;
                profile.regs.payload = V6_BLOCK_DATA_OFFSET;
            }
        }

        let mut buf = [0u8; 2];
        conn.read(base + profile.regs.block_size, &mut buf)?;
        profile.block_size = u16::from_le_bytes(buf);
        // One block per transaction on this generation.
        profile.payload_length = 1;

        // The v5 command register floats after the payload window.
        if profile.version == BootloaderVersion::V5 {
            profile.regs.flash_cmd = profile.regs.payload + profile.block_size;
            profile.regs.flash_status = profile.regs.flash_cmd;
        } else {
            profile.regs.flash_cmd = V6_FLASH_COMMAND_OFFSET;
            profile.regs.flash_status = V6_FLASH_STATUS_OFFSET;
        }

        let properties = conn.read_u8(base + profile.regs.properties)?;
        profile.properties = super::FlashProperties::from_bits_retain(properties);

        let mut count = 4;
        if profile.properties.contains(super::FlashProperties::HAS_PM_CONFIG) {
            count += 2;
        }
        if profile.properties.contains(super::FlashProperties::HAS_BL_CONFIG) {
            count += 2;
        }
        if profile.properties.contains(super::FlashProperties::HAS_DISP_CONFIG) {
            count += 2;
        }

        let mut counts = [0u8; 10];
        conn.read(base + profile.regs.block_count, &mut counts[..count])?;

        profile.block_counts = Default::default();
        profile.block_counts.ui_firmware = u16::from_le_bytes([counts[0], counts[1]]);
        profile.block_counts.ui_config = u16::from_le_bytes([counts[2], counts[3]]);

        let mut index = 4;
        if profile.properties.contains(super::FlashProperties::HAS_PM_CONFIG) {
            profile.block_counts.pm_config = u16::from_le_bytes([counts[index], counts[index + 1]]);
            index += 2;
        }
        if profile.properties.contains(super::FlashProperties::HAS_BL_CONFIG) {
            profile.block_counts.bl_config = u16::from_le_bytes([counts[index], counts[index + 1]]);
            index += 2;
        }
        if profile.properties.contains(super::FlashProperties::HAS_DISP_CONFIG) {
            profile.block_counts.dp_config = u16::from_le_bytes([counts[index], counts[index + 1]]);
        }

        profile.has_guest_code = false;
        if profile.properties.contains(super::FlashProperties::HAS_QUERY4) {
            let properties_2 = conn.read_u8(base + profile.regs.properties_2)?;
            if properties_2 & PROPERTIES_2_HAS_GUEST_CODE != 0 {
                let mut buf = [0u8; 2];
                conn.read(base + profile.regs.gc_block_count, &mut buf)?;
                profile.block_counts.guest_code = u16::from_le_bytes(buf);
                profile.has_guest_code = true;
            }
        }

        debug!(
            "v{} queries: block size {}, fw {} blocks, config {} blocks",
            profile.version as u8,
            profile.block_size,
            profile.block_counts.ui_firmware,
            profile.block_counts.ui_config
        );

        Ok(())
    }

    fn read_status(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
    ) -> Result<StatusSnapshot, Error> {
        let base = profile.flash_fn.data_base;

        let raw = conn.read_u8(base + profile.regs.flash_status)?;
        let in_bootloader = raw >> 7 != 0;
        let status = if profile.version == BootloaderVersion::V5 {
            (raw >> 4) & 0x07
        } else {
            raw & 0x07
        };

        let raw_cmd = conn.read_u8(base + profile.regs.flash_cmd)?;
        let command = if profile.version == BootloaderVersion::V5 {
            raw_cmd & 0x0f
        } else {
            raw_cmd & 0x3f
        };

        Ok(StatusSnapshot {
            in_bootloader,
            status,
            command,
        })
    }

    fn write_command(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        cmd: FlashCommand,
    ) -> Result<(), Error> {
        let base = profile.flash_fn.data_base;
        let opcode = Self::opcode(cmd)?;

        if cmd.needs_bootloader_id() {
            conn.write(base + profile.regs.payload, &profile.bootloader_id)?;
        }

        debug!("command {} ({:#03x})", cmd, opcode);
        conn.write_u8(base + profile.regs.flash_cmd, opcode)?;
        Ok(())
    }

    fn write_blocks(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        data: &[u8],
        block_count: u16,
        cmd: FlashCommand,
    ) -> Result<(), Error> {
        let base = profile.flash_fn.data_base;
        let block_size = profile.block_size as usize;

        if data.len() < block_count as usize * block_size {
            return Err(Error::InternalError);
        }

        self.write_block_number(conn, profile, cmd)?;

        for blk in 0..block_count as usize {
            let block = &data[blk * block_size..(blk + 1) * block_size];
            conn.write(base + profile.regs.payload, block)?;
            self.write_command(conn, profile, cmd)?;
            self.wait_for_idle(conn, profile, cmd.timeout(), cmd)?;
        }

        Ok(())
    }

    fn read_blocks(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        block_count: u16,
        cmd: FlashCommand,
    ) -> Result<Vec<u8>, Error> {
        let base = profile.flash_fn.data_base;
        let block_size = profile.block_size as usize;
        let mut out = vec![0u8; block_count as usize * block_size];

        self.write_block_number(conn, profile, cmd)?;

        for blk in 0..block_count as usize {
            self.write_command(conn, profile, cmd)?;
            self.wait_for_idle(conn, profile, cmd.timeout(), cmd)?;
            conn.read(
                base + profile.regs.payload,
                &mut out[blk * block_size..(blk + 1) * block_size],
            )?;
        }

        Ok(out)
    }
}
