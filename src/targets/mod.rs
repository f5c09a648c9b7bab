//! Bootloader generations and the protocol adapter seam
//!
//! Four bootloader generations share one generic command vocabulary but
//! disagree on register offsets, opcodes and transfer framing. The
//! [`ProtocolAdapter`] trait owns that mapping; the orchestrator picks an
//! implementation once per session via [`BootloaderVersion::adapter`].

use std::time::Duration;

use bitflags::bitflags;
use log::debug;

use crate::{
    command::FlashCommand,
    connection::{discovery::FunctionRecord, Connection},
    error::{Error, ResultExt, StatusError},
};

mod v5v6;
mod v7v8;

pub(crate) use v5v6::V5V6Adapter;
pub(crate) use v7v8::V7V8Adapter;

pub(crate) const V5V6_CONFIG_ID_SIZE: usize = 4;
pub(crate) const V7_CONFIG_ID_SIZE: usize = 32;

/// The device-side bootloader generation, derived from the flash function's
/// register-layout revision (and the queried major revision for v8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[repr(u8)]
pub enum BootloaderVersion {
    V5 = 5,
    V6 = 6,
    V7 = 7,
    V8 = 8,
}

impl BootloaderVersion {
    pub(crate) fn from_function_version(version: u8) -> Result<Self, Error> {
        match version {
            0 => Ok(BootloaderVersion::V5),
            1 => Ok(BootloaderVersion::V6),
            2 => Ok(BootloaderVersion::V7),
            other => Err(Error::UnknownBootloaderVersion(other)),
        }
    }

    pub(crate) fn adapter(self) -> Box<dyn ProtocolAdapter + Send + Sync> {
        match self {
            BootloaderVersion::V5 | BootloaderVersion::V6 => Box::new(V5V6Adapter),
            BootloaderVersion::V7 | BootloaderVersion::V8 => Box::new(V7V8Adapter),
        }
    }

    pub fn config_id_size(self) -> usize {
        if self >= BootloaderVersion::V7 {
            V7_CONFIG_ID_SIZE
        } else {
            V5V6_CONFIG_ID_SIZE
        }
    }
}

/// Flash partition ids used on the wire by bootloader v7/v8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum PartitionId {
    Bootloader = 1,
    DeviceConfig = 2,
    FlashConfig = 3,
    ManufacturingBlock = 4,
    GuestSerialization = 5,
    GlobalParameters = 6,
    CoreCode = 7,
    CoreConfig = 8,
    GuestCode = 9,
    DisplayConfig = 10,
}

bitflags! {
    /// Capability bits from the flash-properties query. v5/v6 report the
    /// full register; v7/v8 synthesize the subset they publish in query 7.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FlashProperties: u8 {
        const REG_MAP = 1 << 0;
        const UNLOCKED = 1 << 1;
        const HAS_CONFIG_ID = 1 << 2;
        const HAS_PM_CONFIG = 1 << 3;
        const HAS_BL_CONFIG = 1 << 4;
        const HAS_DISP_CONFIG = 1 << 5;
        const HAS_CTRL1 = 1 << 6;
        const HAS_QUERY4 = 1 << 7;
    }
}

/// Per-version register offsets, relative to the flash function's query and
/// data base addresses. Populated by the adapter's query pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterMap {
    pub properties: u16,
    pub properties_2: u16,
    pub block_size: u16,
    pub block_count: u16,
    pub gc_block_count: u16,
    pub flash_status: u16,
    pub partition_id: u16,
    pub block_number: u16,
    pub transfer_length: u16,
    pub flash_cmd: u16,
    pub payload: u16,
}

/// Block counts per flash area, as last reported by the device (or decoded
/// from an image's partition table).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub ui_firmware: u16,
    pub ui_config: u16,
    pub dp_config: u16,
    pub fl_config: u16,
    pub pm_config: u16,
    pub bl_config: u16,
    pub lockdown: u16,
    pub guest_code: u16,
}

/// Physical start addresses of the comparable partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhysicalAddresses {
    pub ui_firmware: u16,
    pub ui_config: u16,
    pub dp_config: u16,
    pub guest_code: u16,
}

/// Everything queried from the device, refreshed after every re-scan.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub version: BootloaderVersion,
    pub control_fn: FunctionRecord,
    pub flash_fn: FunctionRecord,
    pub intr_mask: u8,
    pub regs: RegisterMap,
    pub bootloader_id: [u8; 2],
    pub block_size: u16,
    /// Max blocks per transfer (v7/v8); v5/v6 move one block at a time.
    pub payload_length: u16,
    pub flash_config_length: u16,
    pub partitions: u8,
    pub properties: FlashProperties,
    pub has_guest_code: bool,
    pub block_counts: BlockCounts,
    pub addresses: PhysicalAddresses,
    pub config_id: Vec<u8>,
    pub build_id: u32,
}

impl DeviceProfile {
    pub(crate) fn new(
        version: BootloaderVersion,
        control_fn: FunctionRecord,
        flash_fn: FunctionRecord,
    ) -> Self {
        let mut intr_mask = 0;
        for ii in 0..flash_fn.intr_sources {
            intr_mask |= 1 << ii;
        }
        DeviceProfile {
            version,
            control_fn,
            flash_fn,
            intr_mask,
            regs: RegisterMap::default(),
            bootloader_id: [0; 2],
            block_size: 0,
            payload_length: 0,
            flash_config_length: 0,
            partitions: 0,
            properties: FlashProperties::empty(),
            has_guest_code: false,
            block_counts: BlockCounts::default(),
            addresses: PhysicalAddresses::default(),
            config_id: Vec::new(),
            build_id: 0,
        }
    }

    pub fn config_id_size(&self) -> usize {
        self.version.config_id_size()
    }
}

/// Decoded flash status register.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusSnapshot {
    pub in_bootloader: bool,
    pub status: u8,
    pub command: u8,
}

impl StatusSnapshot {
    pub fn is_idle(&self) -> bool {
        self.command == 0 && self.status == 0
    }
}

/// Version-specific wire protocol behind the generic command set.
pub trait ProtocolAdapter {
    /// Populate the profile from the bootloader queries. For v7/v8 this
    /// includes reading the device partition table out of the flash-config
    /// partition, and may promote the profile to v8.
    fn read_queries(&self, conn: &mut Connection, profile: &mut DeviceProfile)
        -> Result<(), Error>;

    fn read_status(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
    ) -> Result<StatusSnapshot, Error>;

    fn write_command(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        cmd: FlashCommand,
    ) -> Result<(), Error>;

    fn write_blocks(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        data: &[u8],
        block_count: u16,
        cmd: FlashCommand,
    ) -> Result<(), Error>;

    fn read_blocks(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        block_count: u16,
        cmd: FlashCommand,
    ) -> Result<Vec<u8>, Error>;

    /// Block until the controller reports idle again. The status registers
    /// are read even after a timeout so diagnostics survive; a controller
    /// that turns out idle wins over the missed interrupt.
    fn wait_for_idle(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        timeout: Duration,
        op: FlashCommand,
    ) -> Result<StatusSnapshot, Error> {
        let waited = conn.wait_attention(timeout);

        // Clears the interrupt latch; the value itself is only of interest
        // in the trace log.
        match conn.read_u8(profile.control_fn.data_base + 1) {
            Ok(intr) => debug!("interrupt status {:#04x}", intr),
            Err(err) => debug!("interrupt status read failed: {}", err),
        }

        let snapshot = self.read_status(conn, profile)?;
        if snapshot.is_idle() {
            return Ok(snapshot);
        }

        waited.map_err(Error::Connection).for_command(op)?;
        Err(Error::DeviceStatus(StatusError::new(op, snapshot.status)))
    }
}
