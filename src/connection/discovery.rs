//! On-device function discovery
//!
//! The controller publishes the functions it exposes in a descriptor table
//! near the top of register page 0. Reflashing needs three of them: the
//! device-control function (reset, interrupt status, sleep control), the
//! flash function (the bootloader itself) and, on otherwise bricked parts,
//! the microbootloader recovery function.

use log::{debug, warn};

use crate::{
    connection::Connection,
    error::{ConnectionError, Error},
};

pub(crate) const DEVICE_CONTROL_FN: u8 = 0x01;
pub(crate) const FLASH_FN: u8 = 0x34;
pub(crate) const RECOVERY_FN: u8 = 0x35;

const PDT_START: u16 = 0x00e9;
const PDT_END: u16 = 0x00c0;
const PDT_ENTRY_SIZE: u16 = 6;

/// A function published in the descriptor table.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionRecord {
    pub query_base: u16,
    pub cmd_base: u16,
    pub ctrl_base: u16,
    pub data_base: u16,
    /// Function register-layout revision. For the flash function this is
    /// what selects the bootloader protocol.
    pub version: u8,
    pub intr_sources: u8,
    pub number: u8,
}

impl FunctionRecord {
    fn parse(raw: &[u8; 6]) -> Self {
        FunctionRecord {
            query_base: raw[0] as u16,
            cmd_base: raw[1] as u16,
            ctrl_base: raw[2] as u16,
            data_base: raw[3] as u16,
            intr_sources: raw[4] & 0x07,
            version: (raw[4] >> 5) & 0x03,
            number: raw[5],
        }
    }
}

/// The subset of discovered functions the flasher cares about.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceMap {
    pub device_control: Option<FunctionRecord>,
    pub flash: Option<FunctionRecord>,
    pub recovery: Option<FunctionRecord>,
}

impl DeviceMap {
    /// Neither the application nor the normal bootloader responded, but the
    /// microbootloader did.
    pub fn in_recovery_mode(&self) -> bool {
        (self.device_control.is_none() || self.flash.is_none()) && self.recovery.is_some()
    }
}

/// Walk the function descriptor table from the top of page 0 downwards.
/// A zero function number terminates the table.
pub fn scan(connection: &mut Connection) -> Result<DeviceMap, ConnectionError> {
    let mut map = DeviceMap::default();

    let mut addr = PDT_START;
    while addr > PDT_END {
        let mut raw = [0u8; 6];
        connection.read(addr, &mut raw)?;

        if raw[5] == 0 {
            break;
        }
        let record = FunctionRecord::parse(&raw);
        debug!(
            "found F{:02x} v{} at {:#06x} (query {:#04x}, ctrl {:#04x}, data {:#04x})",
            record.number, record.version, addr, record.query_base, record.ctrl_base, record.data_base
        );

        match record.number {
            DEVICE_CONTROL_FN => map.device_control = Some(record),
            FLASH_FN => map.flash = Some(record),
            RECOVERY_FN => map.recovery = Some(record),
            other => debug!("ignoring F{:02x}", other),
        }

        addr -= PDT_ENTRY_SIZE;
    }

    if map.device_control.is_none() && map.flash.is_none() && map.recovery.is_none() {
        warn!("descriptor table scan found no usable function");
    }

    Ok(map)
}

/// Fetch the record for a function the flasher cannot work without.
pub(crate) fn require(
    record: Option<FunctionRecord>,
    name: &'static str,
) -> Result<FunctionRecord, Error> {
    record.ok_or(Error::MissingFunction(name))
}
