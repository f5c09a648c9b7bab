//! Library error types

use std::fmt::{Display, Formatter};
use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::{ConfigArea, FlashCommand};

/// All possible errors returned by dsxflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while talking to the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Supplied firmware image is not valid")]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error("Image {area} area is {image_blocks} blocks, device expects {device_blocks}")]
    #[diagnostic(
        code(dsxflash::size_mismatch),
        help("The image was built for a different controller variant")
    )]
    SizeMismatch {
        area: &'static str,
        image_blocks: usize,
        device_blocks: u16,
    },

    #[error("Device bootloader is v{device}, image was built for v{image}")]
    #[diagnostic(
        code(dsxflash::version_mismatch),
        help("Use an image matching the device's bootloader generation")
    )]
    VersionMismatch { device: u8, image: u8 },

    #[error("Image partition layout differs from the one on the device")]
    #[diagnostic(
        code(dsxflash::partition_table_mismatch),
        help("Recreating the partition table is destructive; retry with force_update set")
    )]
    PartitionTableMismatch,

    #[error("Unrecognized flash function version ({0})")]
    #[diagnostic(code(dsxflash::unknown_bootloader))]
    UnknownBootloaderVersion(u8),

    #[error("The device reported a flash error")]
    #[diagnostic(transparent)]
    DeviceStatus(#[from] StatusError),

    #[error("Device did not enter programming mode")]
    #[diagnostic(code(dsxflash::programming_mode))]
    BootloaderNotEntered,

    #[error("Recovery agent reported status {0:#04x}")]
    #[diagnostic(code(dsxflash::recovery_status))]
    RecoveryStatus(u8),

    #[error("Device does not expose the {0} function")]
    #[diagnostic(code(dsxflash::missing_function))]
    MissingFunction(&'static str),

    #[error("Device is in recovery mode; only microbootloader recovery is possible")]
    #[diagnostic(
        code(dsxflash::in_recovery),
        help("Run the recovery operation with a recovery image first")
    )]
    InRecoveryMode,

    #[error("Device is not in recovery mode")]
    #[diagnostic(code(dsxflash::not_in_recovery))]
    NotInRecoveryMode,

    #[error("The {0} configuration area is not supported by this bootloader")]
    #[diagnostic(code(dsxflash::unsupported_config_area))]
    UnsupportedConfigArea(ConfigArea),

    #[error("The {0} command is not supported by this bootloader")]
    #[diagnostic(code(dsxflash::unsupported_command))]
    UnsupportedCommand(FlashCommand),

    #[error("Image does not carry a {0} area")]
    #[diagnostic(code(dsxflash::missing_image_area))]
    MissingImageArea(&'static str),

    #[error("Image build id {image:#010x} does not match device build id {device:#010x}")]
    #[diagnostic(code(dsxflash::firmware_id_mismatch))]
    FirmwareIdMismatch { device: u32, image: u32 },

    #[error("Internal error")]
    InternalError,
}

/// Errors raised on the register bus or while waiting for a completion
/// interrupt.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("Timeout while waiting for {0}to complete")]
    #[diagnostic(
        code(dsxflash::timeout),
        help("Check the attention line wiring; completion is signalled by interrupt")
    )]
    Timeout(TimedOutCommand),
}

/// Raised by [`RegisterIo`](crate::connection::RegisterIo) implementations
/// when a bus transaction fails.
#[derive(Debug, Diagnostic, Error)]
#[error("Register {op} at {addr:#06x} failed")]
#[diagnostic(code(dsxflash::transport))]
pub struct TransportError {
    op: BusOp,
    addr: u16,
    #[source]
    source: io::Error,
}

impl TransportError {
    pub fn read(addr: u16, source: io::Error) -> Self {
        TransportError {
            op: BusOp::Read,
            addr,
            source,
        }
    }

    pub fn write(addr: u16, source: io::Error) -> Self {
        TransportError {
            op: BusOp::Write,
            addr,
            source,
        }
    }
}

#[derive(Clone, Copy, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BusOp {
    Read,
    Write,
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<FlashCommand>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<FlashCommand> for TimedOutCommand {
    fn from(cmd: FlashCommand) -> Self {
        TimedOutCommand { command: Some(cmd) }
    }
}

/// Flash controller status codes, as reported by the status register after a
/// command completes. The named values follow the v7/v8 code space; older
/// bootloaders share the low codes.
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashStatusCode {
    #[error("Success")]
    #[diagnostic(code(dsxflash::status::success))]
    Success = 0x00,

    #[error("Device not in bootloader mode")]
    #[diagnostic(code(dsxflash::status::not_in_bootloader))]
    DeviceNotInBootloader = 0x01,

    #[error("Invalid device configuration")]
    #[diagnostic(code(dsxflash::status::device_config))]
    InvalidDeviceConfig = 0x02,

    #[error("Invalid controller configuration")]
    #[diagnostic(code(dsxflash::status::controller_config))]
    InvalidControllerConfig = 0x03,

    #[error("Invalid programming key")]
    #[diagnostic(code(dsxflash::status::programming_key))]
    InvalidProgrammingKey = 0x04,

    #[error("Invalid bootloader code")]
    #[diagnostic(code(dsxflash::status::bootloader_code))]
    InvalidBootloaderCode = 0x05,

    #[error("Invalid UI firmware code")]
    #[diagnostic(code(dsxflash::status::ui_code))]
    InvalidUiCode = 0x06,

    #[error("Invalid UI configuration")]
    #[diagnostic(code(dsxflash::status::ui_config))]
    InvalidUiConfig = 0x07,

    #[error("Bad partition table")]
    #[diagnostic(code(dsxflash::status::partition_table))]
    BadPartitionTable = 0x08,

    #[error("Checksum failed")]
    #[diagnostic(code(dsxflash::status::checksum))]
    ChecksumFailed = 0x09,

    #[error("Flash hardware failure")]
    #[diagnostic(code(dsxflash::status::flash_hardware))]
    FlashHardwareFailure = 0x1f,

    #[default]
    #[error("Other")]
    #[diagnostic(code(dsxflash::status::other))]
    Other = 0xff,
}

impl From<u8> for FlashStatusCode {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A nonzero flash status reported by the device after a command
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command (status {raw:#04x})")]
pub struct StatusError {
    command: FlashCommand,
    raw: u8,
    #[source]
    #[diagnostic_source]
    kind: FlashStatusCode,
}

impl StatusError {
    pub fn new(command: FlashCommand, raw: u8) -> Self {
        StatusError {
            command,
            raw,
            kind: raw.into(),
        }
    }

    pub fn kind(&self) -> FlashStatusCode {
        self.kind
    }
}

/// Parse errors for firmware image buffers
#[derive(Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("Unrecognized image header version: {0:#04x}")]
    #[diagnostic(code(dsxflash::parse::unsupported_format))]
    UnsupportedFormat(u8),

    #[error("Image truncated: need {need} bytes, have {have}")]
    #[diagnostic(code(dsxflash::parse::truncated))]
    Truncated { need: usize, have: usize },

    #[error("Range {offset:#x}+{len:#x} exceeds the image size of {image_size:#x} bytes")]
    #[diagnostic(code(dsxflash::parse::overflow))]
    Overflow {
        offset: usize,
        len: usize,
        image_size: usize,
    },

    #[error("Record lengths do not span the image exactly")]
    #[diagnostic(code(dsxflash::parse::misaligned))]
    Misaligned,

    #[error("Image carries no flash configuration area")]
    #[diagnostic(code(dsxflash::parse::missing_flash_config))]
    MissingFlashConfig,
}

pub(crate) trait ResultExt {
    /// Mark a timeout error with the command that caused it
    fn for_command(self, command: FlashCommand) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: FlashCommand) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
