//! Generic flash command vocabulary
//!
//! Each bootloader generation encodes these differently on the wire; the
//! version adapters in [`targets`](crate::targets) own that mapping.

use std::time::Duration;

use strum::Display;

const ENTER_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_TIMEOUT: Duration = Duration::from_secs(5);

/// A configuration partition selectable for read/write/erase.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum ConfigArea {
    Ui,
    Permanent,
    Bootloader,
    Display,
    Flash,
}

impl ConfigArea {
    /// Area selector for the v5/v6 block-number register (bits 5..7 of the
    /// second byte).
    pub(crate) fn selector(self) -> u8 {
        match self {
            ConfigArea::Ui => 0,
            ConfigArea::Permanent => 1,
            ConfigArea::Bootloader => 2,
            ConfigArea::Display => 3,
            ConfigArea::Flash => 4,
        }
    }
}

/// Version-independent flash operations.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlashCommand {
    Idle,
    EnterBootloader,
    WriteFirmware,
    WriteConfig(ConfigArea),
    WriteLockdown,
    WriteGuestCode,
    ReadConfig(ConfigArea),
    EraseAll,
    EraseFirmware,
    EraseConfig(ConfigArea),
    EraseGuestCode,
}

impl FlashCommand {
    /// Bound on the idle-wait that follows this command. Mode entry completes
    /// quickly, erases are the slowest operations the controller performs.
    pub fn timeout(&self) -> Duration {
        match self {
            FlashCommand::EnterBootloader => ENTER_TIMEOUT,
            FlashCommand::EraseAll
            | FlashCommand::EraseFirmware
            | FlashCommand::EraseConfig(_)
            | FlashCommand::EraseGuestCode => ERASE_TIMEOUT,
            _ => WRITE_TIMEOUT,
        }
    }

    /// Commands that unlock flash and therefore carry the bootloader id as
    /// their payload on v5/v6.
    pub(crate) fn needs_bootloader_id(&self) -> bool {
        matches!(
            self,
            FlashCommand::EnterBootloader
                | FlashCommand::EraseAll
                | FlashCommand::EraseFirmware
                | FlashCommand::EraseConfig(_)
                | FlashCommand::EraseGuestCode
        )
    }

    /// Configuration area targeted by this command, if any.
    pub(crate) fn config_area(&self) -> Option<ConfigArea> {
        match self {
            FlashCommand::WriteConfig(area)
            | FlashCommand::ReadConfig(area)
            | FlashCommand::EraseConfig(area) => Some(*area),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_commands_get_the_long_timeout() {
        assert_eq!(FlashCommand::EraseAll.timeout(), ERASE_TIMEOUT);
        assert_eq!(
            FlashCommand::EraseConfig(ConfigArea::Display).timeout(),
            ERASE_TIMEOUT
        );
        assert_eq!(FlashCommand::EnterBootloader.timeout(), ENTER_TIMEOUT);
        assert_eq!(FlashCommand::WriteFirmware.timeout(), WRITE_TIMEOUT);
    }
}
