//! Flash session orchestration
//!
//! A [`Flasher`] owns the connection to one controller and runs complete
//! update sessions: parse and gate the image, decide whether anything needs
//! flashing, enter programming mode, move the blocks and bring the device
//! back up. Every public operation is bracketed the same way regardless of
//! how it ends: attention routing is restored, the device is reset and the
//! descriptor table is walked again.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    command::{ConfigArea, FlashCommand},
    connection::{
        discovery::{self, DeviceMap},
        AttentionSlot, Connection, PowerHold, RegisterIo,
    },
    error::{Error, ParseError},
    image_format::{FirmwareImage, ImageKind},
    partition,
    targets::{
        BootloaderVersion, DeviceProfile, FlashProperties, ProtocolAdapter, StatusSnapshot,
    },
};

mod recovery;

/// One flash session at a time, process-wide. The controller is a shared
/// physical resource even when several handles exist.
static SESSION_LOCK: Mutex<()> = Mutex::new(());

const DEVICE_RESET: u8 = 0x01;
const NO_SLEEP: u8 = 1 << 2;
const SLEEP_MODE_MASK: u8 = 0x03;
const BUILD_ID_OFFSET: u16 = 18;

const RESET_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_SETTLE: Duration = Duration::from_millis(100);
const MODE_SETTLE: Duration = Duration::from_millis(20);

/// Knobs for [`Flasher::reflash`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Flash the firmware even when the device looks up to date, and allow
    /// recreating the partition table on v7 devices.
    pub force_update: bool,
    /// Write the lockdown area before flashing (v5/v6 only, and only when
    /// the device is still unlocked).
    pub write_lockdown: bool,
}

/// What a reflash session decided to rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashArea {
    Firmware,
    Config,
}

/// Result of a completed [`Flasher::reflash`] session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashOutcome {
    Updated(FlashArea),
    UpToDate,
}

/// A handle on one touch controller, ready to run flash sessions.
pub struct Flasher {
    connection: Connection,
    power: Box<dyn PowerHold + Send>,
    map: DeviceMap,
    profile: Option<DeviceProfile>,
    adapter: Option<Box<dyn ProtocolAdapter + Send + Sync>>,
}

impl Flasher {
    /// Probe the device behind `transport` and query its bootloader.
    ///
    /// Succeeds even when the device is running the microbootloader; in that
    /// state only [`recover`](Flasher::recover) is available.
    pub fn connect(
        transport: impl RegisterIo + Send + 'static,
        attention: AttentionSlot,
        power: impl PowerHold + Send + 'static,
    ) -> Result<Self, Error> {
        let connection = Connection::new(transport, attention);
        let mut flasher = Flasher {
            connection,
            power: Box::new(power),
            map: DeviceMap::default(),
            profile: None,
            adapter: None,
        };

        if flasher.refresh()?.is_none() {
            warn!("device is running the microbootloader, flash functions unavailable");
        }
        Ok(flasher)
    }

    pub fn in_recovery_mode(&self) -> bool {
        self.map.in_recovery_mode()
    }

    pub fn bootloader_version(&self) -> Option<BootloaderVersion> {
        self.profile.as_ref().map(|profile| profile.version)
    }

    /// Device profile from the most recent query pass, absent while the
    /// device is running the microbootloader.
    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    /// Device configuration id, as read from the flash function's control
    /// registers on the last query pass.
    pub fn config_id(&self) -> Option<&[u8]> {
        self.profile.as_ref().map(|profile| profile.config_id.as_slice())
    }

    pub fn build_id(&self) -> Option<u32> {
        self.profile.as_ref().map(|profile| profile.build_id)
    }

    /// Flash a firmware image, deciding first whether the device needs it.
    ///
    /// Returns [`FlashOutcome::UpToDate`] without touching flash when the
    /// image is no newer than what the device runs.
    pub fn reflash(&mut self, image: &[u8], options: UpdateOptions) -> Result<FlashOutcome, Error> {
        self.session(|flasher| flasher.reflash_locked(image, options))
    }

    /// Write the lockdown area of an image. v5/v6 only; a no-op on devices
    /// that have already been locked down.
    pub fn write_lockdown(&mut self, image: &[u8]) -> Result<(), Error> {
        self.session(|flasher| flasher.write_lockdown_locked(image))
    }

    /// Write one configuration area out of an image, leaving the firmware
    /// alone.
    pub fn write_config(&mut self, image: &[u8], area: ConfigArea) -> Result<(), Error> {
        self.session(|flasher| flasher.write_config_locked(image, area))
    }

    /// Read back a configuration area from the device.
    pub fn read_config(&mut self, area: ConfigArea) -> Result<Vec<u8>, Error> {
        self.session(|flasher| flasher.read_config_locked(area))
    }

    /// Write the guest code area of an image.
    pub fn write_guest_code(&mut self, image: &[u8]) -> Result<(), Error> {
        self.session(|flasher| flasher.write_guest_code_locked(image))
    }

    /// Erase the application firmware, leaving the bootloader in charge until
    /// something new is flashed.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.session(|flasher| {
            let mut profile = flasher.require_profile()?;
            flasher.enter_flash_prog(&mut profile)?;
            flasher.erase_main(&profile)
        })
    }

    /// Run `op` under the session bracket: take the process-wide lock, keep
    /// the host awake, route attention to us, and always tear down.
    fn session<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let _guard = SESSION_LOCK.lock().unwrap_or_else(|err| err.into_inner());
        if self.map.in_recovery_mode() {
            return Err(Error::InRecoveryMode);
        }

        self.power.stay_awake();
        self.connection.enable_attention();

        // Another handle may have flashed the device since our last look.
        let result = match self.refresh() {
            Ok(_) => op(self),
            Err(err) => Err(err),
        };
        let teardown = self.teardown();
        self.power.relax();

        let value = result?;
        teardown?;
        Ok(value)
    }

    fn require_profile(&self) -> Result<DeviceProfile, Error> {
        self.profile.clone().ok_or(Error::InRecoveryMode)
    }

    /// Re-walk the descriptor table and re-query the bootloader. Returns
    /// `None` when only the microbootloader answered.
    fn refresh(&mut self) -> Result<Option<DeviceProfile>, Error> {
        self.map = discovery::scan(&mut self.connection)?;
        if self.map.in_recovery_mode() {
            self.profile = None;
            self.adapter = None;
            return Ok(None);
        }

        let control_fn = discovery::require(self.map.device_control, "device control")?;
        let flash_fn = discovery::require(self.map.flash, "flash")?;
        let version = BootloaderVersion::from_function_version(flash_fn.version)?;
        let adapter = version.adapter();

        let mut profile = DeviceProfile::new(version, control_fn, flash_fn);
        adapter.read_queries(&mut self.connection, &mut profile)?;

        let mut config_id = vec![0u8; profile.config_id_size()];
        self.connection.read(profile.flash_fn.ctrl_base, &mut config_id)?;
        profile.config_id = config_id;

        let mut build = [0u8; 3];
        self.connection
            .read(profile.control_fn.query_base + BUILD_ID_OFFSET, &mut build)?;
        profile.build_id = u32::from_le_bytes([build[0], build[1], build[2], 0]);

        debug!(
            "bootloader v{}, build id {:#010x}, config id {:02x?}",
            profile.version as u8,
            profile.build_id,
            profile.config_id
        );

        self.adapter = Some(adapter);
        self.profile = Some(profile.clone());
        Ok(Some(profile))
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.connection.disable_attention();
        if let Some(profile) = self.profile.clone() {
            self.reset_device(&profile)?;
        }
        self.refresh()?;
        Ok(())
    }

    fn reflash_locked(
        &mut self,
        data: &[u8],
        options: UpdateOptions,
    ) -> Result<FlashOutcome, Error> {
        let image = FirmwareImage::parse(data.to_vec())?;
        let mut profile = self.require_profile()?;

        info!(
            "starting reflash on bootloader v{} (force {})",
            profile.version as u8, options.force_update
        );

        // TDAT images carry neither a bootloader version marker nor a
        // partition table, so they skip both gates.
        let mut new_table = false;
        if image.kind() != ImageKind::Tdat {
            if image.metadata.bootloader_version != profile.version as u8 {
                return Err(Error::VersionMismatch {
                    device: profile.version as u8,
                    image: image.metadata.bootloader_version,
                });
            }

            if profile.version >= BootloaderVersion::V7 {
                if image.metadata.fl_config.is_empty() {
                    return Err(Error::Parse(ParseError::MissingFlashConfig));
                }
                let raw = image.block(image.metadata.fl_config);
                let (_, addresses) = partition::parse_partition_table(raw, profile.partitions)?;
                new_table = partition::tables_differ(
                    &profile.addresses,
                    &addresses,
                    profile.properties,
                    profile.has_guest_code,
                );
                if new_table && !options.force_update {
                    return Err(Error::PartitionTableMismatch);
                }
            }
        }

        let status = self.read_status(&profile)?;
        if status.in_bootloader {
            info!("device is already in bootloader mode");
            // The edge that got it there is stale.
            self.connection.clear_attention();
        }

        if options.write_lockdown
            && profile.version <= BootloaderVersion::V6
            && !image.metadata.lockdown.is_empty()
        {
            if let Err(err) = self.do_lockdown(&mut profile, &image) {
                warn!("lockdown failed, continuing with the update: {err}");
            }
            self.reset_device(&profile)?;
            profile = self.refresh()?.ok_or(Error::InRecoveryMode)?;
        }

        let image_config = if image.metadata.ui_config.is_empty() {
            &[][..]
        } else {
            image.block(image.metadata.ui_config)
        };
        let id_len = profile.config_id_size().min(image_config.len());
        let area = decide(
            options.force_update,
            status.in_bootloader,
            profile.build_id,
            image
                .metadata
                .contains_firmware_id
                .then_some(image.metadata.firmware_id),
            &profile.config_id,
            &image_config[..id_len],
        );

        let Some(area) = area else {
            info!("device is up to date");
            return Ok(FlashOutcome::UpToDate);
        };

        self.enter_flash_prog(&mut profile)?;

        match area {
            FlashArea::Firmware => self.do_reflash(&mut profile, &image, new_table)?,
            FlashArea::Config => self.do_update_config(&mut profile, &image)?,
        }

        info!("reflash finished");
        Ok(FlashOutcome::Updated(area))
    }

    /// Full firmware update: gate sizes, erase, optionally recreate the
    /// partition table, then write every area the image carries.
    fn do_reflash(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
        new_table: bool,
    ) -> Result<(), Error> {
        let meta = image.metadata.clone();
        let firmware = image.block(meta.ui_firmware);
        let ui_config = image.block(meta.ui_config);

        if !new_table {
            area_blocks(
                profile.block_size,
                "firmware",
                firmware.len(),
                profile.block_counts.ui_firmware,
            )?;
            area_blocks(
                profile.block_size,
                "ui configuration",
                ui_config.len(),
                profile.block_counts.ui_config,
            )?;
            if profile.properties.contains(FlashProperties::HAS_DISP_CONFIG)
                && !meta.dp_config.is_empty()
            {
                area_blocks(
                    profile.block_size,
                    "display configuration",
                    meta.dp_config.len,
                    profile.block_counts.dp_config,
                )?;
            }
            if profile.has_guest_code && !meta.guest_code.is_empty() {
                area_blocks(
                    profile.block_size,
                    "guest code",
                    meta.guest_code.len,
                    profile.block_counts.guest_code,
                )?;
            }
        } else if profile.version >= BootloaderVersion::V7 {
            area_blocks(
                profile.block_size,
                "bootloader configuration",
                meta.bl_config.len,
                profile.block_counts.bl_config,
            )?;
        }

        self.erase_flash_areas(profile, image, new_table)?;

        if profile.version == BootloaderVersion::V7 && new_table {
            self.write_partition_table_v7(profile, image)?;
        } else if profile.version == BootloaderVersion::V8 {
            self.write_partition_table_v8(profile, image)?;
        }

        let blocks = count_blocks(profile.block_size, firmware.len());
        self.write_area(profile, firmware, blocks, FlashCommand::WriteFirmware)?;
        info!("firmware written ({blocks} blocks)");

        let blocks = count_blocks(profile.block_size, ui_config.len());
        self.write_area(
            profile,
            ui_config,
            blocks,
            FlashCommand::WriteConfig(ConfigArea::Ui),
        )?;
        info!("ui configuration written ({blocks} blocks)");

        if profile.properties.contains(FlashProperties::HAS_DISP_CONFIG)
            && !meta.dp_config.is_empty()
        {
            let data = image.block(meta.dp_config);
            let blocks = count_blocks(profile.block_size, data.len());
            self.write_area(
                profile,
                data,
                blocks,
                FlashCommand::WriteConfig(ConfigArea::Display),
            )?;
            info!("display configuration written ({blocks} blocks)");
        }

        if new_table && profile.has_guest_code && !meta.guest_code.is_empty() {
            let data = image.block(meta.guest_code);
            let blocks = count_blocks(profile.block_size, data.len());
            self.write_area(profile, data, blocks, FlashCommand::WriteGuestCode)?;
            info!("guest code written ({blocks} blocks)");
        }

        Ok(())
    }

    /// Configuration-only update.
    fn do_update_config(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
    ) -> Result<(), Error> {
        let data = image.block(image.metadata.ui_config);
        let blocks = area_blocks(
            profile.block_size,
            "ui configuration",
            data.len(),
            profile.block_counts.ui_config,
        )?;
        self.command_and_wait(profile, FlashCommand::EraseConfig(ConfigArea::Ui))?;
        self.write_area(
            profile,
            data,
            blocks,
            FlashCommand::WriteConfig(ConfigArea::Ui),
        )?;
        info!("ui configuration written ({blocks} blocks)");
        Ok(())
    }

    fn erase_flash_areas(
        &mut self,
        profile: &DeviceProfile,
        image: &FirmwareImage,
        new_table: bool,
    ) -> Result<(), Error> {
        info!("erasing flash");
        self.erase_main(profile)?;
        // On v8 the application-partition erase already took everything.
        if profile.version == BootloaderVersion::V8 {
            return Ok(());
        }

        if profile.properties.contains(FlashProperties::HAS_DISP_CONFIG)
            && image.metadata.contains_disp_config
        {
            self.command_and_wait(profile, FlashCommand::EraseConfig(ConfigArea::Display))?;
        }
        // Guest code survives unless the partition layout is being redone.
        if new_table && profile.has_guest_code {
            self.command_and_wait(profile, FlashCommand::EraseGuestCode)?;
        }
        Ok(())
    }

    /// The v7 bootloader has no combined erase; core code and core config are
    /// erased separately.
    fn erase_main(&mut self, profile: &DeviceProfile) -> Result<(), Error> {
        if profile.version == BootloaderVersion::V7 {
            self.command_and_wait(profile, FlashCommand::EraseFirmware)?;
            self.command_and_wait(profile, FlashCommand::EraseConfig(ConfigArea::Ui))
        } else {
            self.command_and_wait(profile, FlashCommand::EraseAll)
        }
    }

    /// Recreate the v7 partition table. The bootloader configuration has to
    /// be carried across the flash-config rewrite by hand: it is read out
    /// first, the flash-config partition is rewritten from the image, and the
    /// saved blocks are written back afterwards.
    fn write_partition_table_v7(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
    ) -> Result<(), Error> {
        info!("recreating the partition table");
        let device_blocks = profile.block_counts.bl_config;
        let saved = self.read_area(
            profile,
            device_blocks,
            FlashCommand::ReadConfig(ConfigArea::Bootloader),
        )?;

        self.command_and_wait(profile, FlashCommand::EraseConfig(ConfigArea::Bootloader))?;
        self.write_flash_configuration(profile, image)?;

        // The restored length follows the image's bootloader-config area,
        // capped at what was actually read back.
        let blocks =
            count_blocks(profile.block_size, image.metadata.bl_config.len).min(device_blocks);
        self.write_area(
            profile,
            &saved,
            blocks,
            FlashCommand::WriteConfig(ConfigArea::Bootloader),
        )?;
        Ok(())
    }

    /// On v8 the partition table is recreated by rewriting the flash-config
    /// partition from the image; the bootloader rebuilds the layout on the
    /// following reset.
    fn write_partition_table_v8(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
    ) -> Result<(), Error> {
        // TDAT images carry no flash configuration.
        if image.metadata.fl_config.is_empty() {
            return Ok(());
        }
        info!("writing the partition table");
        let data = image.block(image.metadata.fl_config);
        let blocks = area_blocks(
            profile.block_size,
            "flash configuration",
            data.len(),
            profile.block_counts.fl_config,
        )?;
        self.write_area(
            profile,
            data,
            blocks,
            FlashCommand::WriteConfig(ConfigArea::Flash),
        )?;
        self.reset_device(profile)?;
        *profile = self.refresh()?.ok_or(Error::InRecoveryMode)?;
        self.enter_flash_prog(profile)?;
        Ok(())
    }

    fn write_flash_configuration(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
    ) -> Result<(), Error> {
        let data = image.block(image.metadata.fl_config);
        let blocks = area_blocks(
            profile.block_size,
            "flash configuration",
            data.len(),
            profile.block_counts.fl_config,
        )?;
        self.command_and_wait(profile, FlashCommand::EraseConfig(ConfigArea::Flash))?;
        self.write_area(
            profile,
            data,
            blocks,
            FlashCommand::WriteConfig(ConfigArea::Flash),
        )?;
        self.reset_device(profile)?;
        *profile = self.refresh()?.ok_or(Error::InRecoveryMode)?;
        self.enter_flash_prog(profile)?;
        Ok(())
    }

    fn write_lockdown_locked(&mut self, data: &[u8]) -> Result<(), Error> {
        let image = FirmwareImage::parse(data.to_vec())?;
        let mut profile = self.require_profile()?;

        if profile.version > BootloaderVersion::V6 {
            return Err(Error::UnsupportedCommand(FlashCommand::WriteLockdown));
        }
        if image.metadata.lockdown.is_empty() {
            return Err(Error::MissingImageArea("lockdown"));
        }
        self.do_lockdown(&mut profile, &image)
    }

    /// Write the lockdown blocks. Lockdown is one-shot hardware: once the
    /// unlocked property bit is clear the operation quietly succeeds without
    /// touching flash.
    fn do_lockdown(
        &mut self,
        profile: &mut DeviceProfile,
        image: &FirmwareImage,
    ) -> Result<(), Error> {
        self.enter_flash_prog(profile)?;

        if !profile.properties.contains(FlashProperties::UNLOCKED) {
            info!("device is already locked down");
            return Ok(());
        }

        let data = image.block(image.metadata.lockdown);
        let blocks = count_blocks(profile.block_size, data.len());
        self.write_area(profile, data, blocks, FlashCommand::WriteLockdown)?;
        info!("lockdown written ({blocks} blocks)");
        Ok(())
    }

    fn write_config_locked(&mut self, data: &[u8], area: ConfigArea) -> Result<(), Error> {
        let image = FirmwareImage::parse(data.to_vec())?;
        let mut profile = self.require_profile()?;

        let (name, block) = match area {
            ConfigArea::Ui => {
                // A configuration only fits the firmware it was built for.
                if image.metadata.contains_firmware_id
                    && image.metadata.firmware_id != profile.build_id
                {
                    return Err(Error::FirmwareIdMismatch {
                        device: profile.build_id,
                        image: image.metadata.firmware_id,
                    });
                }
                ("ui configuration", image.metadata.ui_config)
            }
            ConfigArea::Display => {
                if !profile.properties.contains(FlashProperties::HAS_DISP_CONFIG) {
                    return Err(Error::UnsupportedConfigArea(area));
                }
                ("display configuration", image.metadata.dp_config)
            }
            _ => return Err(Error::UnsupportedConfigArea(area)),
        };
        if block.is_empty() {
            return Err(Error::MissingImageArea(name));
        }

        self.enter_flash_prog(&mut profile)?;

        let device_blocks = match area {
            ConfigArea::Ui => profile.block_counts.ui_config,
            _ => profile.block_counts.dp_config,
        };
        let data = image.block(block);
        let blocks = area_blocks(profile.block_size, name, data.len(), device_blocks)?;
        self.command_and_wait(&profile, FlashCommand::EraseConfig(area))?;
        self.write_area(&profile, data, blocks, FlashCommand::WriteConfig(area))?;
        info!("{name} written ({blocks} blocks)");
        Ok(())
    }

    fn read_config_locked(&mut self, area: ConfigArea) -> Result<Vec<u8>, Error> {
        let mut profile = self.require_profile()?;
        self.enter_flash_prog(&mut profile)?;

        let blocks = match area {
            ConfigArea::Ui => profile.block_counts.ui_config,
            ConfigArea::Display
                if profile.properties.contains(FlashProperties::HAS_DISP_CONFIG) =>
            {
                profile.block_counts.dp_config
            }
            ConfigArea::Permanent
                if profile.properties.contains(FlashProperties::HAS_PM_CONFIG) =>
            {
                profile.block_counts.pm_config
            }
            ConfigArea::Bootloader
                if profile.properties.contains(FlashProperties::HAS_BL_CONFIG) =>
            {
                profile.block_counts.bl_config
            }
            ConfigArea::Flash if profile.version >= BootloaderVersion::V7 => {
                profile.block_counts.fl_config
            }
            _ => return Err(Error::UnsupportedConfigArea(area)),
        };

        self.read_area(&profile, blocks, FlashCommand::ReadConfig(area))
    }

    fn write_guest_code_locked(&mut self, data: &[u8]) -> Result<(), Error> {
        let image = FirmwareImage::parse(data.to_vec())?;
        let mut profile = self.require_profile()?;

        if !profile.has_guest_code {
            return Err(Error::UnsupportedCommand(FlashCommand::WriteGuestCode));
        }
        if image.metadata.guest_code.is_empty() {
            return Err(Error::MissingImageArea("guest code"));
        }

        self.enter_flash_prog(&mut profile)?;

        let data = image.block(image.metadata.guest_code);
        let blocks = area_blocks(
            profile.block_size,
            "guest code",
            data.len(),
            profile.block_counts.guest_code,
        )?;
        self.command_and_wait(&profile, FlashCommand::EraseGuestCode)?;
        self.write_area(&profile, data, blocks, FlashCommand::WriteGuestCode)?;
        info!("guest code written ({blocks} blocks)");
        Ok(())
    }

    /// Put the bootloader in charge. The bootloader publishes its own
    /// descriptor table, so entry is followed by a re-scan and a fresh query
    /// pass, and sleep is held off for the rest of the session.
    fn enter_flash_prog(&mut self, profile: &mut DeviceProfile) -> Result<(), Error> {
        let status = self.read_status(profile)?;
        if status.in_bootloader {
            return Ok(());
        }

        self.command_and_wait(profile, FlashCommand::EnterBootloader)?;

        let status = self.read_status(profile)?;
        if !status.in_bootloader {
            return Err(Error::BootloaderNotEntered);
        }
        info!("entered flash programming mode");

        *profile = self.refresh()?.ok_or(Error::InRecoveryMode)?;

        let ctrl = self.connection.read_u8(profile.control_fn.ctrl_base)?;
        self.connection.write_u8(
            profile.control_fn.ctrl_base,
            (ctrl | NO_SLEEP) & !SLEEP_MODE_MASK,
        )?;
        thread::sleep(MODE_SETTLE);
        Ok(())
    }

    /// Reset through the device-control function. With attention routed to
    /// us the reset edge is waited out twice; the interrupt fires on both
    /// sides of the mode change.
    fn reset_device(&mut self, profile: &DeviceProfile) -> Result<(), Error> {
        debug!("resetting device");
        self.connection
            .write_u8(profile.control_fn.cmd_base, DEVICE_RESET)?;

        if self.connection.attention_enabled() {
            let adapter = self.adapter.as_deref().ok_or(Error::InRecoveryMode)?;
            for _ in 0..2 {
                adapter.wait_for_idle(
                    &mut self.connection,
                    profile,
                    RESET_TIMEOUT,
                    FlashCommand::Idle,
                )?;
            }
        } else {
            thread::sleep(RESET_SETTLE);
        }
        Ok(())
    }

    fn read_status(&mut self, profile: &DeviceProfile) -> Result<StatusSnapshot, Error> {
        let adapter = self.adapter.as_deref().ok_or(Error::InRecoveryMode)?;
        adapter.read_status(&mut self.connection, profile)
    }

    fn command_and_wait(
        &mut self,
        profile: &DeviceProfile,
        cmd: FlashCommand,
    ) -> Result<(), Error> {
        let adapter = self.adapter.as_deref().ok_or(Error::InRecoveryMode)?;
        adapter.write_command(&mut self.connection, profile, cmd)?;
        adapter.wait_for_idle(&mut self.connection, profile, cmd.timeout(), cmd)?;
        Ok(())
    }

    fn write_area(
        &mut self,
        profile: &DeviceProfile,
        data: &[u8],
        blocks: u16,
        cmd: FlashCommand,
    ) -> Result<(), Error> {
        let adapter = self.adapter.as_deref().ok_or(Error::InRecoveryMode)?;
        adapter.write_blocks(&mut self.connection, profile, data, blocks, cmd)
    }

    fn read_area(
        &mut self,
        profile: &DeviceProfile,
        blocks: u16,
        cmd: FlashCommand,
    ) -> Result<Vec<u8>, Error> {
        let adapter = self.adapter.as_deref().ok_or(Error::InRecoveryMode)?;
        adapter.read_blocks(&mut self.connection, profile, blocks, cmd)
    }
}

/// Go/no-go decision for a reflash session.
///
/// Forced updates and devices stuck in bootloader mode always get firmware.
/// Otherwise a differing build id selects a firmware update, and with build
/// ids equal the configuration ids are compared bytewise: a strictly newer
/// image configuration selects a config-only update.
fn decide(
    force: bool,
    in_bootloader: bool,
    device_build_id: u32,
    image_firmware_id: Option<u32>,
    device_config_id: &[u8],
    image_config_id: &[u8],
) -> Option<FlashArea> {
    if force {
        return Some(FlashArea::Firmware);
    }
    if in_bootloader {
        debug!("device is in bootloader mode, updating regardless of version");
        return Some(FlashArea::Firmware);
    }

    let image_id = image_firmware_id?;
    if image_id != device_build_id {
        debug!(
            "build id {:#010x} on device, {:#010x} in image",
            device_build_id, image_id
        );
        return Some(FlashArea::Firmware);
    }

    for (device, image) in device_config_id.iter().zip(image_config_id) {
        if image > device {
            return Some(FlashArea::Config);
        }
        if image < device {
            return None;
        }
    }
    None
}

/// Image area length in device blocks. The device geometry is fixed, so the
/// area has to cover it exactly; anything else was built for a different
/// part.
fn area_blocks(
    block_size: u16,
    area: &'static str,
    len: usize,
    device_blocks: u16,
) -> Result<u16, Error> {
    let block_size = block_size.max(1) as usize;
    let image_blocks = len.div_ceil(block_size);
    if len % block_size != 0 || image_blocks != device_blocks as usize {
        return Err(Error::SizeMismatch {
            area,
            image_blocks,
            device_blocks,
        });
    }
    Ok(image_blocks as u16)
}

fn count_blocks(block_size: u16, len: usize) -> u16 {
    (len / block_size.max(1) as usize) as u16
}
