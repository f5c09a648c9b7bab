//! Microbootloader recovery
//!
//! A controller whose bootloader partition is gone publishes only the
//! recovery function. That agent knows three things: erase everything,
//! accept sixteen-byte chunks, and reset. Completion is not signalled;
//! the protocol runs on fixed settle times and an error register.

use std::thread;
use std::time::Duration;

use log::info;

use crate::{connection::discovery, error::Error, flasher::Flasher};

const F35_CHUNK_SIZE: usize = 16;
const F35_ERROR_MASK: u8 = 0x7f;

const F35_CHUNK_NUMBER_OFFSET: u16 = 0;
const F35_CHUNK_DATA_OFFSET: u16 = 2;
const F35_CHUNK_COMMAND_OFFSET: u16 = 18;

const F35_CMD_WRITE_CHUNK: u8 = 0x02;
const F35_CMD_ERASE_ALL: u8 = 0x03;
const F35_CMD_RESET: u8 = 0x10;

const F35_ERASE_WAIT: Duration = Duration::from_secs(3);
const F35_RESET_WAIT: Duration = Duration::from_millis(250);

impl Flasher {
    /// Reflash an otherwise bricked controller through the microbootloader.
    ///
    /// `image` is the raw recovery payload, not one of the packaged firmware
    /// formats. Only available while [`in_recovery_mode`] reports true.
    ///
    /// [`in_recovery_mode`]: Flasher::in_recovery_mode
    pub fn recover(&mut self, image: &[u8]) -> Result<(), Error> {
        let _guard = super::SESSION_LOCK
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if !self.map.in_recovery_mode() {
            return Err(Error::NotInRecoveryMode);
        }
        let recovery_fn = discovery::require(self.map.recovery, "recovery")?;

        self.power.stay_awake();
        thread::sleep(super::MODE_SETTLE);
        self.connection.enable_attention();

        let result = self.recover_locked(recovery_fn.ctrl_base, recovery_fn.data_base, image);
        let teardown = self.recovery_teardown();
        self.power.relax();

        result?;
        teardown
    }

    fn recover_locked(&mut self, ctrl: u16, data: u16, image: &[u8]) -> Result<(), Error> {
        info!("starting microbootloader recovery ({} bytes)", image.len());

        self.connection
            .write_u8(ctrl + F35_CHUNK_COMMAND_OFFSET, F35_CMD_ERASE_ALL)?;
        thread::sleep(F35_ERASE_WAIT);
        self.check_recovery_status(data)?;

        self.connection
            .write(ctrl + F35_CHUNK_NUMBER_OFFSET, &[0, 0])?;
        let frames = chunk_frames(image);
        for frame in &frames {
            self.connection.write(ctrl + F35_CHUNK_DATA_OFFSET, frame)?;
        }
        self.check_recovery_status(data)?;
        info!("recovery image written ({} chunks)", frames.len());

        self.connection
            .write_u8(ctrl + F35_CHUNK_COMMAND_OFFSET, F35_CMD_RESET)?;
        thread::sleep(F35_RESET_WAIT);
        Ok(())
    }

    fn check_recovery_status(&mut self, data: u16) -> Result<(), Error> {
        let status = self.connection.read_u8(data)? & F35_ERROR_MASK;
        if status != 0 {
            return Err(Error::RecoveryStatus(status));
        }
        Ok(())
    }

    fn recovery_teardown(&mut self) -> Result<(), Error> {
        self.connection.disable_attention();
        thread::sleep(super::RESET_SETTLE);
        self.refresh()?;
        Ok(())
    }
}

/// Chunks are always full sized, the tail zero padded. Each frame carries
/// the write command in its trailing byte so a single bus write both loads
/// the chunk and triggers the transfer.
fn chunk_frames(image: &[u8]) -> Vec<[u8; F35_CHUNK_SIZE + 1]> {
    image
        .chunks(F35_CHUNK_SIZE)
        .map(|chunk| {
            let mut frame = [0u8; F35_CHUNK_SIZE + 1];
            frame[..chunk.len()].copy_from_slice(chunk);
            frame[F35_CHUNK_SIZE] = F35_CMD_WRITE_CHUNK;
            frame
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_padded_and_carry_the_write_command() {
        let frames = chunk_frames(&[0xaa; 20]);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..16], &[0xaa; 16]);
        assert_eq!(frames[0][16], F35_CMD_WRITE_CHUNK);
        assert_eq!(&frames[1][..4], &[0xaa; 4]);
        assert_eq!(&frames[1][4..16], &[0u8; 12]);
        assert_eq!(frames[1][16], F35_CMD_WRITE_CHUNK);
    }

    #[test]
    fn empty_image_produces_no_frames() {
        assert!(chunk_frames(&[]).is_empty());
    }
}
