//! Reflashing library for RMI-style touch controllers
//!
//! The host supplies register-level bus access and forwards the attention
//! interrupt; [`Flasher`] does the rest: firmware image parsing, bootloader
//! discovery and version handling, the update decision, the block transfers
//! and microbootloader recovery for bricked parts.

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod partition;
pub mod targets;

pub use command::{ConfigArea, FlashCommand};
pub use connection::{attention_pair, AttentionSignal, AttentionSlot, NoopPower, PowerHold, RegisterIo};
pub use error::Error;
pub use flasher::{FlashArea, FlashOutcome, Flasher, UpdateOptions};
pub use image_format::FirmwareImage;
pub use targets::BootloaderVersion;
