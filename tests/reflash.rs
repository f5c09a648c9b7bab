//! End-to-end reflash sessions against scripted controllers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use dsxflash::{
    attention_pair, error::TransportError, targets::PartitionId, AttentionSignal,
    BootloaderVersion, Error, FlashArea, FlashOutcome, Flasher, NoopPower, RegisterIo,
    UpdateOptions,
};

const IMAGE_AREA: usize = 0x100;

/// Scripted state of the emulated v6 controller. Register addresses follow
/// the descriptor table the mock publishes: F01 at query 0x70 / cmd 0x36 /
/// ctrl 0x30 / data 0x20, F34 v6 at query 0x50 / ctrl 0x10 / data 0x60.
#[derive(Default)]
struct DeviceState {
    in_bl: bool,
    locked: bool,
    erased: bool,
    ui_config_erased: bool,
    last_payload: Vec<u8>,
    fw_written: Vec<u8>,
    cfg_written: Vec<u8>,
    lockdown_written: Vec<u8>,
    build_id: u32,
    /// Build id the device reports once new firmware has landed.
    next_build_id: u32,
    config_id: [u8; 4],
    /// Shared log of which flasher issued each flash command.
    events: Option<Arc<Mutex<Vec<u8>>>>,
}

struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    attention: AttentionSignal,
    id: u8,
}

impl RegisterIo for MockDevice {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        let bytes: Vec<u8> = match addr {
            // Descriptor table: F01, F34 (layout revision 1 = bootloader v6),
            // then a terminator.
            0xe9 => vec![0x70, 0x36, 0x30, 0x20, 0x01, 0x01],
            0xe3 => vec![0x50, 0x00, 0x10, 0x60, 0x21, 0x34],
            // F34 queries.
            0x50 => vec![0x34, 0x12],
            0x51 => vec![if state.locked { 0x00 } else { 0x02 }],
            0x52 => vec![16, 0],
            0x53 => vec![4, 0, 2, 0],
            // F34 control: configuration id.
            0x10 => state.config_id.to_vec(),
            // F34 data: flash status.
            0x63 => vec![(state.in_bl as u8) << 7],
            // F01 query 18..: firmware build id.
            0x82 => state.build_id.to_le_bytes()[..3].to_vec(),
            _ => Vec::new(),
        };
        for (ii, byte) in buf.iter_mut().enumerate() {
            *byte = bytes.get(ii).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        match addr {
            // F34 payload window.
            0x61 => state.last_payload = bytes.to_vec(),
            // F34 command register: act on the opcode and raise attention.
            0x62 => {
                let opcode = bytes[0];
                if let Some(log) = &state.events {
                    log.lock().unwrap().push(self.id);
                }
                let payload = state.last_payload.clone();
                match opcode {
                    0x0f => state.in_bl = true,
                    0x03 => state.erased = true,
                    0x07 => state.ui_config_erased = true,
                    0x02 => {
                        state.fw_written.extend_from_slice(&payload);
                        if state.next_build_id != 0 {
                            state.build_id = state.next_build_id;
                        }
                    }
                    0x06 => state.cfg_written.extend_from_slice(&payload),
                    0x04 => {
                        state.lockdown_written.extend_from_slice(&payload);
                        if state.lockdown_written.len() >= 0x50 {
                            state.locked = true;
                        }
                    }
                    _ => {}
                }
                self.attention.post();
            }
            // F01 command register: reset leaves bootloader mode.
            0x36 => {
                if bytes[0] == 0x01 {
                    state.in_bl = false;
                    self.attention.post();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn connect(state: Arc<Mutex<DeviceState>>) -> Flasher {
    connect_as(state, 0)
}

fn connect_as(state: Arc<Mutex<DeviceState>>, id: u8) -> Flasher {
    let _ = env_logger::builder().is_test(true).try_init();
    let (signal, slot) = attention_pair();
    let device = MockDevice {
        state,
        attention: signal,
        id,
    };
    Flasher::connect(device, slot, NoopPower).unwrap()
}

fn device(build_id: u32, config_id: [u8; 4]) -> Arc<Mutex<DeviceState>> {
    Arc::new(Mutex::new(DeviceState {
        build_id,
        config_id,
        ..DeviceState::default()
    }))
}

/// Minimal legacy (header version 0x06) image carrying a firmware id.
fn legacy_image(firmware: &[u8], config: &[u8], firmware_id: u32) -> Vec<u8> {
    let mut data = vec![0u8; IMAGE_AREA + firmware.len() + config.len()];
    data[0x06] = 0x01;
    data[0x07] = 0x06;
    data[0x08..0x0c].copy_from_slice(&(firmware.len() as u32).to_le_bytes());
    data[0x0c..0x10].copy_from_slice(&(config.len() as u32).to_le_bytes());
    data[0x10..0x16].copy_from_slice(b"TM0000");
    data[0x50..0x54].copy_from_slice(&firmware_id.to_le_bytes());
    data[IMAGE_AREA..IMAGE_AREA + firmware.len()].copy_from_slice(firmware);
    data[IMAGE_AREA + firmware.len()..].copy_from_slice(config);
    data
}

#[test]
fn v6_firmware_update_end_to_end() {
    let firmware: Vec<u8> = (0..64).collect();
    let config: Vec<u8> = (64..96).collect();
    let image = legacy_image(&firmware, &config, 0x200);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));
    assert_eq!(flasher.bootloader_version(), Some(BootloaderVersion::V6));
    assert_eq!(flasher.config_id(), Some(&[1, 2, 3, 4][..]));
    assert_eq!(flasher.build_id(), Some(0x100));

    let profile = flasher.profile().expect("device profile");
    assert_eq!(profile.block_size, 16);
    assert_eq!(profile.block_counts.ui_firmware, 4);
    assert_eq!(profile.block_counts.ui_config, 2);

    let outcome = flasher.reflash(&image, UpdateOptions::default()).unwrap();
    assert_eq!(outcome, FlashOutcome::Updated(FlashArea::Firmware));

    let state = state.lock().unwrap();
    assert!(state.erased);
    assert_eq!(state.fw_written, firmware);
    assert_eq!(state.cfg_written, config);
    // Teardown resets the device out of bootloader mode.
    assert!(!state.in_bl);
}

#[test]
fn matching_image_is_skipped() {
    let firmware = vec![0u8; 64];
    let mut config = vec![0u8; 32];
    config[..4].copy_from_slice(&[1, 2, 3, 4]);
    let image = legacy_image(&firmware, &config, 0x100);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));

    let outcome = flasher.reflash(&image, UpdateOptions::default()).unwrap();
    assert_eq!(outcome, FlashOutcome::UpToDate);

    let state = state.lock().unwrap();
    assert!(!state.erased);
    assert!(state.fw_written.is_empty());
    assert!(state.cfg_written.is_empty());
}

#[test]
fn newer_configuration_updates_the_config_area_only() {
    let firmware = vec![0u8; 64];
    let mut config = vec![0u8; 32];
    config[..4].copy_from_slice(&[1, 2, 3, 5]);
    let image = legacy_image(&firmware, &config, 0x100);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));

    let outcome = flasher.reflash(&image, UpdateOptions::default()).unwrap();
    assert_eq!(outcome, FlashOutcome::Updated(FlashArea::Config));

    let state = state.lock().unwrap();
    assert!(!state.erased);
    assert!(state.ui_config_erased);
    assert!(state.fw_written.is_empty());
    assert_eq!(state.cfg_written, config);
}

#[test]
fn force_update_flashes_an_identical_image() {
    let firmware = vec![0u8; 64];
    let mut config = vec![0u8; 32];
    config[..4].copy_from_slice(&[1, 2, 3, 4]);
    let image = legacy_image(&firmware, &config, 0x100);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));

    let options = UpdateOptions {
        force_update: true,
        ..UpdateOptions::default()
    };
    let outcome = flasher.reflash(&image, options).unwrap();
    assert_eq!(outcome, FlashOutcome::Updated(FlashArea::Firmware));
    assert!(state.lock().unwrap().erased);
}

#[test]
fn misaligned_firmware_is_rejected_before_erase() {
    // 65 firmware bytes do not fill the 4x16-byte device area; the trailing
    // byte must fail the update, not get silently dropped.
    let firmware = vec![0u8; 65];
    let config = vec![0u8; 32];
    let image = legacy_image(&firmware, &config, 0x200);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));

    let err = flasher
        .reflash(&image, UpdateOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SizeMismatch {
            area: "firmware",
            image_blocks: 5,
            device_blocks: 4,
        }
    ));

    let state = state.lock().unwrap();
    assert!(!state.erased);
    assert!(state.fw_written.is_empty());
}

#[test]
fn lockdown_writes_once_then_becomes_a_noop() {
    let firmware = vec![0u8; 64];
    let config = vec![0u8; 32];
    let mut image = legacy_image(&firmware, &config, 0x100);
    image[0xb0..0x100].copy_from_slice(&[0x5a; 0x50]);

    let state = device(0x100, [1, 2, 3, 4]);
    let mut flasher = connect(Arc::clone(&state));

    flasher.write_lockdown(&image).unwrap();
    {
        let state = state.lock().unwrap();
        assert_eq!(state.lockdown_written, vec![0x5a; 0x50]);
        assert!(state.locked);
    }

    // The device now reports itself locked; a second attempt succeeds
    // without moving any blocks.
    flasher.write_lockdown(&image).unwrap();
    assert_eq!(state.lock().unwrap().lockdown_written.len(), 0x50);
}

#[test]
fn concurrent_sessions_serialize_against_one_device() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(Mutex::new(DeviceState {
        build_id: 0x100,
        next_build_id: 0x200,
        config_id: [1, 2, 3, 4],
        events: Some(Arc::clone(&events)),
        ..DeviceState::default()
    }));

    let handles: Vec<_> = (1..=2u8)
        .map(|id| {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let firmware = vec![0u8; 64];
                let mut config = vec![0u8; 32];
                config[..4].copy_from_slice(&[1, 2, 3, 4]);
                let image = legacy_image(&firmware, &config, 0x200);
                let mut flasher = connect_as(state, id);
                flasher.reflash(&image, UpdateOptions::default()).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    // Whichever session took the lock first did the flashing; the other
    // re-queried the device and found it already current.
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == FlashOutcome::Updated(FlashArea::Firmware))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == FlashOutcome::UpToDate)
            .count(),
        1
    );

    let state = state.lock().unwrap();
    assert_eq!(state.fw_written.len(), 64);

    // Every flash command came from the one session that did the work.
    let events = events.lock().unwrap();
    assert!(!events.is_empty());
    assert!(
        events.windows(2).all(|pair| pair[0] == pair[1]),
        "sessions interleaved: {events:?}"
    );
}

/// Scripted state of the emulated v7/v8 controller. Same F01 layout as the
/// v6 mock; F34 publishes layout revision 2 at query 0x50 / ctrl 0x10 /
/// data 0x60.
#[derive(Default)]
struct V7State {
    /// Bootloader major revision served in the queries (7 or 8).
    major: u8,
    in_bl: bool,
    build_id: u32,
    /// Device partition table, served through the payload window.
    table: Vec<u8>,
    selected: u8,
    pending_write: bool,
    written: HashMap<u8, Vec<u8>>,
    control_frames: Vec<[u8; 8]>,
}

struct MockV7Device {
    state: Arc<Mutex<V7State>>,
    attention: AttentionSignal,
}

impl RegisterIo for MockV7Device {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        let bytes: Vec<u8> = match addr {
            0xe9 => vec![0x70, 0x36, 0x30, 0x20, 0x01, 0x01],
            0xe3 => vec![0x50, 0x00, 0x10, 0x60, 0x41, 0x34],
            // F34 query 0: the packed query block starts one byte in.
            0x50 => vec![0x00],
            0x51 => {
                let mut query = vec![0u8; 21];
                query[0] = 0x05;
                query[1] = state.major;
                query[7..9].copy_from_slice(&16u16.to_le_bytes());
                query[13..15].copy_from_slice(&4u16.to_le_bytes());
                query[15..17].copy_from_slice(&16u16.to_le_bytes());
                // Guest serialization and global parameters, guest code and
                // display config, plus core code, core config, flash config.
                query[17] = 0x60;
                query[18] = 0x06;
                query[19] = 0x07;
                query
            }
            // F34 data: flash status and the payload window.
            0x60 => vec![(state.in_bl as u8) << 7],
            0x65 => state.table.clone(),
            // F01 query 18..: firmware build id.
            0x82 => state.build_id.to_le_bytes()[..3].to_vec(),
            _ => Vec::new(),
        };
        for (ii, byte) in buf.iter_mut().enumerate() {
            *byte = bytes.get(ii).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        match addr {
            // F34 data 1..: an eight-byte frame is a control command, a
            // single byte selects the partition for the next transfer.
            0x61 if bytes.len() == 8 => {
                let mut frame = [0u8; 8];
                frame.copy_from_slice(bytes);
                if frame[5] == 0x01 {
                    state.in_bl = true;
                }
                state.control_frames.push(frame);
                self.attention.post();
            }
            0x61 => state.selected = bytes[0],
            // F34 flash command register.
            0x64 => {
                state.pending_write = bytes[0] == 0x03;
                self.attention.post();
            }
            // F34 payload window: lands in the selected partition.
            0x65 => {
                if state.pending_write {
                    let selected = state.selected;
                    state
                        .written
                        .entry(selected)
                        .or_default()
                        .extend_from_slice(bytes);
                    state.pending_write = false;
                }
            }
            // F01 command register: reset leaves bootloader mode.
            0x36 => {
                if bytes[0] == 0x01 {
                    state.in_bl = false;
                    self.attention.post();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn v7_device(major: u8) -> Arc<Mutex<V7State>> {
    Arc::new(Mutex::new(V7State {
        major,
        build_id: 0x100,
        table: device_partition_table(),
        ..V7State::default()
    }))
}

fn connect_v7(state: Arc<Mutex<V7State>>) -> Flasher {
    let _ = env_logger::builder().is_test(true).try_init();
    let (signal, slot) = attention_pair();
    let device = MockV7Device {
        state,
        attention: signal,
    };
    Flasher::connect(device, slot, NoopPower).unwrap()
}

/// Partition table with the seven partitions the mock advertises, padded out
/// to whole flash blocks.
fn device_partition_table() -> Vec<u8> {
    let mut raw = vec![0u8; 2];
    for (id, blocks, address) in [
        (PartitionId::CoreCode as u8, 4u16, 0x10u16),
        (PartitionId::CoreConfig as u8, 2, 0x60),
        (PartitionId::FlashConfig as u8, 4, 0x02),
        (PartitionId::GlobalParameters as u8, 2, 0x04),
        (PartitionId::GuestSerialization as u8, 1, 0x06),
        (PartitionId::GuestCode as u8, 2, 0x90),
        (PartitionId::DisplayConfig as u8, 1, 0xa0),
    ] {
        let mut entry = [0u8; 8];
        entry[0] = id;
        entry[2..4].copy_from_slice(&blocks.to_le_bytes());
        entry[4..6].copy_from_slice(&address.to_le_bytes());
        raw.extend_from_slice(&entry);
    }
    raw.resize(64, 0);
    raw
}

fn container_descriptor(data: &mut Vec<u8>, id: u16, content: &[u8]) -> u32 {
    let content_addr = data.len() as u32;
    data.extend_from_slice(content);
    let addr = data.len() as u32;
    let mut raw = [0u8; 0x20];
    raw[4..6].copy_from_slice(&id.to_le_bytes());
    raw[0x18..0x1c].copy_from_slice(&(content.len() as u32).to_le_bytes());
    raw[0x1c..0x20].copy_from_slice(&content_addr.to_le_bytes());
    data.extend_from_slice(&raw);
    addr
}

/// Minimal container (header version 0x10) image for the v7/v8 bootloaders.
fn container_image(
    bl_version: u8,
    firmware: &[u8],
    config: &[u8],
    fl_config: &[u8],
    firmware_id: u32,
) -> Vec<u8> {
    let mut data = vec![0u8; 0x40];
    data[0x07] = 0x10;

    let mut info = vec![0u8; 8];
    info[4..8].copy_from_slice(&firmware_id.to_le_bytes());

    // Core code, core config, flash config, general information, bootloader.
    let addrs = [
        container_descriptor(&mut data, 18, firmware),
        container_descriptor(&mut data, 19, config),
        container_descriptor(&mut data, 15, fl_config),
        container_descriptor(&mut data, 13, &info),
        container_descriptor(&mut data, 3, &[bl_version, 0, 0, 0]),
    ];
    let mut index = Vec::new();
    for addr in &addrs {
        index.extend_from_slice(&addr.to_le_bytes());
    }
    let top = container_descriptor(&mut data, 0, &index);
    data[0x0c..0x10].copy_from_slice(&top.to_le_bytes());
    data
}

#[test]
fn v7_update_erases_code_and_config_separately() {
    let firmware: Vec<u8> = (0..64).collect();
    let config: Vec<u8> = (64..96).collect();
    let image = container_image(7, &firmware, &config, &device_partition_table(), 0x200);

    let state = v7_device(7);
    let mut flasher = connect_v7(Arc::clone(&state));
    assert_eq!(flasher.bootloader_version(), Some(BootloaderVersion::V7));

    let outcome = flasher.reflash(&image, UpdateOptions::default()).unwrap();
    assert_eq!(outcome, FlashOutcome::Updated(FlashArea::Firmware));

    let state = state.lock().unwrap();
    let commands: Vec<(u8, u8)> = state
        .control_frames
        .iter()
        .map(|frame| (frame[0], frame[5]))
        .collect();
    // Mode entry, then separate core-code and core-config erases; a matching
    // partition table leaves the guest code partition alone.
    assert_eq!(
        commands,
        vec![
            (PartitionId::Bootloader as u8, 0x01),
            (PartitionId::CoreCode as u8, 0x04),
            (PartitionId::CoreConfig as u8, 0x04),
        ]
    );
    assert_eq!(
        state.written.get(&(PartitionId::CoreCode as u8)),
        Some(&firmware)
    );
    assert_eq!(
        state.written.get(&(PartitionId::CoreConfig as u8)),
        Some(&config)
    );
}

#[test]
fn v8_update_rewrites_the_flash_config_partition() {
    let firmware = vec![0x11u8; 64];
    let config = vec![0x22u8; 32];
    let table = device_partition_table();
    let image = container_image(8, &firmware, &config, &table, 0x200);

    let state = v7_device(8);
    let mut flasher = connect_v7(Arc::clone(&state));
    assert_eq!(flasher.bootloader_version(), Some(BootloaderVersion::V8));
    assert_eq!(flasher.profile().map(|profile| profile.partitions), Some(7));

    let outcome = flasher.reflash(&image, UpdateOptions::default()).unwrap();
    assert_eq!(outcome, FlashOutcome::Updated(FlashArea::Firmware));

    let state = state.lock().unwrap();
    let commands: Vec<(u8, u8)> = state
        .control_frames
        .iter()
        .map(|frame| (frame[0], frame[5]))
        .collect();
    // One combined application-partition erase, then mode re-entry after
    // the reset that follows the partition table write.
    assert_eq!(
        commands,
        vec![
            (PartitionId::Bootloader as u8, 0x01),
            (PartitionId::CoreCode as u8, 0x05),
            (PartitionId::Bootloader as u8, 0x01),
        ]
    );
    // The image's flash config lands in the flash-config partition, not in
    // global parameters.
    assert_eq!(
        state.written.get(&(PartitionId::FlashConfig as u8)),
        Some(&table)
    );
    assert!(!state
        .written
        .contains_key(&(PartitionId::GlobalParameters as u8)));
    assert_eq!(
        state.written.get(&(PartitionId::CoreCode as u8)),
        Some(&firmware)
    );
    assert_eq!(
        state.written.get(&(PartitionId::CoreConfig as u8)),
        Some(&config)
    );
}
