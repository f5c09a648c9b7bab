//! Bootloader v7/v8 protocol
//!
//! Flash is organized as named partitions. Data transfers select a partition
//! id and move up to `payload_length` blocks per transaction; mode changes
//! and erases go out as a single eight-byte write covering partition id,
//! block offset, transfer length, command and the bootloader id. The v8
//! variant shares the register map and is detected from the queried major
//! revision.

use log::debug;

use crate::{
    command::{ConfigArea, FlashCommand},
    connection::Connection,
    error::{Error, FlashStatusCode},
    partition::{self, parse_partition_table},
    targets::{
        BootloaderVersion, DeviceProfile, FlashProperties, PartitionId, ProtocolAdapter,
        RegisterMap, StatusSnapshot,
    },
};

const V7_FLASH_STATUS_OFFSET: u16 = 0;
const V7_PARTITION_ID_OFFSET: u16 = 1;
const V7_BLOCK_NUMBER_OFFSET: u16 = 2;
const V7_TRANSFER_LENGTH_OFFSET: u16 = 3;
const V7_COMMAND_OFFSET: u16 = 4;
const V7_PAYLOAD_OFFSET: u16 = 5;

const CMD_V7_IDLE: u8 = 0x0;
const CMD_V7_ENTER_BL: u8 = 0x1;
const CMD_V7_READ: u8 = 0x2;
const CMD_V7_WRITE: u8 = 0x3;
const CMD_V7_ERASE: u8 = 0x4;
const CMD_V7_ERASE_AP: u8 = 0x5;

const QUERY_1_7_SIZE: usize = 21;
const V8_BOOTLOADER_MAJOR: u8 = 8;

const HAS_GUEST_SERIALIZATION: u8 = 1 << 5;
const HAS_GLOBAL_PARAMETERS: u8 = 1 << 6;
const HAS_GUEST_CODE: u8 = 1 << 1;
const HAS_DISPLAY_CONFIG: u8 = 1 << 2;

/// Upper bound on the bytes moved per payload transaction.
const PAGE_SIZE: usize = 4096;

pub(crate) struct V7V8Adapter;

impl V7V8Adapter {
    fn data_opcode(cmd: FlashCommand) -> Result<u8, Error> {
        let opcode = match cmd {
            FlashCommand::Idle => CMD_V7_IDLE,
            FlashCommand::WriteFirmware
            | FlashCommand::WriteConfig(_)
            | FlashCommand::WriteGuestCode => CMD_V7_WRITE,
            FlashCommand::ReadConfig(_) => CMD_V7_READ,
            _ => return Err(Error::UnsupportedCommand(cmd)),
        };
        Ok(opcode)
    }

    fn data_partition(cmd: FlashCommand) -> Result<PartitionId, Error> {
        let id = match cmd {
            FlashCommand::WriteFirmware => PartitionId::CoreCode,
            FlashCommand::WriteGuestCode => PartitionId::GuestCode,
            FlashCommand::WriteConfig(area) | FlashCommand::ReadConfig(area) => match area {
                ConfigArea::Ui => PartitionId::CoreConfig,
                ConfigArea::Permanent => PartitionId::GuestSerialization,
                ConfigArea::Bootloader => PartitionId::GlobalParameters,
                ConfigArea::Display => PartitionId::DisplayConfig,
                ConfigArea::Flash => PartitionId::FlashConfig,
            },
            _ => return Err(Error::UnsupportedCommand(cmd)),
        };
        Ok(id)
    }

    /// Partition id and opcode pair for the single-transaction commands.
    /// An erase-all is an application-partition erase of the core code.
    fn control_op(cmd: FlashCommand) -> Result<(PartitionId, u8), Error> {
        let pair = match cmd {
            FlashCommand::EnterBootloader => (PartitionId::Bootloader, CMD_V7_ENTER_BL),
            FlashCommand::EraseAll => (PartitionId::CoreCode, CMD_V7_ERASE_AP),
            FlashCommand::EraseFirmware => (PartitionId::CoreCode, CMD_V7_ERASE),
            FlashCommand::EraseConfig(ConfigArea::Ui) => (PartitionId::CoreConfig, CMD_V7_ERASE),
            FlashCommand::EraseConfig(ConfigArea::Bootloader) => {
                (PartitionId::GlobalParameters, CMD_V7_ERASE)
            }
            FlashCommand::EraseConfig(ConfigArea::Display) => {
                (PartitionId::DisplayConfig, CMD_V7_ERASE)
            }
            FlashCommand::EraseConfig(ConfigArea::Flash) => {
                (PartitionId::FlashConfig, CMD_V7_ERASE)
            }
            FlashCommand::EraseGuestCode => (PartitionId::GuestCode, CMD_V7_ERASE),
            _ => return Err(Error::UnsupportedCommand(cmd)),
        };
        Ok(pair)
    }

    /// The device partition table lives in the flash-config partition and is
    /// read with the regular block-read plumbing.
    fn read_partition_table(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        let base = profile.flash_fn.data_base;
        let cmd = FlashCommand::ReadConfig(ConfigArea::Flash);

        conn.write_u8(
            base + profile.regs.partition_id,
            PartitionId::FlashConfig as u8,
        )?;
        conn.write(base + profile.regs.block_number, &[0, 0])?;
        conn.write(
            base + profile.regs.transfer_length,
            &profile.flash_config_length.to_le_bytes(),
        )?;
        conn.write_u8(base + profile.regs.flash_cmd, CMD_V7_READ)?;
        self.wait_for_idle(conn, profile, cmd.timeout(), cmd)?;

        let mut raw = vec![0u8; len];
        conn.read(base + profile.regs.payload, &mut raw)?;
        Ok(raw)
    }

    fn start_transfer(
        &self,
        conn: &mut Connection,
        profile: &DeviceProfile,
        cmd: FlashCommand,
    ) -> Result<u16, Error> {
        let base = profile.flash_fn.data_base;
        let partition = Self::data_partition(cmd)?;

        conn.write_u8(base + profile.regs.partition_id, partition as u8)?;
        conn.write(base + profile.regs.block_number, &[0, 0])?;

        let per_page = (PAGE_SIZE / profile.block_size.max(1) as usize).max(1) as u16;
        Ok(profile.payload_length.clamp(1, per_page))
    }
}

impl ProtocolAdapter for V7V8Adapter {
    fn read_queries(
        &self,
        conn: &mut Connection,
        profile: &mut DeviceProfile,
    ) -> Result<(), Error> {
        profile.regs = RegisterMap {
            flash_status: V7_FLASH_STATUS_OFFSET,
            partition_id: V7_PARTITION_ID_OFFSET,
            block_number: V7_BLOCK_NUMBER_OFFSET,
            transfer_length: V7_TRANSFER_LENGTH_OFFSET,
            flash_cmd: V7_COMMAND_OFFSET,
            payload: V7_PAYLOAD_OFFSET,
            ..RegisterMap::default()
        };

        // The size of query 0's first subpacket decides where the packed
        // query block starts.
        let query_0 = conn.read_u8(profile.flash_fn.query_base)?;
        let offset = (query_0 & 0x07) as u16 + 1;

        let mut query = [0u8; QUERY_1_7_SIZE];
        conn.read(profile.flash_fn.query_base + offset, &mut query)?;

        profile.bootloader_id = [query[0], query[1]];
        if query[1] == V8_BOOTLOADER_MAJOR {
            profile.version = BootloaderVersion::V8;
        }

        profile.block_size = u16::from_le_bytes([query[7], query[8]]);
        profile.flash_config_length = u16::from_le_bytes([query[13], query[14]]);
        profile.payload_length = u16::from_le_bytes([query[15], query[16]]);

        let mut properties = FlashProperties::empty();
        if query[17] & HAS_GUEST_SERIALIZATION != 0 {
            properties |= FlashProperties::HAS_PM_CONFIG;
        }
        if query[17] & HAS_GLOBAL_PARAMETERS != 0 {
            properties |= FlashProperties::HAS_BL_CONFIG;
        }
        if query[18] & HAS_DISPLAY_CONFIG != 0 {
            properties |= FlashProperties::HAS_DISP_CONFIG;
        }
        profile.properties = properties;
        profile.has_guest_code = query[18] & HAS_GUEST_CODE != 0;

        // Each supported partition sets one bit in the four support bytes.
        profile.partitions = query[17..QUERY_1_7_SIZE]
            .iter()
            .map(|byte| byte.count_ones() as u8)
            .sum();

        debug!(
            "v{} queries: bootloader id {:02x}.{:02x}, block size {}, payload {} blocks, {} partitions",
            profile.version as u8,
            profile.bootloader_id[1],
            profile.bootloader_id[0],
            profile.block_size,
            profile.payload_length,
            profile.partitions
        );

        let table_len =
            profile.partitions as usize * partition::ENTRY_SIZE + partition::TABLE_HEADER_SIZE;
        let raw = self.read_partition_table(conn, profile, table_len)?;
        let (counts, addresses) = parse_partition_table(&raw, profile.partitions)?;
        profile.block_counts = counts;
        profile.addresses = addresses;

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
        let mut status = raw & 0x1f;
        // Reported until a partition table is written; not a command failure.
        if status == FlashStatusCode::BadPartitionTable as u8 {
            status = 0;
        }

        let mut data_1_5 = [0u8; 8];
        conn.read(base + profile.regs.partition_id, &mut data_1_5)?;
        let command = data_1_5[5];

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

        if cmd.needs_bootloader_id() {
            let (partition, opcode) = Self::control_op(cmd)?;
            let mut frame = [0u8; 8];
            frame[0] = partition as u8;
            frame[5] = opcode;
            frame[6] = profile.bootloader_id[0];
            frame[7] = profile.bootloader_id[1];
            debug!("command {} ({:#03x}, partition {:?})", cmd, opcode, partition);
            conn.write(base + profile.regs.partition_id, &frame)?;
        } else {
            let opcode = Self::data_opcode(cmd)?;
            debug!("command {} ({:#03x})", cmd, opcode);
            conn.write_u8(base + profile.regs.flash_cmd, opcode)?;
        }

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

        if block_size == 0 || data.len() < block_count as usize * block_size {
            return Err(Error::InternalError);
        }

        let max_transfer = self.start_transfer(conn, profile, cmd)?;
        let opcode = Self::data_opcode(cmd)?;

        let mut remaining = block_count;
        let mut offset = 0;
        while remaining > 0 {
            let transfer = remaining.min(max_transfer);
            conn.write(
                base + profile.regs.transfer_length,
                &transfer.to_le_bytes(),
            )?;
            conn.write_u8(base + profile.regs.flash_cmd, opcode)?;

            let chunk = transfer as usize * block_size;
            conn.write(base + profile.regs.payload, &data[offset..offset + chunk])?;
            self.wait_for_idle(conn, profile, cmd.timeout(), cmd)?;

            offset += chunk;
            remaining -= transfer;
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
        if block_size == 0 {
            return Err(Error::InternalError);
        }

        let max_transfer = self.start_transfer(conn, profile, cmd)?;
        let opcode = Self::data_opcode(cmd)?;
        let mut out = vec![0u8; block_count as usize * block_size];

        let mut remaining = block_count;
        let mut offset = 0;
        while remaining > 0 {
            let transfer = remaining.min(max_transfer);
            conn.write(
                base + profile.regs.transfer_length,
                &transfer.to_le_bytes(),
            )?;
            conn.write_u8(base + profile.regs.flash_cmd, opcode)?;
            self.wait_for_idle(conn, profile, cmd.timeout(), cmd)?;

            let chunk = transfer as usize * block_size;
            conn.read(base + profile.regs.payload, &mut out[offset..offset + chunk])?;

            offset += chunk;
            remaining -= transfer;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::connection::discovery::FunctionRecord;
    use crate::connection::{attention_pair, AttentionSignal, RegisterIo};
    use crate::error::TransportError;

    // The 21-byte query block must not overlap the data window.
    const FLASH_QUERY: u16 = 0x50;
    const FLASH_DATA: u16 = 0x100;

    #[derive(Default)]
    struct BusState {
        regs: HashMap<u16, u8>,
        writes: Vec<(u16, Vec<u8>)>,
    }

    /// Reads serve preloaded register values; writes only land in the log,
    /// so the flash data window always reads back as idle.
    struct MockBus {
        state: Arc<Mutex<BusState>>,
        attention: AttentionSignal,
    }

    impl RegisterIo for MockBus {
        fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), TransportError> {
            let state = self.state.lock().unwrap();
            for (ii, byte) in buf.iter_mut().enumerate() {
                *byte = state.regs.get(&(addr + ii as u16)).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.writes.push((addr, bytes.to_vec()));
            self.attention.post();
            Ok(())
        }
    }

    fn setup() -> (Connection, Arc<Mutex<BusState>>) {
        let state = Arc::new(Mutex::new(BusState::default()));
        let (signal, slot) = attention_pair();
        let bus = MockBus {
            state: Arc::clone(&state),
            attention: signal,
        };
        let mut conn = Connection::new(bus, slot);
        conn.enable_attention();
        (conn, state)
    }

    fn preload(state: &Arc<Mutex<BusState>>, addr: u16, bytes: &[u8]) {
        let mut state = state.lock().unwrap();
        for (ii, byte) in bytes.iter().enumerate() {
            state.regs.insert(addr + ii as u16, *byte);
        }
    }

    fn writes_at(state: &Arc<Mutex<BusState>>, addr: u16) -> Vec<Vec<u8>> {
        state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(at, _)| *at == addr)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    fn profile() -> DeviceProfile {
        let control = FunctionRecord {
            query_base: 0x70,
            cmd_base: 0x36,
            ctrl_base: 0x30,
            data_base: 0x20,
            version: 0,
            intr_sources: 1,
            number: 0x01,
        };
        let flash = FunctionRecord {
            query_base: FLASH_QUERY,
            cmd_base: 0x00,
            ctrl_base: 0x10,
            data_base: FLASH_DATA,
            version: 2,
            intr_sources: 1,
            number: 0x34,
        };
        let mut profile = DeviceProfile::new(BootloaderVersion::V7, control, flash);
        profile.regs = RegisterMap {
            flash_status: V7_FLASH_STATUS_OFFSET,
            partition_id: V7_PARTITION_ID_OFFSET,
            block_number: V7_BLOCK_NUMBER_OFFSET,
            transfer_length: V7_TRANSFER_LENGTH_OFFSET,
            flash_cmd: V7_COMMAND_OFFSET,
            payload: V7_PAYLOAD_OFFSET,
            ..RegisterMap::default()
        };
        profile.bootloader_id = [0x34, 0x12];
        profile.block_size = 16;
        profile.payload_length = 2;
        profile
    }

    #[test]
    fn control_commands_go_out_as_one_frame() {
        let (mut conn, state) = setup();
        let profile = profile();

        V7V8Adapter
            .write_command(&mut conn, &profile, FlashCommand::EraseAll)
            .unwrap();
        V7V8Adapter
            .write_command(&mut conn, &profile, FlashCommand::EnterBootloader)
            .unwrap();

        let frames = writes_at(&state, FLASH_DATA + V7_PARTITION_ID_OFFSET);
        assert_eq!(
            frames,
            vec![
                vec![
                    PartitionId::CoreCode as u8,
                    0,
                    0,
                    0,
                    0,
                    CMD_V7_ERASE_AP,
                    0x34,
                    0x12
                ],
                vec![
                    PartitionId::Bootloader as u8,
                    0,
                    0,
                    0,
                    0,
                    CMD_V7_ENTER_BL,
                    0x34,
                    0x12
                ],
            ]
        );
    }

    #[test]
    fn lockdown_is_not_part_of_this_generation() {
        let (mut conn, _state) = setup();
        let profile = profile();
        assert!(matches!(
            V7V8Adapter.write_command(&mut conn, &profile, FlashCommand::WriteLockdown),
            Err(Error::UnsupportedCommand(FlashCommand::WriteLockdown))
        ));
    }

    #[test]
    fn writes_are_chunked_by_payload_length() {
        let (mut conn, state) = setup();
        let profile = profile();
        let data = vec![0u8; 5 * 16];

        V7V8Adapter
            .write_blocks(&mut conn, &profile, &data, 5, FlashCommand::WriteFirmware)
            .unwrap();

        assert_eq!(
            writes_at(&state, FLASH_DATA + V7_PARTITION_ID_OFFSET),
            vec![vec![PartitionId::CoreCode as u8]]
        );
        assert_eq!(
            writes_at(&state, FLASH_DATA + V7_TRANSFER_LENGTH_OFFSET),
            vec![vec![2, 0], vec![2, 0], vec![1, 0]]
        );
        let payloads = writes_at(&state, FLASH_DATA + V7_PAYLOAD_OFFSET);
        assert_eq!(
            payloads.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![32, 32, 16]
        );
    }

    #[test]
    fn bad_partition_table_status_reads_as_idle() {
        let (mut conn, state) = setup();
        let profile = profile();

        preload(&state, FLASH_DATA + V7_FLASH_STATUS_OFFSET, &[0x88]);
        let snapshot = V7V8Adapter.read_status(&mut conn, &profile).unwrap();
        assert!(snapshot.in_bootloader);
        assert_eq!(snapshot.status, 0);

        preload(&state, FLASH_DATA + V7_FLASH_STATUS_OFFSET, &[0x82]);
        let snapshot = V7V8Adapter.read_status(&mut conn, &profile).unwrap();
        assert_eq!(snapshot.status, 2);
    }

    #[test]
    fn queries_decode_device_geometry() {
        let (mut conn, state) = setup();
        let mut profile = profile();

        // Query 0 places the packed block three bytes in.
        preload(&state, FLASH_QUERY, &[0x02]);
        let mut query = [0u8; QUERY_1_7_SIZE];
        query[0] = 0x05;
        query[1] = 0x07;
        query[7..9].copy_from_slice(&16u16.to_le_bytes());
        query[13..15].copy_from_slice(&2u16.to_le_bytes());
        query[15..17].copy_from_slice(&16u16.to_le_bytes());
        query[17] = HAS_GUEST_SERIALIZATION | HAS_GLOBAL_PARAMETERS;
        query[18] = HAS_GUEST_CODE | HAS_DISPLAY_CONFIG;
        preload(&state, FLASH_QUERY + 3, &query);

        // Device partition table, read back through the payload window.
        let mut table = vec![0u8; 2];
        for (id, length, address) in [
            (PartitionId::CoreCode as u8, 100u16, 0x10u16),
            (PartitionId::CoreConfig as u8, 4, 0x80),
            (PartitionId::GuestSerialization as u8, 2, 0x02),
            (PartitionId::GlobalParameters as u8, 3, 0x05),
        ] {
            let mut entry = [0u8; 8];
            entry[0] = id;
            entry[2..4].copy_from_slice(&length.to_le_bytes());
            entry[4..6].copy_from_slice(&address.to_le_bytes());
            table.extend_from_slice(&entry);
        }
        preload(&state, FLASH_DATA + V7_PAYLOAD_OFFSET, &table);

        V7V8Adapter.read_queries(&mut conn, &mut profile).unwrap();

        assert_eq!(profile.version, BootloaderVersion::V7);
        assert_eq!(profile.bootloader_id, [0x05, 0x07]);
        assert_eq!(profile.block_size, 16);
        assert_eq!(profile.flash_config_length, 2);
        assert_eq!(profile.payload_length, 16);
        assert_eq!(profile.partitions, 4);
        assert!(profile.properties.contains(FlashProperties::HAS_PM_CONFIG));
        assert!(profile.properties.contains(FlashProperties::HAS_BL_CONFIG));
        assert!(profile.properties.contains(FlashProperties::HAS_DISP_CONFIG));
        assert!(profile.has_guest_code);
        assert_eq!(profile.block_counts.ui_firmware, 100);
        assert_eq!(profile.block_counts.ui_config, 4);
        assert_eq!(profile.block_counts.bl_config, 3);
        assert_eq!(profile.addresses.ui_config, 0x80);
    }

    #[test]
    fn major_revision_eight_promotes_to_v8() {
        let (mut conn, state) = setup();
        let mut profile = profile();

        preload(&state, FLASH_QUERY, &[0x00]);
        let mut query = [0u8; QUERY_1_7_SIZE];
        query[1] = V8_BOOTLOADER_MAJOR;
        query[7..9].copy_from_slice(&16u16.to_le_bytes());
        preload(&state, FLASH_QUERY + 1, &query);

        V7V8Adapter.read_queries(&mut conn, &mut profile).unwrap();
        assert_eq!(profile.version, BootloaderVersion::V8);
        assert_eq!(profile.partitions, 0);
    }
}
