//! High-level client API.

use crate::connection::Connection;
use crate::error::ClientError;
use canboot_hal::CanInterface;
use canboot_protocol::{encode_command, Arg, CommandIndex, ValueReader, MAX_NODE_ID};
use canboot_storage::ConfigPatch;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Stage reported while flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Erase,
    Write,
    Config,
}

/// A firmware binary and where it goes.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub binary: Vec<u8>,
    pub base_address: u32,
    pub device_class: String,
    pub page_size: u32,
}

impl FirmwareImage {
    pub fn new(binary: Vec<u8>, base_address: u32, device_class: impl Into<String>) -> Self {
        Self {
            binary,
            base_address,
            device_class: device_class.into(),
            page_size: 2048,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// CRC32 the nodes store for this binary.
    pub fn crc(&self) -> u32 {
        crc32fast::hash(&self.binary)
    }

    /// Page-sized chunks with their target addresses.
    pub fn pages(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        let base = self.base_address;
        let page_size = self.page_size as usize;
        self.binary
            .chunks(page_size.max(1))
            .enumerate()
            .map(move |(i, chunk)| (base + (i * page_size) as u32, chunk))
    }
}

/// High-level client for canboot nodes.
pub struct Client<B> {
    conn: Connection<B>,
}

impl<B: CanInterface> Client<B> {
    pub fn new(conn: Connection<B>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection<B> {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection<B> {
        &mut self.conn
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Sends a command without waiting for replies.
    pub fn write_command(
        &mut self,
        command: CommandIndex,
        args: &[Arg<'_>],
        destinations: &[u8],
    ) -> Result<(), ClientError> {
        let payload = encode_command(command, args)?;
        self.conn.send(&payload, destinations)
    }

    /// Collects replies until the bus goes quiet.
    fn collect_replies(&mut self) -> Result<BTreeMap<u8, Vec<u8>>, ClientError> {
        let mut replies = BTreeMap::new();
        while let Some((source, data)) = self.conn.receive()? {
            replies.insert(source, data);
        }
        Ok(replies)
    }

    /// Sends a command and waits for one reply from every destination,
    /// resending to the silent ones up to the configured retry limit.
    pub fn write_command_retry(
        &mut self,
        command: CommandIndex,
        args: &[Arg<'_>],
        destinations: &[u8],
    ) -> Result<BTreeMap<u8, Vec<u8>>, ClientError> {
        let payload = encode_command(command, args)?;
        let expected: BTreeSet<u8> = destinations.iter().copied().collect();
        let mut answers = BTreeMap::new();
        let mut retries = 0;

        self.conn.reset();
        self.conn.send(&payload, destinations)?;

        while answers.len() < expected.len() {
            match self.conn.receive()? {
                Some((source, data)) => {
                    if expected.contains(&source) {
                        answers.insert(source, data);
                    } else {
                        debug!("Unexpected reply from node {}", source);
                    }
                }
                None => {
                    let silent: Vec<u8> = expected
                        .iter()
                        .copied()
                        .filter(|id| !answers.contains_key(id))
                        .collect();
                    if retries == self.conn.config().retry_limit {
                        return Err(ClientError::NoAnswer(silent));
                    }
                    warn!("No answer from nodes {:?}, retrying", silent);
                    self.conn.send(&payload, &silent)?;
                    retries += 1;
                }
            }
        }

        Ok(answers)
    }

    /// Sends a command answered with a boolean and fails with the nodes that
    /// replied anything but `true`.
    fn command_all_ok(
        &mut self,
        operation: &'static str,
        command: CommandIndex,
        args: &[Arg<'_>],
        destinations: &[u8],
    ) -> Result<(), ClientError> {
        let replies = self.write_command_retry(command, args, destinations)?;
        let failed: Vec<u8> = replies
            .iter()
            .filter(|(_, data)| !matches!(ValueReader::new(data).read_bool(), Ok(true)))
            .map(|(&id, _)| id)
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Refused {
                operation,
                nodes: failed,
            })
        }
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Returns the nodes among `ids` that answer a ping.
    pub fn ping(&mut self, ids: &[u8]) -> Result<BTreeSet<u8>, ClientError> {
        self.conn.reset();
        self.write_command(CommandIndex::Ping, &[], ids)?;
        Ok(self.collect_replies()?.into_keys().collect())
    }

    /// Pings every node id on the bus.
    pub fn scan(&mut self) -> Result<BTreeSet<u8>, ClientError> {
        let all: Vec<u8> = (1..=MAX_NODE_ID).collect();
        self.ping(&all)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Reads the config of every node in `ids`.
    pub fn read_config(&mut self, ids: &[u8]) -> Result<BTreeMap<u8, Value>, ClientError> {
        self.write_command_retry(CommandIndex::ReadConfig, &[], ids)?
            .into_iter()
            .map(|(id, data)| -> Result<(u8, Value), ClientError> {
                Ok((id, rmp_serde::from_slice(&data)?))
            })
            .collect()
    }

    /// Merges `patch` into the RAM config of every node in `ids`.
    pub fn update_config(&mut self, ids: &[u8], patch: &ConfigPatch) -> Result<(), ClientError> {
        let encoded = patch.encode()?;
        self.command_all_ok(
            "config update",
            CommandIndex::UpdateConfig,
            &[Arg::Raw(&encoded)],
            ids,
        )
    }

    /// Writes the RAM config of every node in `ids` to flash.
    pub fn save_config(&mut self, ids: &[u8]) -> Result<(), ClientError> {
        self.command_all_ok("config save", CommandIndex::SaveConfig, &[], ids)
    }

    /// Updates and saves the config of every node in `ids`. Changing node
    /// ids this way is refused, see [`Client::change_id`].
    pub fn write_config(&mut self, ids: &[u8], patch: &ConfigPatch) -> Result<(), ClientError> {
        if patch.id.is_some() {
            return Err(ClientError::IdChange);
        }
        self.update_config(ids, patch)?;
        self.save_config(ids)
    }

    /// Moves node `old` to id `new`.
    pub fn change_id(&mut self, old: u8, new: u8) -> Result<(), ClientError> {
        let patch = ConfigPatch {
            id: Some(new),
            ..Default::default()
        }
        .encode()?;

        // Not retried: once applied, the node no longer listens to `old` and
        // replies from `new`.
        self.conn.reset();
        self.write_command(CommandIndex::UpdateConfig, &[Arg::Raw(&patch)], &[old])?;
        match self.conn.receive()? {
            Some((source, data)) if source == old || source == new => {
                if !matches!(ValueReader::new(&data).read_bool(), Ok(true)) {
                    return Err(ClientError::Refused {
                        operation: "config update",
                        nodes: vec![old],
                    });
                }
            }
            _ => return Err(ClientError::NoAnswer(vec![old])),
        }

        self.save_config(&[new])?;
        info!("Node {} is now node {}", old, new);
        Ok(())
    }

    // =========================================================================
    // Firmware
    // =========================================================================

    /// Erases and programs `image` on every node in `ids`, then records its
    /// size and CRC in their configs. Any refusal aborts.
    pub fn flash(
        &mut self,
        image: &FirmwareImage,
        ids: &[u8],
        mut progress: impl FnMut(FlashPhase, usize, usize),
    ) -> Result<(), ClientError> {
        if image.page_size == 0 {
            return Err(ClientError::InvalidPageSize(image.page_size));
        }
        let total = image.binary.len();
        let class = image.device_class.as_str();

        for (addr, _) in image.pages() {
            self.command_all_ok(
                "page erase",
                CommandIndex::EraseFlashPage,
                &[Arg::Uint(u64::from(addr)), Arg::Str(class)],
                ids,
            )?;
            progress(FlashPhase::Erase, (addr - image.base_address) as usize, total);
        }

        for (addr, chunk) in image.pages() {
            self.command_all_ok(
                "page write",
                CommandIndex::WriteFlash,
                &[Arg::Uint(u64::from(addr)), Arg::Str(class), Arg::Bin(chunk)],
                ids,
            )?;
            progress(FlashPhase::Write, (addr - image.base_address) as usize + chunk.len(), total);
        }

        let patch = ConfigPatch {
            application_size: Some(total as u32),
            application_crc: Some(image.crc()),
            ..Default::default()
        };
        self.update_config(ids, &patch)?;
        self.save_config(ids)?;
        progress(FlashPhase::Config, total, total);

        info!("Flashed {} bytes to nodes {:?}", total, ids);
        Ok(())
    }

    /// Returns the nodes whose flash matches `binary` at `base_address`.
    pub fn verify(
        &mut self,
        binary: &[u8],
        base_address: u32,
        ids: &[u8],
    ) -> Result<BTreeSet<u8>, ClientError> {
        let expected = crc32fast::hash(binary);
        let replies = self.write_command_retry(
            CommandIndex::CrcRegion,
            &[
                Arg::Uint(u64::from(base_address)),
                Arg::Uint(binary.len() as u64),
            ],
            ids,
        )?;

        Ok(replies
            .into_iter()
            .filter(|(_, data)| ValueReader::new(data).read_u32().ok() == Some(expected))
            .map(|(id, _)| id)
            .collect())
    }

    /// Asks every node in `ids` to start its application. Nodes do not reply.
    pub fn run_application(&mut self, ids: &[u8]) -> Result<(), ClientError> {
        self.write_command(CommandIndex::JumpToApplication, &[], ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use canboot_bootloader::Bootloader;
    use canboot_hal::{
        BootArg, Flash, HalError, ManualTimer, MemoryLayout, MockBus, RecordingBoot, SimFlash,
        PLATFORM_DEVICE_CLASS,
    };
    use canboot_protocol::Frame;
    use canboot_storage::BootConfig;
    use std::collections::VecDeque;

    type Node = Bootloader<MockBus, SimFlash, RecordingBoot, ManualTimer>;

    /// Nodes wired straight to the host: every host frame is handed to every
    /// node and their replies are queued for the host.
    struct SimNetwork {
        nodes: Vec<Node>,
        inbound: VecDeque<Frame>,
        lose: usize,
    }

    impl SimNetwork {
        fn new(ids: &[u8]) -> Self {
            let nodes = ids
                .iter()
                .map(|&id| {
                    let layout = MemoryLayout::default();
                    let mut config = BootConfig::fallback(PLATFORM_DEVICE_CLASS);
                    config.id = id;
                    Bootloader::new(
                        MockBus::new(),
                        SimFlash::new(layout.flash, layout.page_size),
                        RecordingBoot::new(),
                        ManualTimer::new(),
                        layout,
                        config,
                    )
                })
                .collect();
            Self {
                nodes,
                inbound: VecDeque::new(),
                lose: 0,
            }
        }

        fn node(&self, id: u8) -> &Node {
            self.nodes.iter().find(|n| n.config().id == id).unwrap()
        }
    }

    impl CanInterface for SimNetwork {
        fn send(&mut self, frame: &Frame, _retries: u32) -> Result<(), HalError> {
            if self.lose > 0 {
                self.lose -= 1;
                return Ok(());
            }
            for node in &mut self.nodes {
                node.handle_frame(frame);
                self.inbound.extend(node.bus_mut().take_sent());
            }
            Ok(())
        }

        fn receive(&mut self, retries: u32) -> Result<Frame, HalError> {
            self.inbound.pop_front().ok_or(HalError::Timeout(retries))
        }
    }

    fn client(ids: &[u8]) -> Client<SimNetwork> {
        Client::new(Connection::new(SimNetwork::new(ids), ConnectionConfig::default()))
    }

    fn network(client: &Client<SimNetwork>) -> &SimNetwork {
        client.connection().bus()
    }

    #[test]
    fn test_ping_reports_online_nodes() {
        let mut client = client(&[1, 2, 5]);
        let online = client.ping(&[1, 2, 3]).unwrap();
        assert_eq!(online, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_scan_finds_every_node() {
        let mut client = client(&[4, 90, 127]);
        assert_eq!(client.scan().unwrap(), BTreeSet::from([4, 90, 127]));
    }

    #[test]
    fn test_read_config_as_json() {
        let mut client = client(&[1, 2]);
        let configs = client.read_config(&[1, 2]).unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[&2]["ID"], 2);
        assert_eq!(configs[&1]["name"], "foobar2000");
        assert_eq!(configs[&1]["device_class"], PLATFORM_DEVICE_CLASS);
    }

    #[test]
    fn test_missing_node_fails_after_retries() {
        let mut client = client(&[1]);
        match client.read_config(&[1, 9]) {
            Err(ClientError::NoAnswer(silent)) => assert_eq!(silent, vec![9]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_lost_request_is_resent() {
        let mut client = client(&[1]);
        client.connection_mut().bus_mut().lose = 1;

        let replies = client
            .write_command_retry(CommandIndex::Ping, &[], &[1])
            .unwrap();
        assert_eq!(replies[&1], vec![0xc3]);
    }

    #[test]
    fn test_write_config() {
        let mut client = client(&[1, 2]);
        let patch = ConfigPatch {
            board_name: Some("arm".to_string()),
            ..Default::default()
        };
        client.write_config(&[1, 2], &patch).unwrap();

        for id in [1, 2] {
            let node = network(&client).node(id);
            assert_eq!(node.config().board_name, "arm");
            assert_eq!(node.config().update_count, 2);
        }
    }

    #[test]
    fn test_write_config_refuses_id_change() {
        let mut client = client(&[1]);
        let patch = ConfigPatch {
            id: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            client.write_config(&[1], &patch),
            Err(ClientError::IdChange)
        ));
        assert_eq!(network(&client).node(1).config().update_count, 1);
    }

    #[test]
    fn test_write_config_reports_refusing_nodes() {
        let mut client = client(&[1]);
        let patch = ConfigPatch {
            board_name: Some("x".repeat(100)),
            ..Default::default()
        };
        match client.write_config(&[1], &patch) {
            Err(ClientError::Refused { operation, nodes }) => {
                assert_eq!(operation, "config update");
                assert_eq!(nodes, vec![1]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_change_id() {
        let mut client = client(&[1]);
        client.change_id(1, 33).unwrap();

        assert_eq!(client.ping(&[1, 33]).unwrap(), BTreeSet::from([33]));
        assert_eq!(network(&client).node(33).config().update_count, 2);
    }

    #[test]
    fn test_flash_and_verify() {
        let mut client = client(&[1, 2]);
        let layout = MemoryLayout::default();
        let binary: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let image = FirmwareImage::new(binary.clone(), layout.application.base, PLATFORM_DEVICE_CLASS)
            .with_page_size(layout.page_size);

        let mut phases = Vec::new();
        client
            .flash(&image, &[1, 2], |phase, done, total| phases.push((phase, done, total)))
            .unwrap();

        assert_eq!(phases.first(), Some(&(FlashPhase::Erase, 0, 5000)));
        assert_eq!(phases.last(), Some(&(FlashPhase::Config, 5000, 5000)));
        assert_eq!(phases.iter().filter(|p| p.0 == FlashPhase::Write).count(), 3);

        for id in [1, 2] {
            let node = network(&client).node(id);
            assert_eq!(
                node.flash().read(layout.application.base, 5000).unwrap(),
                binary.as_slice()
            );
            assert_eq!(node.config().application_size, 5000);
            assert_eq!(node.config().application_crc, image.crc());
        }

        let valid = client.verify(&binary, layout.application.base, &[1, 2]).unwrap();
        assert_eq!(valid, BTreeSet::from([1, 2]));

        let mut other = binary.clone();
        other[10] ^= 0xff;
        let valid = client.verify(&other, layout.application.base, &[1, 2]).unwrap();
        assert!(valid.is_empty());
    }

    #[test]
    fn test_flash_wrong_device_class_aborts() {
        let mut client = client(&[1]);
        let layout = MemoryLayout::default();
        let image = FirmwareImage::new(vec![0; 16], layout.application.base, "other-board");

        match client.flash(&image, &[1], |_, _, _| {}) {
            Err(ClientError::Refused { operation, nodes }) => {
                assert_eq!(operation, "page erase");
                assert_eq!(nodes, vec![1]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(network(&client).node(1).flash().write_count(), 0);
    }

    #[test]
    fn test_run_application() {
        let mut client = client(&[1]);
        let layout = MemoryLayout::default();
        let binary = vec![0x42; 100];
        let image = FirmwareImage::new(binary, layout.application.base, PLATFORM_DEVICE_CLASS);
        client.flash(&image, &[1], |_, _, _| {}).unwrap();

        client.run_application(&[1]).unwrap();
        assert_eq!(
            network(&client).node(1).boot().last(),
            Some(BootArg::StartApplication)
        );
    }

    #[test]
    fn test_image_pages() {
        let image = FirmwareImage::new(vec![0; 5], 0x100, "c").with_page_size(2);
        let pages: Vec<_> = image.pages().map(|(addr, chunk)| (addr, chunk.len())).collect();
        assert_eq!(pages, vec![(0x100, 2), (0x102, 2), (0x104, 1)]);
    }
}
