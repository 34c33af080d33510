//! Bootloader commands.

use crate::dispatcher::{Command, CommandEntry, NodeContext, ReplyWriter};
use crate::error::DispatchError;
use canboot_hal::{BootArg, Flash, MemoryLayout};
use canboot_protocol::{CommandIndex, ProtocolError, ValueReader};
use canboot_storage::{BootConfig, ConfigPatch};
use tracing::{debug, info, warn};

/// The command table of a standard node.
pub static DEFAULT_COMMANDS: [CommandEntry; 9] = [
    CommandEntry {
        index: CommandIndex::JumpToApplication as u8,
        handler: &JumpToApplication,
    },
    CommandEntry {
        index: CommandIndex::CrcRegion as u8,
        handler: &CrcRegion,
    },
    CommandEntry {
        index: CommandIndex::EraseFlashPage as u8,
        handler: &EraseFlashPage,
    },
    CommandEntry {
        index: CommandIndex::WriteFlash as u8,
        handler: &WriteFlash,
    },
    CommandEntry {
        index: CommandIndex::Ping as u8,
        handler: &Ping,
    },
    CommandEntry {
        index: CommandIndex::ReadFlash as u8,
        handler: &ReadFlash,
    },
    CommandEntry {
        index: CommandIndex::UpdateConfig as u8,
        handler: &UpdateConfig,
    },
    CommandEntry {
        index: CommandIndex::SaveConfig as u8,
        handler: &SaveConfig,
    },
    CommandEntry {
        index: CommandIndex::ReadConfig as u8,
        handler: &ReadConfig,
    },
];

/// Chooses the boot argument for leaving the bootloader: start the
/// application if its CRC matches the configured one, otherwise stay in the
/// bootloader with the timeout disabled.
pub fn application_boot_arg<F: Flash + ?Sized>(
    flash: &F,
    layout: &MemoryLayout,
    config: &BootConfig,
) -> BootArg {
    let image = match flash.read(layout.application.base, config.application_size) {
        Ok(image) => image,
        Err(e) => {
            warn!("Cannot read application image: {}", e);
            return BootArg::StartBootloaderNoTimeout;
        }
    };

    let crc = crc32fast::hash(image);
    if crc == config.application_crc {
        BootArg::StartApplication
    } else {
        warn!(
            "Application CRC mismatch: computed {:#010x}, expected {:#010x}",
            crc, config.application_crc
        );
        BootArg::StartBootloaderNoTimeout
    }
}

/// Checks the target of an erase or write. Refusals are logged, not errors.
fn flash_target_allowed(ctx: &NodeContext<'_>, addr: u32, len: u32, device_class: &str) -> bool {
    let app = ctx.layout.application;
    if !app.contains(addr) || !app.contains_range(addr, len) {
        debug!("Refusing flash access at {:#010x}+{} outside {}", addr, len, app);
        return false;
    }
    if device_class != ctx.config.device_class {
        debug!(
            "Refusing flash access for device class {:?} (node is {:?})",
            device_class, ctx.config.device_class
        );
        return false;
    }
    true
}

/// The flash page an erase at `addr` would clear.
fn page_containing(layout: &MemoryLayout, addr: u32) -> Option<(u32, u32)> {
    let offset = addr.checked_sub(layout.flash.base)?;
    let start = offset.checked_div(layout.page_size)? * layout.page_size;
    Some((layout.flash.base + start, layout.page_size))
}

fn write_optional_uint(value: Option<u32>, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
    match value {
        Some(value) => out.write_uint(u64::from(value)),
        None => out.write_bool(false),
    }
}

/// Checks the application CRC and requests a reboot accordingly.
pub struct JumpToApplication;

impl Command for JumpToApplication {
    const NAME: &'static str = "jump_to_application";
    const ARGC: u32 = 0;
    type Args<'a> = ();
    type Reply = ();

    fn decode_args<'a>(_reader: &mut ValueReader<'a>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn execute(_args: (), ctx: &mut NodeContext<'_>) {
        let arg = application_boot_arg(&*ctx.flash, ctx.layout, ctx.config);
        info!("Leaving bootloader: {:?}", arg);
        ctx.reboot = Some(arg);
    }

    fn encode_reply(_reply: &(), _out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        Ok(())
    }

    fn refuse(_out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// CRC32 of an address range. Replies `false` if the range is unreadable.
pub struct CrcRegion;

impl Command for CrcRegion {
    const NAME: &'static str = "crc_region";
    const ARGC: u32 = 2;
    type Args<'a> = (u32, u32);
    type Reply = Option<u32>;

    fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<(u32, u32), ProtocolError> {
        Ok((reader.read_u32()?, reader.read_u32()?))
    }

    fn execute((addr, len): (u32, u32), ctx: &mut NodeContext<'_>) -> Option<u32> {
        ctx.flash.read(addr, len).ok().map(crc32fast::hash)
    }

    fn encode_reply(reply: &Option<u32>, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        write_optional_uint(*reply, out)
    }
}

/// Erases one application page.
pub struct EraseFlashPage;

impl Command for EraseFlashPage {
    const NAME: &'static str = "erase_flash_page";
    const ARGC: u32 = 2;
    type Args<'a> = (u32, &'a str);
    type Reply = bool;

    fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<(u32, &'a str), ProtocolError> {
        Ok((reader.read_u32()?, reader.read_str()?))
    }

    fn execute((addr, device_class): (u32, &str), ctx: &mut NodeContext<'_>) -> bool {
        // The whole page goes, so all of it must lie in the application.
        let Some((page, page_len)) = page_containing(ctx.layout, addr) else {
            debug!("Refusing erase at {:#010x} outside flash", addr);
            return false;
        };
        if !flash_target_allowed(ctx, page, page_len, device_class) {
            return false;
        }

        ctx.flash.unlock();
        let result = ctx.flash.erase_page(addr);
        ctx.flash.lock();

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Erase at {:#010x} failed: {}", addr, e);
                false
            }
        }
    }

    fn encode_reply(reply: &bool, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(*reply)
    }
}

/// Programs data into the application region and reads it back.
pub struct WriteFlash;

impl Command for WriteFlash {
    const NAME: &'static str = "write_flash";
    const ARGC: u32 = 3;
    type Args<'a> = (u32, &'a str, &'a [u8]);
    type Reply = bool;

    fn decode_args<'a>(
        reader: &mut ValueReader<'a>,
    ) -> Result<(u32, &'a str, &'a [u8]), ProtocolError> {
        Ok((reader.read_u32()?, reader.read_str()?, reader.read_bin()?))
    }

    fn execute((addr, device_class, data): (u32, &str, &[u8]), ctx: &mut NodeContext<'_>) -> bool {
        if !flash_target_allowed(ctx, addr, data.len() as u32, device_class) {
            return false;
        }

        ctx.flash.unlock();
        let result = ctx.flash.write(addr, data);
        ctx.flash.lock();

        if let Err(e) = result {
            warn!("Write at {:#010x} failed: {}", addr, e);
            return false;
        }
        match ctx.flash.read(addr, data.len() as u32) {
            Ok(written) if written == data => true,
            _ => {
                warn!("Write at {:#010x} did not verify", addr);
                false
            }
        }
    }

    fn encode_reply(reply: &bool, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(*reply)
    }
}

/// Always replies `true`.
pub struct Ping;

impl Command for Ping {
    const NAME: &'static str = "ping";
    const ARGC: u32 = 0;
    type Args<'a> = ();
    type Reply = bool;

    fn decode_args<'a>(_reader: &mut ValueReader<'a>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn execute(_args: (), _ctx: &mut NodeContext<'_>) -> bool {
        true
    }

    fn encode_reply(reply: &bool, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(*reply)
    }
}

/// Reads an address range. Replies `false` if the range is unreadable or
/// does not fit in the reply.
pub struct ReadFlash;

impl Command for ReadFlash {
    const NAME: &'static str = "read_flash";
    const ARGC: u32 = 2;
    type Args<'a> = (u32, u32);
    type Reply = Option<Vec<u8>>;

    fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<(u32, u32), ProtocolError> {
        Ok((reader.read_u32()?, reader.read_u32()?))
    }

    fn execute((addr, len): (u32, u32), ctx: &mut NodeContext<'_>) -> Option<Vec<u8>> {
        ctx.flash.read(addr, len).ok().map(<[u8]>::to_vec)
    }

    fn encode_reply(reply: &Option<Vec<u8>>, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        match reply {
            // bin32 header is 5 bytes
            Some(data) if data.len() + 5 <= out.remaining() => out.write_bin(data),
            _ => out.write_bool(false),
        }
    }
}

/// Merges the given fields into the RAM copy of the config.
pub struct UpdateConfig;

impl Command for UpdateConfig {
    const NAME: &'static str = "update_config";
    const ARGC: u32 = 1;
    type Args<'a> = ConfigPatch;
    type Reply = bool;

    fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<ConfigPatch, ProtocolError> {
        ConfigPatch::decode(reader.as_read())
            .map_err(|e| ProtocolError::MalformedValue(e.to_string()))
    }

    fn execute(patch: ConfigPatch, ctx: &mut NodeContext<'_>) -> bool {
        match ctx.config.apply(&patch) {
            Ok(()) => true,
            Err(e) => {
                warn!("Config update refused: {}", e);
                false
            }
        }
    }

    fn encode_reply(reply: &bool, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(*reply)
    }
}

/// Commits the RAM config to both config pages.
pub struct SaveConfig;

impl Command for SaveConfig {
    const NAME: &'static str = "save_config";
    const ARGC: u32 = 0;
    type Args<'a> = ();
    type Reply = bool;

    fn decode_args<'a>(_reader: &mut ValueReader<'a>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn execute(_args: (), ctx: &mut NodeContext<'_>) -> bool {
        ctx.store.commit(&mut *ctx.flash, &mut *ctx.config).is_ok()
    }

    fn encode_reply(reply: &bool, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(*reply)
    }
}

/// Replies with the whole RAM config.
pub struct ReadConfig;

impl Command for ReadConfig {
    const NAME: &'static str = "read_config";
    const ARGC: u32 = 0;
    type Args<'a> = ();
    type Reply = BootConfig;

    fn decode_args<'a>(_reader: &mut ValueReader<'a>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn execute(_args: (), ctx: &mut NodeContext<'_>) -> BootConfig {
        ctx.config.clone()
    }

    fn encode_reply(reply: &BootConfig, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_named(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::dispatch;
    use canboot_hal::{Region, SimFlash};
    use canboot_protocol::{encode_command, Arg};
    use canboot_storage::{ConfigSource, ConfigStore, MAX_STRING_LEN};

    const CLASS: &str = "canboot-sim";

    struct Node {
        config: BootConfig,
        flash: SimFlash,
        layout: MemoryLayout,
        store: ConfigStore,
        reboot: Option<BootArg>,
    }

    impl Node {
        fn new() -> Self {
            let layout = MemoryLayout::default();
            Self {
                config: BootConfig::fallback(CLASS),
                flash: SimFlash::new(layout.flash, layout.page_size),
                store: ConfigStore::from_layout(&layout),
                layout,
                reboot: None,
            }
        }

        fn app(&self) -> u32 {
            self.layout.application.base
        }

        fn run(&mut self, command: CommandIndex, args: &[Arg<'_>]) -> Vec<u8> {
            let payload = encode_command(command, args).unwrap();
            let mut out = vec![0u8; self.layout.page_size as usize + 128];
            let mut ctx = NodeContext {
                config: &mut self.config,
                flash: &mut self.flash,
                layout: &self.layout,
                store: &self.store,
                reboot: None,
            };
            let written = dispatch(&payload, &DEFAULT_COMMANDS, &mut out, &mut ctx).unwrap();
            self.reboot = ctx.reboot;
            out.truncate(written);
            out
        }

        fn run_bool(&mut self, command: CommandIndex, args: &[Arg<'_>]) -> bool {
            let reply = self.run(command, args);
            ValueReader::new(&reply).read_bool().unwrap()
        }
    }

    #[test]
    fn test_table_covers_every_index() {
        for command in CommandIndex::ALL {
            let entry = DEFAULT_COMMANDS
                .iter()
                .find(|e| e.index == command.as_u8())
                .unwrap();
            assert_eq!(entry.handler.name(), command.name());
        }
    }

    #[test]
    fn test_ping() {
        let mut node = Node::new();
        assert_eq!(node.run(CommandIndex::Ping, &[]), vec![0xc3]);
    }

    #[test]
    fn test_jump_with_matching_crc_starts_application() {
        let mut node = Node::new();
        let app = node.app();
        let image = b"application image";
        node.flash.load(app, image).unwrap();
        node.config.application_size = image.len() as u32;
        node.config.application_crc = crc32fast::hash(image);

        let reply = node.run(CommandIndex::JumpToApplication, &[]);
        assert!(reply.is_empty());
        assert_eq!(node.reboot, Some(BootArg::StartApplication));
    }

    #[test]
    fn test_jump_with_bad_crc_stays_in_bootloader() {
        let mut node = Node::new();
        node.config.application_size = 16;

        node.run(CommandIndex::JumpToApplication, &[]);
        assert_eq!(node.reboot, Some(BootArg::StartBootloaderNoTimeout));
    }

    #[test]
    fn test_crc_region() {
        let mut node = Node::new();
        let app = node.app();
        node.flash.load(app, &[1, 2, 3, 4]).unwrap();

        let reply = node.run(CommandIndex::CrcRegion, &[Arg::Uint(u64::from(app)), Arg::Uint(4)]);
        let crc = ValueReader::new(&reply).read_u32().unwrap();
        assert_eq!(crc, crc32fast::hash(&[1, 2, 3, 4]));

        let reply = node.run(CommandIndex::CrcRegion, &[Arg::Uint(0), Arg::Uint(4)]);
        assert_eq!(reply, vec![0xc2]);
    }

    #[test]
    fn test_erase_page() {
        let mut node = Node::new();
        let app = node.app();
        node.flash.load(app, &[0; 4]).unwrap();

        assert!(node.run_bool(
            CommandIndex::EraseFlashPage,
            &[Arg::Uint(u64::from(app)), Arg::Str(CLASS)]
        ));
        assert_eq!(node.flash.read(app, 4).unwrap(), &[0xff; 4]);
        assert!(node.flash.is_locked());
    }

    #[test]
    fn test_erase_refuses_outside_application() {
        let mut node = Node::new();
        let below = node.layout.application.base - 1;
        let end = node.layout.application.end() as u32;
        let page = node.layout.config_pages[0].base;

        for addr in [below, end, page] {
            assert!(!node.run_bool(
                CommandIndex::EraseFlashPage,
                &[Arg::Uint(u64::from(addr)), Arg::Str(CLASS)]
            ));
        }
        assert_eq!(node.flash.erase_count(), 0);
    }

    #[test]
    fn test_erase_refuses_wrong_device_class() {
        let mut node = Node::new();
        let app = node.app();
        assert!(!node.run_bool(
            CommandIndex::EraseFlashPage,
            &[Arg::Uint(u64::from(app)), Arg::Str("other-board")]
        ));
        assert_eq!(node.flash.erase_count(), 0);
    }

    #[test]
    fn test_erase_refuses_page_shared_with_bootloader() {
        let mut node = Node::new();
        let page = node.layout.page_size;
        let app = node.layout.application;
        node.layout.application = Region::new(app.base + 0x100, app.len - 0x100);
        node.flash.load(app.base, &[0; 4]).unwrap();

        assert!(!node.run_bool(
            CommandIndex::EraseFlashPage,
            &[Arg::Uint(u64::from(app.base + 0x100)), Arg::Str(CLASS)]
        ));
        assert_eq!(node.flash.read(app.base, 4).unwrap(), &[0; 4]);
        assert_eq!(node.flash.erase_count(), 0);

        assert!(node.run_bool(
            CommandIndex::EraseFlashPage,
            &[Arg::Uint(u64::from(app.base + page)), Arg::Str(CLASS)]
        ));
    }

    #[test]
    fn test_erase_accepts_unaligned_address_in_application_page() {
        let mut node = Node::new();
        let app = node.app();
        node.flash.load(app, &[0; 4]).unwrap();

        assert!(node.run_bool(
            CommandIndex::EraseFlashPage,
            &[Arg::Uint(u64::from(app + 0x10)), Arg::Str(CLASS)]
        ));
        assert_eq!(node.flash.read(app, 4).unwrap(), &[0xff; 4]);
    }

    #[test]
    fn test_write_flash() {
        let mut node = Node::new();
        let app = node.app();

        assert!(node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(app)), Arg::Str(CLASS), Arg::Bin(b"firmware")]
        ));
        assert_eq!(node.flash.read(app, 8).unwrap(), b"firmware");
    }

    #[test]
    fn test_write_flash_refusals() {
        let mut node = Node::new();
        let app = node.app();
        let last = node.layout.application.end() as u32 - 2;

        assert!(!node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(app)), Arg::Str("dummy"), Arg::Bin(b"x")]
        ));
        assert!(!node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(last)), Arg::Str(CLASS), Arg::Bin(b"four")]
        ));
        assert!(!node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(app - 4)), Arg::Str(CLASS), Arg::Bin(b"x")]
        ));
        assert_eq!(node.flash.write_count(), 0);
    }

    #[test]
    fn test_write_over_unerased_flash_fails_verification() {
        let mut node = Node::new();
        let app = node.app();
        node.flash.load(app, &[0x00]).unwrap();

        assert!(!node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(app)), Arg::Str(CLASS), Arg::Bin(&[0xff])]
        ));
    }

    #[test]
    fn test_write_with_missing_args_is_refused() {
        let mut node = Node::new();
        let app = node.app();
        assert!(!node.run_bool(
            CommandIndex::WriteFlash,
            &[Arg::Uint(u64::from(app)), Arg::Str(CLASS)]
        ));
        assert_eq!(node.flash.write_count(), 0);
    }

    #[test]
    fn test_read_flash() {
        let mut node = Node::new();
        let app = node.app();
        node.flash.load(app, b"abcdef").unwrap();

        let reply = node.run(CommandIndex::ReadFlash, &[Arg::Uint(u64::from(app + 1)), Arg::Uint(3)]);
        assert_eq!(ValueReader::new(&reply).read_bin().unwrap(), b"bcd");

        let reply = node.run(CommandIndex::ReadFlash, &[Arg::Uint(0), Arg::Uint(3)]);
        assert_eq!(reply, vec![0xc2]);
    }

    #[test]
    fn test_read_flash_too_large_for_reply() {
        let mut node = Node::new();
        let app = node.app();
        let len = node.layout.page_size * 2;
        let reply = node.run(CommandIndex::ReadFlash, &[Arg::Uint(u64::from(app)), Arg::Uint(u64::from(len))]);
        assert_eq!(reply, vec![0xc2]);
    }

    fn patch(patch: ConfigPatch) -> Vec<u8> {
        patch.encode().unwrap()
    }

    #[test]
    fn test_update_config() {
        let mut node = Node::new();
        let update = patch(ConfigPatch {
            board_name: Some("motor".to_string()),
            id: Some(12),
            ..Default::default()
        });

        assert!(node.run_bool(CommandIndex::UpdateConfig, &[Arg::Raw(&update)]));
        assert_eq!(node.config.board_name, "motor");
        assert_eq!(node.config.id, 12);
        assert_eq!(node.config.device_class, CLASS);
    }

    #[test]
    fn test_update_config_refuses_long_strings() {
        let mut node = Node::new();
        let update = patch(ConfigPatch {
            board_name: Some("n".repeat(MAX_STRING_LEN + 1)),
            ..Default::default()
        });

        assert!(!node.run_bool(CommandIndex::UpdateConfig, &[Arg::Raw(&update)]));
        assert_eq!(node.config.board_name, "foobar2000");
    }

    #[test]
    fn test_update_config_refuses_non_map() {
        let mut node = Node::new();
        assert!(!node.run_bool(CommandIndex::UpdateConfig, &[Arg::Uint(3)]));
    }

    #[test]
    fn test_save_config() {
        let mut node = Node::new();
        node.config.board_name = "saved".to_string();

        assert!(node.run_bool(CommandIndex::SaveConfig, &[]));
        assert_eq!(node.config.update_count, 2);

        let outcome = node.store.load(&node.flash, &BootConfig::fallback(CLASS));
        assert_eq!(outcome.source, ConfigSource::Page1);
        assert_eq!(outcome.config.board_name, "saved");
    }

    #[test]
    fn test_save_config_reports_flash_failure() {
        let mut node = Node::new();
        node.flash.set_power_loss_after(Some(0));
        assert!(!node.run_bool(CommandIndex::SaveConfig, &[]));
    }

    #[test]
    fn test_read_config() {
        let mut node = Node::new();
        let reply = node.run(CommandIndex::ReadConfig, &[]);

        let decoded = ConfigPatch::decode(&mut reply.as_slice()).unwrap();
        assert_eq!(decoded, ConfigPatch::from(&node.config));
    }
}
