//! Command dispatch.
//!
//! A command payload is `[version][index][args array]`. The dispatcher checks
//! the version, finds the index in a static table and hands the argument
//! reader to the matching handler, which writes its reply into a caller-owned
//! buffer.

use crate::error::DispatchError;
use canboot_hal::{BootArg, Flash, MemoryLayout};
use canboot_protocol::{ProtocolError, ValueReader, COMMAND_SET_VERSION};
use canboot_storage::{BootConfig, ConfigStore};
use serde::Serialize;
use std::io::Cursor;
use tracing::debug;

/// Node state a command may read or change.
pub struct NodeContext<'a> {
    pub config: &'a mut BootConfig,
    pub flash: &'a mut dyn Flash,
    pub layout: &'a MemoryLayout,
    pub store: &'a ConfigStore,
    /// Set by a command that wants the node to reboot after replying.
    pub reboot: Option<BootArg>,
}

/// Writes reply values into a fixed output buffer.
pub struct ReplyWriter<'a> {
    cursor: Cursor<&'a mut [u8]>,
}

impl<'a> ReplyWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            cursor: Cursor::new(buf),
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Bytes still free.
    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), DispatchError> {
        rmp::encode::write_bool(&mut self.cursor, value).map_err(|_| DispatchError::ReplyOverflow)
    }

    pub fn write_uint(&mut self, value: u64) -> Result<(), DispatchError> {
        rmp::encode::write_uint(&mut self.cursor, value)
            .map(|_| ())
            .map_err(|_| DispatchError::ReplyOverflow)
    }

    pub fn write_bin(&mut self, value: &[u8]) -> Result<(), DispatchError> {
        rmp::encode::write_bin(&mut self.cursor, value).map_err(|_| DispatchError::ReplyOverflow)
    }

    /// Writes a serde value as a MessagePack map with named keys.
    pub fn write_named<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), DispatchError> {
        rmp_serde::encode::write_named(&mut self.cursor, value)
            .map_err(|_| DispatchError::ReplyOverflow)
    }
}

/// One bootloader command.
///
/// Arguments are decoded before anything runs, so a command whose arguments
/// are missing or malformed never touches node state.
pub trait Command {
    const NAME: &'static str;

    /// Number of arguments the command reads.
    const ARGC: u32;

    type Args<'a>;
    type Reply;

    fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<Self::Args<'a>, ProtocolError>;

    fn execute(args: Self::Args<'_>, ctx: &mut NodeContext<'_>) -> Self::Reply;

    fn encode_reply(reply: &Self::Reply, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError>;

    /// Reply sent when the arguments cannot be used.
    fn refuse(out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
        out.write_bool(false)
    }
}

/// Type-erased command, as stored in the command table.
pub trait Handler {
    fn name(&self) -> &'static str;

    /// Runs the command with `argc` declared arguments.
    ///
    /// Fewer arguments than the command needs is refused without running it.
    /// Extra arguments are left unread.
    fn call(
        &self,
        argc: u32,
        args: &mut ValueReader<'_>,
        out: &mut ReplyWriter<'_>,
        ctx: &mut NodeContext<'_>,
    ) -> Result<(), DispatchError>;
}

impl<C: Command> Handler for C {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn call(
        &self,
        argc: u32,
        args: &mut ValueReader<'_>,
        out: &mut ReplyWriter<'_>,
        ctx: &mut NodeContext<'_>,
    ) -> Result<(), DispatchError> {
        if argc < C::ARGC {
            debug!("{}: expected {} arguments, got {}", C::NAME, C::ARGC, argc);
            return C::refuse(out);
        }
        if argc > C::ARGC {
            debug!("{}: ignoring {} extra arguments", C::NAME, argc - C::ARGC);
        }

        let decoded = match C::decode_args(args) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("{}: bad arguments: {}", C::NAME, e);
                return C::refuse(out);
            }
        };
        let reply = C::execute(decoded, ctx);
        C::encode_reply(&reply, out)
    }
}

/// Command table entry.
#[derive(Clone, Copy)]
pub struct CommandEntry {
    pub index: u8,
    pub handler: &'static (dyn Handler + Sync),
}

impl std::fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEntry")
            .field("index", &self.index)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Decodes and runs the command in `payload`.
///
/// Returns the number of reply bytes written to `out`; zero is a valid
/// result for commands without a reply. On error nothing was executed and
/// `out` holds no reply. The first entry with a matching index wins.
pub fn dispatch(
    payload: &[u8],
    table: &[CommandEntry],
    out: &mut [u8],
    ctx: &mut NodeContext<'_>,
) -> Result<usize, DispatchError> {
    let mut reader = ValueReader::new(payload);

    let version = read_version(&mut reader)?;
    if version != i128::from(COMMAND_SET_VERSION) {
        return Err(DispatchError::VersionMismatch {
            expected: COMMAND_SET_VERSION,
            actual: version,
        });
    }

    let index = reader
        .read_i64()
        .map_err(|_| DispatchError::InvalidCommand)?;

    // No argument array means no arguments.
    let argc = reader.try_read_array_len().unwrap_or(0);

    let entry = table
        .iter()
        .find(|entry| i64::from(entry.index) == index)
        .ok_or(DispatchError::CommandNotFound(index))?;

    debug!("Dispatching {} with {} arguments", entry.handler.name(), argc);
    let mut writer = ReplyWriter::new(out);
    entry.handler.call(argc, &mut reader, &mut writer, ctx)?;
    Ok(writer.position())
}

/// Reads the command-set version, which may be sent signed or unsigned.
fn read_version(reader: &mut ValueReader<'_>) -> Result<i128, DispatchError> {
    let mut unsigned = *reader;
    if let Ok(version) = unsigned.read_u64() {
        *reader = unsigned;
        return Ok(i128::from(version));
    }
    reader
        .read_i64()
        .map(i128::from)
        .map_err(|_| DispatchError::InvalidCommand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canboot_hal::{Region, SimFlash};
    use canboot_protocol::{encode_envelope, Arg};
    use proptest::prelude::*;

    struct Echo;

    impl Command for Echo {
        const NAME: &'static str = "echo";
        const ARGC: u32 = 1;
        type Args<'a> = &'a [u8];
        type Reply = Vec<u8>;

        fn decode_args<'a>(reader: &mut ValueReader<'a>) -> Result<&'a [u8], ProtocolError> {
            reader.read_bin()
        }

        fn execute(args: &[u8], _ctx: &mut NodeContext<'_>) -> Vec<u8> {
            args.to_vec()
        }

        fn encode_reply(reply: &Vec<u8>, out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
            out.write_bin(reply)
        }
    }

    struct Silent;

    impl Command for Silent {
        const NAME: &'static str = "silent";
        const ARGC: u32 = 0;
        type Args<'a> = ();
        type Reply = ();

        fn decode_args<'a>(_reader: &mut ValueReader<'a>) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn execute(_args: (), ctx: &mut NodeContext<'_>) {
            ctx.config.update_count += 1;
        }

        fn encode_reply(_reply: &(), _out: &mut ReplyWriter<'_>) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    static TABLE: [CommandEntry; 3] = [
        CommandEntry {
            index: 1,
            handler: &Silent,
        },
        CommandEntry {
            index: 3,
            handler: &Echo,
        },
        CommandEntry {
            index: 3,
            handler: &Silent,
        },
    ];

    struct Fixture {
        config: BootConfig,
        flash: SimFlash,
        layout: MemoryLayout,
        store: ConfigStore,
    }

    impl Fixture {
        fn new() -> Self {
            let layout = MemoryLayout::default();
            Self {
                config: BootConfig::fallback("canboot-sim"),
                flash: SimFlash::new(layout.flash, layout.page_size),
                store: ConfigStore::from_layout(&layout),
                layout,
            }
        }

        fn run(&mut self, payload: &[u8], out: &mut [u8]) -> Result<usize, DispatchError> {
            let mut ctx = NodeContext {
                config: &mut self.config,
                flash: &mut self.flash,
                layout: &self.layout,
                store: &self.store,
                reboot: None,
            };
            dispatch(payload, &TABLE, out, &mut ctx)
        }
    }

    #[test]
    fn test_dispatch_runs_matching_handler() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 3, Some(&[Arg::Bin(b"abc")])).unwrap();
        let mut out = [0u8; 16];

        let written = fixture.run(&payload, &mut out).unwrap();
        assert_eq!(&out[..written], &[0xc4, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_zero_byte_reply_is_success() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 1, Some(&[])).unwrap();

        assert_eq!(fixture.run(&payload, &mut [0u8; 4]), Ok(0));
        assert_eq!(fixture.config.update_count, 2);
    }

    #[test]
    fn test_missing_args_header_means_no_args() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 1, None).unwrap();
        assert_eq!(fixture.run(&payload, &mut [0u8; 4]), Ok(0));

        // A command that needs an argument refuses instead.
        let payload = encode_envelope(2, 3, None).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(fixture.run(&payload, &mut out), Ok(1));
        assert_eq!(out[0], 0xc2);
    }

    #[test]
    fn test_version_mismatch() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(1, 3, Some(&[Arg::Bin(b"abc")])).unwrap();
        let mut out = [0u8; 16];

        assert_eq!(
            fixture.run(&payload, &mut out),
            Err(DispatchError::VersionMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn test_version_mismatch_outside_i64_range() {
        let mut fixture = Fixture::new();

        let payload = encode_envelope(u64::MAX, 5, None).unwrap();
        assert_eq!(
            fixture.run(&payload, &mut [0u8; 8]),
            Err(DispatchError::VersionMismatch {
                expected: 2,
                actual: i128::from(u64::MAX)
            })
        );

        let mut payload = Vec::new();
        rmp::encode::write_sint(&mut payload, -1).unwrap();
        rmp::encode::write_uint(&mut payload, 5).unwrap();
        assert_eq!(
            fixture.run(&payload, &mut [0u8; 8]),
            Err(DispatchError::VersionMismatch {
                expected: 2,
                actual: -1
            })
        );
    }

    #[test]
    fn test_command_not_found() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 42, Some(&[])).unwrap();
        assert_eq!(
            fixture.run(&payload, &mut [0u8; 4]),
            Err(DispatchError::CommandNotFound(42))
        );
        assert_eq!(fixture.config.update_count, 1);
    }

    #[test]
    fn test_invalid_command() {
        let mut fixture = Fixture::new();
        assert_eq!(
            fixture.run(&[], &mut [0u8; 4]),
            Err(DispatchError::InvalidCommand)
        );
        // Version present, index missing.
        assert_eq!(
            fixture.run(&[0x02], &mut [0u8; 4]),
            Err(DispatchError::InvalidCommand)
        );
        // Index is a string.
        assert_eq!(
            fixture.run(&[0x02, 0xa1, b'x'], &mut [0u8; 4]),
            Err(DispatchError::InvalidCommand)
        );
    }

    #[test]
    fn test_first_matching_entry_wins() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 3, Some(&[Arg::Bin(b"x")])).unwrap();
        fixture.run(&payload, &mut [0u8; 8]).unwrap();
        assert_eq!(fixture.config.update_count, 1);
    }

    #[test]
    fn test_extra_args_are_ignored() {
        let mut fixture = Fixture::new();
        let payload =
            encode_envelope(2, 3, Some(&[Arg::Bin(b"x"), Arg::Uint(9), Arg::Bool(true)])).unwrap();
        let mut out = [0u8; 8];
        let written = fixture.run(&payload, &mut out).unwrap();
        assert_eq!(&out[..written], &[0xc4, 1, b'x']);
    }

    #[test]
    fn test_malformed_args_are_refused() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 3, Some(&[Arg::Uint(5)])).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(fixture.run(&payload, &mut out), Ok(1));
        assert_eq!(out[0], 0xc2);
    }

    #[test]
    fn test_reply_overflow() {
        let mut fixture = Fixture::new();
        let payload = encode_envelope(2, 3, Some(&[Arg::Bin(&[7u8; 32])])).unwrap();
        assert_eq!(
            fixture.run(&payload, &mut [0u8; 8]),
            Err(DispatchError::ReplyOverflow)
        );
    }

    #[test]
    fn test_reply_writer() {
        let mut buf = [0u8; 4];
        let mut writer = ReplyWriter::new(&mut buf);
        writer.write_uint(300).unwrap();
        assert_eq!(writer.position(), 3);
        assert_eq!(writer.remaining(), 1);
        writer.write_bool(true).unwrap();
        assert_eq!(writer.write_bool(true), Err(DispatchError::ReplyOverflow));
        assert_eq!(buf, [0xcd, 0x01, 0x2c, 0xc3]);
    }

    #[test]
    fn test_command_entry_debug() {
        let debug = format!("{:?}", TABLE[1]);
        assert!(debug.contains("echo"));
    }

    #[test]
    fn test_context_accepts_any_flash() {
        let layout = MemoryLayout::default();
        let mut flash = SimFlash::new(Region::new(layout.flash.base, layout.flash.len), 0x800);
        let mut config = BootConfig::fallback("x");
        let store = ConfigStore::from_layout(&layout);
        let mut ctx = NodeContext {
            config: &mut config,
            flash: &mut flash,
            layout: &layout,
            store: &store,
            reboot: None,
        };
        let payload = encode_envelope(2, 1, None).unwrap();
        assert_eq!(dispatch(&payload, &TABLE, &mut [], &mut ctx), Ok(0));
    }

    proptest! {
        #[test]
        fn prop_wrong_version_always_rejected(
            version in 0u64..1000,
            rest in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            prop_assume!(version != u64::from(COMMAND_SET_VERSION));
            let mut payload = encode_envelope(version, 1, None).unwrap();
            payload.truncate(payload.len() - 1);
            payload.extend_from_slice(&rest);

            let mut fixture = Fixture::new();
            let result = fixture.run(&payload, &mut [0u8; 64]);
            prop_assert_eq!(result, Err(DispatchError::VersionMismatch {
                expected: COMMAND_SET_VERSION,
                actual: i128::from(version),
            }));
        }

        #[test]
        fn prop_unknown_index_not_found(index in 4u64..10_000) {
            let payload = encode_envelope(2, index, Some(&[])).unwrap();
            let mut fixture = Fixture::new();
            prop_assert_eq!(
                fixture.run(&payload, &mut [0u8; 8]),
                Err(DispatchError::CommandNotFound(index as i64))
            );
        }
    }
}
