//! Command envelopes.
//!
//! A command travels as the data of a datagram, encoded as MessagePack:
//!
//! ```text
//! [command_set_version: int][command_index: int][args: array]
//! ```
//!
//! Replies carry no envelope, only the values the handler wrote.

use crate::error::ProtocolError;
use crate::COMMAND_SET_VERSION;
use std::fmt;

/// Indexes of the commands understood by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandIndex {
    JumpToApplication = 1,
    CrcRegion = 2,
    EraseFlashPage = 3,
    WriteFlash = 4,
    Ping = 5,
    ReadFlash = 6,
    UpdateConfig = 7,
    SaveConfig = 8,
    ReadConfig = 9,
}

impl CommandIndex {
    pub const ALL: [CommandIndex; 9] = [
        CommandIndex::JumpToApplication,
        CommandIndex::CrcRegion,
        CommandIndex::EraseFlashPage,
        CommandIndex::WriteFlash,
        CommandIndex::Ping,
        CommandIndex::ReadFlash,
        CommandIndex::UpdateConfig,
        CommandIndex::SaveConfig,
        CommandIndex::ReadConfig,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandIndex::JumpToApplication => "jump_to_application",
            CommandIndex::CrcRegion => "crc_region",
            CommandIndex::EraseFlashPage => "erase_flash_page",
            CommandIndex::WriteFlash => "write_flash",
            CommandIndex::Ping => "ping",
            CommandIndex::ReadFlash => "read_flash",
            CommandIndex::UpdateConfig => "update_config",
            CommandIndex::SaveConfig => "save_config",
            CommandIndex::ReadConfig => "read_config",
        }
    }
}

impl TryFrom<u8> for CommandIndex {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        CommandIndex::ALL
            .iter()
            .copied()
            .find(|c| c.as_u8() == value)
            .ok_or(value)
    }
}

impl fmt::Display for CommandIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Uint(u64),
    Bool(bool),
    Str(&'a str),
    Bin(&'a [u8]),
    /// A value that is already MessagePack-encoded (e.g. a config map).
    Raw(&'a [u8]),
}

impl Arg<'_> {
    /// Appends the encoded value to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match *self {
            Arg::Uint(v) => {
                rmp::encode::write_uint(buf, v)?;
            }
            Arg::Bool(v) => rmp::encode::write_bool(buf, v)?,
            Arg::Str(s) => rmp::encode::write_str(buf, s)?,
            Arg::Bin(b) => rmp::encode::write_bin(buf, b)?,
            Arg::Raw(raw) => buf.extend_from_slice(raw),
        }
        Ok(())
    }
}

/// Encodes an envelope with an explicit version.
///
/// `args: None` omits the argument array entirely, which the bootloader
/// treats as zero arguments.
pub fn encode_envelope(
    version: u64,
    index: u64,
    args: Option<&[Arg<'_>]>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(16);
    rmp::encode::write_uint(&mut buf, version)?;
    rmp::encode::write_uint(&mut buf, index)?;
    if let Some(args) = args {
        rmp::encode::write_array_len(&mut buf, args.len() as u32)?;
        for arg in args {
            arg.encode(&mut buf)?;
        }
    }
    Ok(buf)
}

/// Encodes a command for the current command set version.
pub fn encode_command(index: CommandIndex, args: &[Arg<'_>]) -> Result<Vec<u8>, ProtocolError> {
    encode_envelope(
        u64::from(COMMAND_SET_VERSION),
        u64::from(index.as_u8()),
        Some(args),
    )
}
