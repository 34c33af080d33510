//! # canboot-protocol
//!
//! Wire protocol for the canboot CAN bootloader.
//!
//! This crate provides:
//! - Byte-incremental datagram reader and writer with CRC32 validation
//! - Transport frames of at most 8 bytes and the start-of-datagram marker
//! - Splitting datagrams into frames and reassembling them per source node
//! - Command envelope encoding and a zero-copy argument reader

pub mod codec;
pub mod command;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod value;

pub use codec::{FrameSplitter, Reassembler};
pub use command::{encode_command, encode_envelope, Arg, CommandIndex};
pub use datagram::{Datagram, DATAGRAM_HEADER_SIZE, MAX_DESTINATIONS};
pub use error::ProtocolError;
pub use frame::{Frame, FRAME_WIRE_HEADER_SIZE};
pub use value::ValueReader;

/// Datagram framing version supported by this implementation.
pub const DATAGRAM_VERSION: u8 = 1;

/// Command envelope version supported by this implementation.
pub const COMMAND_SET_VERSION: u8 = 2;

/// Frame identifier bit marking the first fragment of a datagram.
pub const START_OF_DATAGRAM_MASK: u32 = 1 << 7;

/// Frame identifier bits carrying the sender's node id.
pub const NODE_ID_MASK: u32 = 0x7f;

/// Maximum payload of one transport frame.
pub const MAX_FRAME_DATA: usize = 8;

/// Highest node id that fits in a frame identifier.
pub const MAX_NODE_ID: u8 = 127;

/// Returns true if the identifier marks the first fragment of a datagram.
pub fn is_start_of_datagram(id: u32) -> bool {
    id & START_OF_DATAGRAM_MASK != 0
}

/// Extracts the sender's node id from a frame identifier.
pub fn source_id(id: u32) -> u8 {
    (id & NODE_ID_MASK) as u8
}
