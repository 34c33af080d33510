//! Transport frames.
//!
//! A frame is one bus message: an identifier and up to 8 data bytes. On the
//! virtual bus each frame travels in its own UDP packet:
//!
//! ```text
//! +---------+--------+------------+
//! | id      | len    | data       |
//! | 4 bytes | 1 byte | len <= 8   |
//! +---------+--------+------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_FRAME_DATA;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the frame header on the virtual bus (id + len).
pub const FRAME_WIRE_HEADER_SIZE: usize = 5;

/// A single transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Frame identifier. Bit 7 is the start-of-datagram marker, the low 7
    /// bits carry the sender's node id.
    pub id: u32,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
}

impl Frame {
    /// Creates a new frame, failing if `data` exceeds 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_FRAME_DATA {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Creates a frame from a full buffer of which the first `len` bytes are used.
    pub(crate) fn from_buffer(id: u32, data: [u8; MAX_FRAME_DATA], len: usize) -> Self {
        Self {
            id,
            len: len.min(MAX_FRAME_DATA) as u8,
            data,
        }
    }

    /// Frame payload.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if this frame starts a new datagram.
    pub fn is_start_of_datagram(&self) -> bool {
        crate::is_start_of_datagram(self.id)
    }

    /// Node id of the sender.
    pub fn source(&self) -> u8 {
        crate::source_id(self.id)
    }

    /// Encodes the frame for the virtual bus.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_WIRE_HEADER_SIZE + self.len());
        buf.put_u32(self.id);
        buf.put_u8(self.len);
        buf.put_slice(self.data());
        buf
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_WIRE_HEADER_SIZE {
            return Ok(None);
        }

        let len = usize::from(buf[4]);
        if len > MAX_FRAME_DATA {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if buf.len() < FRAME_WIRE_HEADER_SIZE + len {
            return Ok(None);
        }

        let id = buf.get_u32();
        buf.advance(1);
        let mut data = [0u8; MAX_FRAME_DATA];
        buf.copy_to_slice(&mut data[..len]);

        Ok(Some(Self::from_buffer(id, data, len)))
    }
}
