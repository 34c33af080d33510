//! Zero-copy reader over a MessagePack value stream.

use crate::error::ProtocolError;

/// Reads values from a borrowed MessagePack buffer.
///
/// Strings and binaries are returned as slices of the underlying buffer, so
/// they live as long as the buffer rather than the reader.
#[derive(Debug, Clone, Copy)]
pub struct ValueReader<'a> {
    buf: &'a [u8],
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Consumes an array header if one is at the cursor. Leaves the cursor
    /// untouched otherwise.
    pub fn try_read_array_len(&mut self) -> Option<u32> {
        let mut ahead = self.buf;
        let len = rmp::decode::read_array_len(&mut ahead).ok()?;
        self.buf = ahead;
        Some(len)
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(rmp::decode::read_int(&mut self.buf)?)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(rmp::decode::read_int(&mut self.buf)?)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(rmp::decode::read_int(&mut self.buf)?)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(rmp::decode::read_bool(&mut self.buf)?)
    }

    /// Reads a string, borrowing it from the buffer.
    pub fn read_str(&mut self) -> Result<&'a str, ProtocolError> {
        let len = rmp::decode::read_str_len(&mut self.buf)? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a binary value, borrowing it from the buffer.
    pub fn read_bin(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = rmp::decode::read_bin_len(&mut self.buf)? as usize;
        self.take(len)
    }

    /// Mutable access to the cursor for serde-based decoding. Whatever the
    /// caller consumes is consumed from this reader too.
    pub fn as_read(&mut self) -> &mut &'a [u8] {
        &mut self.buf
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}
