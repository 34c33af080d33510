//! Datagram framing.
//!
//! A datagram is one addressed command or reply. It is read and written one
//! byte at a time so it can be carried by transport frames of at most 8 bytes.
//!
//! ```text
//! +---------+---------+------------+------------+----------+----------+
//! | version | crc32   | dest_count | dest_nodes | data_len | data     |
//! | 1 byte  | 4 bytes | 1 byte     | dest_count | 4 bytes  | data_len |
//! +---------+---------+------------+------------+----------+----------+
//! ```
//!
//! Multi-byte fields are big-endian. The CRC covers `dest_count`,
//! `dest_nodes`, `data_len` and `data`, in that order.

use crate::error::ProtocolError;
use crate::DATAGRAM_VERSION;

/// Maximum number of destination nodes in one datagram.
pub const MAX_DESTINATIONS: usize = 255;

/// Size of the fixed part of a datagram (version + crc + dest_count + data_len).
pub const DATAGRAM_HEADER_SIZE: usize = 10;

/// Field currently being read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Version,
    Crc,
    DestCount,
    DestNodes,
    DataLen,
    Data,
    /// Reader: absorbs trailing bytes. Writer: nothing left to emit.
    End,
}

/// Position inside the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    field: Field,
    pos: u32,
}

impl Cursor {
    const START: Cursor = Cursor {
        field: Field::Version,
        pos: 0,
    };

    fn advance(&mut self, field: Field) {
        self.field = field;
        self.pos = 0;
    }
}

/// A datagram together with its resumable reader and writer state.
///
/// Received data is stored up to `capacity` bytes. Bytes beyond the capacity
/// are counted but dropped, so a short buffer truncates the payload instead
/// of failing.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Framing version.
    pub version: u8,
    /// CRC as transmitted (reader) or as computed at construction (writer).
    pub crc: u32,
    destinations: Vec<u8>,
    dest_count: u8,
    data: Vec<u8>,
    capacity: usize,
    data_len: u32,
    reader: Cursor,
    writer: Cursor,
}

impl Datagram {
    /// Creates an empty datagram able to store `capacity` data bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            version: DATAGRAM_VERSION,
            crc: 0,
            destinations: Vec::with_capacity(MAX_DESTINATIONS),
            dest_count: 0,
            data: Vec::with_capacity(capacity),
            capacity,
            data_len: 0,
            reader: Cursor::START,
            writer: Cursor::START,
        }
    }

    /// Builds a complete outgoing datagram with a freshly computed CRC.
    pub fn from_parts(destinations: &[u8], data: &[u8]) -> Result<Self, ProtocolError> {
        if destinations.len() > MAX_DESTINATIONS {
            return Err(ProtocolError::TooManyDestinations(destinations.len()));
        }
        if data.len() > u32::MAX as usize {
            return Err(ProtocolError::DatagramTooLarge {
                size: data.len(),
                max: u32::MAX as usize,
            });
        }

        let mut datagram = Self::new(data.len());
        datagram.destinations.extend_from_slice(destinations);
        datagram.dest_count = destinations.len() as u8;
        datagram.data.extend_from_slice(data);
        datagram.data_len = data.len() as u32;
        datagram.crc = datagram.compute_crc();
        datagram.reader.advance(Field::End);
        Ok(datagram)
    }

    /// Decodes a whole datagram from a contiguous buffer.
    ///
    /// Returns `Ok(None)` if more bytes are needed, or an error if the
    /// datagram is complete but carries the wrong version or CRC.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let mut datagram = Self::new(bytes.len());
        datagram.input(bytes);

        if !datagram.is_complete() {
            return Ok(None);
        }
        if datagram.version != DATAGRAM_VERSION {
            return Err(ProtocolError::UnsupportedVersion(datagram.version));
        }
        let actual = datagram.compute_crc();
        if actual != datagram.crc {
            return Err(ProtocolError::CrcMismatch {
                expected: datagram.crc,
                actual,
            });
        }
        Ok(Some(datagram))
    }

    /// Resets reader and writer to the start of a new datagram, discarding
    /// anything received so far.
    pub fn start(&mut self) {
        self.version = DATAGRAM_VERSION;
        self.crc = 0;
        self.destinations.clear();
        self.dest_count = 0;
        self.data.clear();
        self.data_len = 0;
        self.reader = Cursor::START;
        self.writer = Cursor::START;
    }

    /// Destination node list.
    pub fn destinations(&self) -> &[u8] {
        &self.destinations
    }

    /// Stored data bytes (at most `capacity`).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Declared data length.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Maximum number of data bytes this datagram stores.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns whether `node` appears in the destination list.
    pub fn is_addressed_to(&self, node: u8) -> bool {
        self.destinations.contains(&node)
    }

    /// Feeds one received byte into the reader.
    pub fn input_byte(&mut self, byte: u8) {
        match self.reader.field {
            Field::Version => {
                self.version = byte;
                self.reader.advance(Field::Crc);
            }
            Field::Crc => {
                self.crc = (self.crc << 8) | u32::from(byte);
                self.reader.pos += 1;
                if self.reader.pos == 4 {
                    self.reader.advance(Field::DestCount);
                }
            }
            Field::DestCount => {
                self.dest_count = byte;
                self.destinations.clear();
                if byte == 0 {
                    self.reader.advance(Field::DataLen);
                } else {
                    self.reader.advance(Field::DestNodes);
                }
            }
            Field::DestNodes => {
                self.destinations.push(byte);
                if self.destinations.len() == usize::from(self.dest_count) {
                    self.reader.advance(Field::DataLen);
                }
            }
            Field::DataLen => {
                self.data_len = (self.data_len << 8) | u32::from(byte);
                self.reader.pos += 1;
                if self.reader.pos == 4 {
                    if self.data_len == 0 {
                        self.reader.advance(Field::End);
                    } else {
                        self.reader.advance(Field::Data);
                    }
                }
            }
            Field::Data => {
                if self.data.len() < self.capacity {
                    self.data.push(byte);
                }
                self.reader.pos += 1;
                if self.reader.pos == self.data_len {
                    self.reader.advance(Field::End);
                }
            }
            Field::End => {}
        }
    }

    /// Feeds a run of received bytes into the reader.
    pub fn input(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.input_byte(byte);
        }
    }

    /// Returns true once the data length is known and that many data bytes
    /// have been consumed.
    pub fn is_complete(&self) -> bool {
        self.reader.field == Field::End
    }

    /// Returns true if the datagram is complete, has the expected version and
    /// its CRC matches.
    pub fn is_valid(&self) -> bool {
        self.is_complete() && self.version == DATAGRAM_VERSION && self.crc == self.compute_crc()
    }

    /// Computes the CRC32 over the destination list, data length and data.
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.destinations.len() as u8]);
        hasher.update(&self.destinations);
        hasher.update(&self.data_len.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize()
    }

    /// Number of data bytes the writer emits.
    fn emitted_data_len(&self) -> usize {
        self.data.len().min(self.data_len as usize)
    }

    /// Total encoded size of this datagram.
    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_SIZE + self.destinations.len() + self.emitted_data_len()
    }

    /// Writes the next bytes of the encoded datagram into `out`.
    ///
    /// Each call resumes where the previous one stopped. Returns the number
    /// of bytes written, which is less than `out.len()` on the call that
    /// finishes the datagram and zero on every call after that.
    pub fn output_bytes(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let byte = match self.writer.field {
                Field::Version => {
                    self.writer.advance(Field::Crc);
                    self.version
                }
                Field::Crc => {
                    let byte = self.crc.to_be_bytes()[self.writer.pos as usize];
                    self.writer.pos += 1;
                    if self.writer.pos == 4 {
                        self.writer.advance(Field::DestCount);
                    }
                    byte
                }
                Field::DestCount => {
                    if self.destinations.is_empty() {
                        self.writer.advance(Field::DataLen);
                    } else {
                        self.writer.advance(Field::DestNodes);
                    }
                    self.destinations.len() as u8
                }
                Field::DestNodes => {
                    let byte = self.destinations[self.writer.pos as usize];
                    self.writer.pos += 1;
                    if self.writer.pos as usize == self.destinations.len() {
                        self.writer.advance(Field::DataLen);
                    }
                    byte
                }
                Field::DataLen => {
                    let byte = self.data_len.to_be_bytes()[self.writer.pos as usize];
                    self.writer.pos += 1;
                    if self.writer.pos == 4 {
                        if self.emitted_data_len() == 0 {
                            self.writer.advance(Field::End);
                        } else {
                            self.writer.advance(Field::Data);
                        }
                    }
                    byte
                }
                Field::Data => {
                    let byte = self.data[self.writer.pos as usize];
                    self.writer.pos += 1;
                    if self.writer.pos as usize == self.emitted_data_len() {
                        self.writer.advance(Field::End);
                    }
                    byte
                }
                Field::End => break,
            };

            out[written] = byte;
            written += 1;
        }

        written
    }

    /// Rewinds the writer so the datagram can be emitted again.
    pub fn rewind_output(&mut self) {
        self.writer = Cursor::START;
    }

    /// Encodes the whole datagram into a new buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut copy = self.clone();
        copy.rewind_output();
        let mut out = vec![0u8; copy.encoded_len()];
        let written = copy.output_bytes(&mut out);
        out.truncate(written);
        out
    }
}
