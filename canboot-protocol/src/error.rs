//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while framing or decoding datagrams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported datagram version: {0}")]
    UnsupportedVersion(u8),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("too many destination nodes: {0} (max 255)")]
    TooManyDestinations(usize),

    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("frame payload too large: {0} bytes (max 8)")]
    FrameTooLarge(usize),

    #[error("malformed value in argument stream: {0}")]
    MalformedValue(String),

    #[error("argument stream ended early")]
    UnexpectedEnd,

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl<E: rmp::decode::RmpReadErr> From<rmp::decode::ValueReadError<E>> for ProtocolError
where
    rmp::decode::ValueReadError<E>: std::fmt::Display,
{
    fn from(e: rmp::decode::ValueReadError<E>) -> Self {
        ProtocolError::MalformedValue(e.to_string())
    }
}

impl<E: rmp::decode::RmpReadErr> From<rmp::decode::NumValueReadError<E>> for ProtocolError
where
    rmp::decode::NumValueReadError<E>: std::fmt::Display,
{
    fn from(e: rmp::decode::NumValueReadError<E>) -> Self {
        ProtocolError::MalformedValue(e.to_string())
    }
}

impl From<rmp::encode::ValueWriteError<std::io::Error>> for ProtocolError {
    fn from(e: rmp::encode::ValueWriteError<std::io::Error>) -> Self {
        match e {
            rmp::encode::ValueWriteError::InvalidMarkerWrite(io)
            | rmp::encode::ValueWriteError::InvalidDataWrite(io) => ProtocolError::Io(io),
        }
    }
}
