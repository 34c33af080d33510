//! Bootloader error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors returned by the dispatcher instead of a reply.
///
/// Refusals by a command (bad address, wrong device class) are not errors;
/// they are encoded as `false` in the reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid command")]
    InvalidCommand,

    #[error("command {0} not found")]
    CommandNotFound(i64),

    #[error("command set version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: i128 },

    #[error("reply does not fit in the output buffer")]
    ReplyOverflow,
}

impl DispatchError {
    /// Negative status code.
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::InvalidCommand => -1,
            DispatchError::CommandNotFound(_) => -2,
            DispatchError::VersionMismatch { .. } => -3,
            DispatchError::ReplyOverflow => -4,
        }
    }
}

/// Errors bringing up a node.
#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("hardware error: {0}")]
    Hal(#[from] canboot_hal::HalError),

    #[error("storage error: {0}")]
    Storage(#[from] canboot_storage::StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] canboot_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
