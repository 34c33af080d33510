//! HAL error types.

use canboot_protocol::ProtocolError;
use thiserror::Error;

/// Errors reported by the platform collaborators.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("no frame received after {0} attempts")]
    Timeout(u32),

    #[error("frame not sent after {0} attempts")]
    RetriesExhausted(u32),

    #[error("address range {addr:#010x}+{len} is outside flash")]
    OutOfRange { addr: u32, len: u32 },

    #[error("flash is locked")]
    Locked,

    #[error("power lost during flash operation")]
    PowerLoss,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] ProtocolError),
}

impl HalError {
    /// Returns whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HalError::Timeout(_) | HalError::RetriesExhausted(_))
    }
}
