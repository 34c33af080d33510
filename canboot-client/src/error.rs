//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bus error: {0}")]
    Bus(#[from] canboot_hal::HalError),

    #[error("protocol error: {0}")]
    Protocol(#[from] canboot_protocol::ProtocolError),

    #[error("config encoding error: {0}")]
    Config(#[from] canboot_storage::StorageError),

    #[error("reply decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no answer from nodes {}", format_nodes(.0))]
    NoAnswer(Vec<u8>),

    #[error("nodes {} refused {operation}", format_nodes(.nodes))]
    Refused {
        operation: &'static str,
        nodes: Vec<u8>,
    },

    #[error("nodes {} are offline", format_nodes(.0))]
    Offline(Vec<u8>),

    #[error("verification failed for nodes {}", format_nodes(.0))]
    VerifyFailed(Vec<u8>),

    #[error("config patch changes the node ID; use change-id instead")]
    IdChange,

    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),
}

impl ClientError {
    /// Returns whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Bus(e) => e.is_retryable(),
            ClientError::NoAnswer(_) => true,
            ClientError::Offline(_) => true,
            _ => false,
        }
    }
}

fn format_nodes(nodes: &[u8]) -> String {
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
