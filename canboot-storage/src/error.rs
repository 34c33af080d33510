//! Storage error types.

use canboot_hal::HalError;
use thiserror::Error;

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("flash error: {0}")]
    Flash(#[from] HalError),

    #[error("record encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("record decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("record too large: {size} bytes (page holds {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("field {field} too long: {len} bytes (max 64)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("config page failed CRC check")]
    CorruptPage,

    #[error("config page {0} did not verify after writing")]
    VerifyFailed(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FieldTooLong {
            field: "name",
            len: 65,
        };
        assert!(err.to_string().contains("name"));
        assert!(err.to_string().contains("65"));

        assert!(StorageError::VerifyFailed(2).to_string().contains('2'));

        let err: StorageError = HalError::Locked.into();
        assert!(matches!(err, StorageError::Flash(HalError::Locked)));
    }
}
