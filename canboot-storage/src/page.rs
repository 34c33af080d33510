//! Config page encoding.
//!
//! ```text
//! +---------+----------------------+---------+
//! | crc32   | record (msgpack map) | padding |
//! | 4 bytes | variable             | zeros   |
//! +---------+----------------------+---------+
//! ```
//!
//! The CRC is big-endian and covers everything after it, padding included.

use crate::error::StorageError;
use crate::record::{BootConfig, ConfigPatch};

/// Size of the CRC at the start of a page.
pub const PAGE_CRC_SIZE: usize = 4;

/// Encodes `config` into a full page image of `page_size` bytes.
pub fn encode_page(config: &BootConfig, page_size: usize) -> Result<Vec<u8>, StorageError> {
    let body = config.to_msgpack()?;
    let max = page_size.saturating_sub(PAGE_CRC_SIZE);
    if body.len() > max {
        return Err(StorageError::RecordTooLarge {
            size: body.len(),
            max,
        });
    }

    let mut page = vec![0u8; page_size];
    page[PAGE_CRC_SIZE..PAGE_CRC_SIZE + body.len()].copy_from_slice(&body);
    let crc = crc32fast::hash(&page[PAGE_CRC_SIZE..]);
    page[..PAGE_CRC_SIZE].copy_from_slice(&crc.to_be_bytes());
    Ok(page)
}

/// Returns true if the stored CRC matches the rest of the page.
pub fn page_is_valid(page: &[u8]) -> bool {
    if page.len() < PAGE_CRC_SIZE {
        return false;
    }
    let (stored, body) = page.split_at(PAGE_CRC_SIZE);
    let stored = u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
    stored == crc32fast::hash(body)
}

/// Decodes a valid page on top of `base`: keys missing from the page keep
/// their value from `base`.
pub fn decode_page(page: &[u8], base: &BootConfig) -> Result<BootConfig, StorageError> {
    if !page_is_valid(page) {
        return Err(StorageError::CorruptPage);
    }
    let mut body = &page[PAGE_CRC_SIZE..];
    let patch = ConfigPatch::decode(&mut body)?;

    let mut config = base.clone();
    config.apply(&patch)?;
    Ok(config)
}
