//! # canboot-storage
//!
//! Configuration storage for the canboot bootloader.
//!
//! This crate provides:
//! - The node configuration record and partial updates to it
//! - CRC-prefixed page encoding of the record
//! - A store keeping the record on two flash pages, committed in an order
//!   that always leaves one valid page behind

pub mod error;
pub mod page;
pub mod record;
pub mod store;

pub use error::StorageError;
pub use page::{decode_page, encode_page, page_is_valid, PAGE_CRC_SIZE};
pub use record::{BootConfig, ConfigPatch, MAX_STRING_LEN};
pub use store::{ConfigSource, ConfigStore, LoadOutcome};
