//! Node configuration record.
//!
//! Serialized as a MessagePack map with the keys `ID`, `name`,
//! `device_class`, `application_crc`, `application_size` and `update_count`.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};

/// Longest board name or device class accepted.
pub const MAX_STRING_LEN: usize = 64;

/// Node configuration kept in RAM and persisted on the config pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(rename = "ID")]
    pub id: u8,
    #[serde(rename = "name")]
    pub board_name: String,
    pub device_class: String,
    pub application_crc: u32,
    pub application_size: u32,
    pub update_count: u32,
}

impl BootConfig {
    /// Record used when neither config page is valid.
    pub fn fallback(device_class: &str) -> Self {
        Self {
            id: 1,
            board_name: "foobar2000".to_string(),
            device_class: device_class.to_string(),
            application_crc: 0xDEAD_C0DE,
            application_size: 0,
            update_count: 1,
        }
    }

    /// Applies the fields present in `patch`.
    ///
    /// String lengths are checked before anything is changed, so a rejected
    /// patch leaves the record untouched.
    pub fn apply(&mut self, patch: &ConfigPatch) -> Result<(), StorageError> {
        patch.validate()?;

        if let Some(id) = patch.id {
            self.id = id;
        }
        if let Some(name) = &patch.board_name {
            self.board_name.clone_from(name);
        }
        if let Some(class) = &patch.device_class {
            self.device_class.clone_from(class);
        }
        if let Some(crc) = patch.application_crc {
            self.application_crc = crc;
        }
        if let Some(size) = patch.application_size {
            self.application_size = size;
        }
        if let Some(count) = patch.update_count {
            self.update_count = count;
        }
        Ok(())
    }

    /// Encodes the record as a MessagePack map with named keys.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, StorageError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

/// A partial update of [`BootConfig`]. Absent keys are `None`; unknown keys
/// are ignored when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub board_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_crc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_count: Option<u32>,
}

impl ConfigPatch {
    /// Decodes one MessagePack map from the front of `reader`, advancing it.
    pub fn decode(reader: &mut &[u8]) -> Result<Self, StorageError> {
        let mut de = rmp_serde::Deserializer::new(reader);
        Ok(Self::deserialize(&mut de)?)
    }

    /// Encodes the patch as a MessagePack map containing only present fields.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Checks string fields against [`MAX_STRING_LEN`].
    pub fn validate(&self) -> Result<(), StorageError> {
        let strings = [
            ("name", &self.board_name),
            ("device_class", &self.device_class),
        ];
        for (field, value) in strings {
            if let Some(value) = value {
                if value.len() > MAX_STRING_LEN {
                    return Err(StorageError::FieldTooLong {
                        field,
                        len: value.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl From<&BootConfig> for ConfigPatch {
    fn from(config: &BootConfig) -> Self {
        Self {
            id: Some(config.id),
            board_name: Some(config.board_name.clone()),
            device_class: Some(config.device_class.clone()),
            application_crc: Some(config.application_crc),
            application_size: Some(config.application_size),
            update_count: Some(config.update_count),
        }
    }
}
