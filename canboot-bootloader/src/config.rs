//! Node settings.
//!
//! Settings are loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML settings file (if specified via CANBOOT_CONFIG)
//! 3. Environment variables

use canboot_hal::{BootArg, MemoryLayout, Region, PLATFORM_DEVICE_CLASS, RECEIVE_RETRIES, SEND_RETRIES};
use canboot_protocol::MAX_NODE_ID;
use canboot_storage::{BootConfig, MAX_STRING_LEN};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of a simulated node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Identity used when both config pages are invalid.
    pub node: NodeSection,
    /// Virtual bus configuration.
    pub bus: BusConfig,
    /// Flash layout.
    pub memory: MemoryLayout,
    /// Boot timeout and initial boot argument.
    pub boot: BootSection,
    /// File backing the simulated flash. Volatile flash if unset.
    pub flash_image: Option<PathBuf>,
}

impl NodeSettings {
    /// Loads settings from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("CANBOOT_CONFIG") {
            settings = Self::from_file(&path)?;
        }

        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Loads settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let settings: NodeSettings = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(settings)
    }

    /// Saves settings to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.node.apply_overrides(&lookup);
        self.bus.apply_overrides(&lookup);
        self.boot.apply_overrides(&lookup);

        if let Some(path) = lookup("CANBOOT_FLASH_IMAGE") {
            self.flash_image = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
    }

    /// The record a node boots with when neither config page is valid.
    pub fn fallback(&self) -> BootConfig {
        let mut config = BootConfig::fallback(&self.node.device_class);
        config.id = self.node.id;
        config.board_name = self.node.board_name.clone();
        config
    }

    /// Validates node identity and memory layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate()?;
        validate_layout(&self.memory)
    }
}

/// Fallback identity of the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: u8,
    pub board_name: String,
    pub device_class: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let fallback = BootConfig::fallback(PLATFORM_DEVICE_CLASS);
        Self {
            id: fallback.id,
            board_name: fallback.board_name,
            device_class: fallback.device_class,
        }
    }
}

impl NodeSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("CANBOOT_NODE_ID") {
            if let Ok(id) = id.parse() {
                self.id = id;
            }
        }

        if let Some(class) = lookup("CANBOOT_DEVICE_CLASS") {
            self.device_class = class;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 || self.id > MAX_NODE_ID {
            return Err(ConfigError::ValidationError(format!(
                "node id {} outside 1..={}",
                self.id, MAX_NODE_ID
            )));
        }
        for (field, value) in [
            ("board_name", &self.board_name),
            ("device_class", &self.device_class),
        ] {
            if value.len() > MAX_STRING_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "{} longer than {} bytes",
                    field, MAX_STRING_LEN
                )));
            }
        }
        Ok(())
    }
}

/// Virtual bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// UDP address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Addresses every outgoing frame is sent to.
    #[serde(with = "socket_addrs_serde")]
    pub peers: Vec<SocketAddr>,
    pub send_retries: u32,
    pub receive_retries: u32,
    /// Read timeout of a single receive attempt.
    pub poll_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7501)),
            peers: vec![SocketAddr::from(([127, 0, 0, 1], 7500))],
            send_retries: SEND_RETRIES,
            receive_retries: RECEIVE_RETRIES,
            poll_interval_ms: 1,
        }
    }
}

impl BusConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("CANBOOT_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(peers) = lookup("CANBOOT_PEERS") {
            let parsed: Result<Vec<SocketAddr>, _> = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::parse)
                .collect();
            if let Ok(parsed) = parsed {
                self.peers = parsed;
            }
        }
    }

    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Boot behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSection {
    /// Inactivity before jumping to the application.
    pub timeout_ms: u64,
    /// Argument the node starts with, as if handed over by a reboot.
    pub boot_arg: BootArg,
}

impl Default for BootSection {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            boot_arg: BootArg::StartBootloader,
        }
    }
}

impl BootSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(timeout) = lookup("CANBOOT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.timeout_ms = ms;
            }
        }

        if let Some(arg) = lookup("CANBOOT_BOOT_ARG") {
            if let Some(parsed) = BootArg::parse(&arg.to_lowercase()) {
                self.boot_arg = parsed;
            }
        }
    }

    /// Returns the boot timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn validate_layout(layout: &MemoryLayout) -> Result<(), ConfigError> {
    if layout.page_size == 0 {
        return Err(ConfigError::ValidationError(
            "page_size must be non-zero".to_string(),
        ));
    }

    let named: [(&str, Region); 3] = [
        ("application", layout.application),
        ("config page 1", layout.config_pages[0]),
        ("config page 2", layout.config_pages[1]),
    ];

    for (name, region) in &named {
        if !layout.flash.contains_range(region.base, region.len) {
            return Err(ConfigError::ValidationError(format!(
                "{} {} lies outside flash {}",
                name, region, layout.flash
            )));
        }
    }

    let app = layout.application;
    if (app.base - layout.flash.base) % layout.page_size != 0 || app.len % layout.page_size != 0 {
        return Err(ConfigError::ValidationError(format!(
            "application {} does not start and end on a {} byte page boundary",
            app, layout.page_size
        )));
    }

    for (name, page) in &named[1..] {
        if page.len != layout.page_size {
            return Err(ConfigError::ValidationError(format!(
                "{} is {} bytes, expected one page of {}",
                name, page.len, layout.page_size
            )));
        }
        if (page.base - layout.flash.base) % layout.page_size != 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} at {:#010x} is not page aligned",
                name, page.base
            )));
        }
    }

    for (i, (a_name, a)) in named.iter().enumerate() {
        for (b_name, b) in &named[i + 1..] {
            if a.overlaps(b) {
                return Err(ConfigError::ValidationError(format!(
                    "{} overlaps {}",
                    a_name, b_name
                )));
            }
        }
    }

    Ok(())
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod socket_addrs_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addrs: &[SocketAddr], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(addrs.iter().map(|a| a.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}
