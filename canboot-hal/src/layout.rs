//! Memory layout and boot arguments.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A contiguous address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub base: u32,
    pub len: u32,
}

impl Region {
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    /// First address past the region.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.len)
    }

    /// Returns true if `addr` lies inside the region.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && u64::from(addr) < self.end()
    }

    /// Returns true if `[addr, addr + len)` lies inside the region.
    pub fn contains_range(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(len) <= self.end()
    }

    /// Returns true if the two regions share at least one address.
    pub fn overlaps(&self, other: &Region) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..{:#010x}", self.base, self.end())
    }
}

/// Where the application and the two config pages live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    pub flash: Region,
    pub application: Region,
    pub config_pages: [Region; 2],
    pub page_size: u32,
}

impl Default for MemoryLayout {
    /// 128 KiB of flash with 2 KiB pages: 8 KiB bootloader, the application,
    /// then the two config pages in the last 4 KiB.
    fn default() -> Self {
        let base = 0x0800_0000;
        let page_size = 0x800;
        Self {
            flash: Region::new(base, 0x2_0000),
            application: Region::new(base + 0x2000, 0x1_d000),
            config_pages: [
                Region::new(base + 0x1_f000, page_size),
                Region::new(base + 0x1_f800, page_size),
            ],
            page_size,
        }
    }
}

/// Argument handed to the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BootArg {
    StartBootloader = 0,
    StartBootloaderNoTimeout = 1,
    StartApplication = 2,
    StartStBootloader = 3,
}

impl BootArg {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a boot argument from its code or snake_case name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "0" | "start_bootloader" => Some(BootArg::StartBootloader),
            "1" | "start_bootloader_no_timeout" => Some(BootArg::StartBootloaderNoTimeout),
            "2" | "start_application" => Some(BootArg::StartApplication),
            "3" | "start_st_bootloader" => Some(BootArg::StartStBootloader),
            _ => None,
        }
    }

    /// Returns true if a bootloader started with this argument jumps to the
    /// application on its own after the timeout.
    pub fn timeout_enabled(self) -> bool {
        self != BootArg::StartBootloaderNoTimeout
    }
}

impl TryFrom<u8> for BootArg {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(BootArg::StartBootloader),
            1 => Ok(BootArg::StartBootloaderNoTimeout),
            2 => Ok(BootArg::StartApplication),
            3 => Ok(BootArg::StartStBootloader),
            other => Err(other),
        }
    }
}
