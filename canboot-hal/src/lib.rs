//! # canboot-hal
//!
//! Interfaces between the bootloader and the board it runs on.
//!
//! This crate provides:
//! - `CanInterface`, `Flash`, `BootControl` and `Timer` traits
//! - Memory layout description (application region, config pages)
//! - A simulated board: in-memory or file-backed flash, a scripted bus, timers
//! - A virtual CAN bus carried over UDP

pub mod error;
pub mod interface;
pub mod layout;
pub mod sim;
pub mod udp;

pub use error::HalError;
pub use interface::{BootControl, CanInterface, Flash, Timer};
pub use layout::{BootArg, MemoryLayout, Region};
pub use sim::{ManualTimer, MockBus, RecordingBoot, SimFlash, SystemTimer};
pub use udp::UdpBus;

/// Device class of the simulated board.
pub const PLATFORM_DEVICE_CLASS: &str = "canboot-sim";

/// Retries for sending one frame.
pub const SEND_RETRIES: u32 = 100;

/// Retries for receiving one frame.
pub const RECEIVE_RETRIES: u32 = 1000;

/// Value of erased flash.
pub const ERASED_BYTE: u8 = 0xff;
