//! # canboot-bootloader
//!
//! Bootloader core for canboot.
//!
//! This crate provides:
//! - Command envelope dispatch over a static command table
//! - The flash, CRC, config and application handoff commands
//! - The receive loop: reassembly, addressing, replies and the boot timeout
//! - Node settings loaded from YAML and environment variables

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod session;

pub use commands::{application_boot_arg, DEFAULT_COMMANDS};
pub use config::{BootSection, BusConfig, ConfigError, NodeSection, NodeSettings};
pub use dispatcher::{dispatch, Command, CommandEntry, Handler, NodeContext, ReplyWriter};
pub use error::{BootloaderError, DispatchError};
pub use session::{Bootloader, DEFAULT_TIMEOUT};

/// Extra room in the datagram and reply buffers beyond one flash page.
pub const BUFFER_MARGIN: usize = 128;
