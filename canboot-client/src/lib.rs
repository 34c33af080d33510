//! # canboot-client
//!
//! Host-side client for canboot nodes.
//!
//! This crate provides:
//! - A connection sending datagrams to a set of nodes and reassembling
//!   their replies
//! - Retried requests that resend only to nodes that stayed silent
//! - The host workflows: ping and scan, config read/write, node id change,
//!   flashing, verification and application start

pub mod client;
pub mod connection;
pub mod error;

pub use client::{Client, FlashPhase, FirmwareImage};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
