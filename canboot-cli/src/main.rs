//! canboot-cli - Command-line tools for canboot nodes
//!
//! Talks to bootloader nodes over the UDP virtual bus.

mod commands;

use canboot_client::{Client, Connection, ConnectionConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canboot-cli")]
#[command(about = "Command-line tools for canboot bootloader nodes")]
#[command(version)]
struct Cli {
    /// Local bus address
    #[arg(short, long, env = "CANBOOT_BIND", default_value = "127.0.0.1:7500")]
    bind: SocketAddr,

    /// Node bus addresses (comma-separated)
    #[arg(
        short,
        long,
        env = "CANBOOT_NODES",
        value_delimiter = ',',
        default_value = "127.0.0.1:7501"
    )]
    nodes: Vec<SocketAddr>,

    /// Node id the host sends from
    #[arg(long, default_value = "0")]
    source_id: u8,

    /// Milliseconds of silence before a node counts as not answering
    #[arg(long, default_value = "500")]
    timeout_ms: u32,

    /// Resends to nodes that did not answer
    #[arg(long, default_value = "3")]
    retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check which nodes are online
    Ping {
        /// Node ids
        #[arg(required = true)]
        ids: Vec<u8>,
    },

    /// Ping every node id on the bus
    Scan,

    /// Read node configs and print them as JSON
    ReadConfig {
        /// Node ids
        ids: Vec<u8>,

        /// Scan the bus and read every node found
        #[arg(short, long)]
        all: bool,
    },

    /// Update config keys on nodes and save them to flash
    WriteConfig {
        /// JSON file holding a map of keys to update (default stdin)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Node ids
        #[arg(required = true)]
        ids: Vec<u8>,
    },

    /// Change the id of a single node
    ChangeId {
        /// Current node id
        old: u8,

        /// New node id
        new: u8,
    },

    /// Flash a firmware binary
    Flash {
        /// Binary file to upload
        #[arg(short, long)]
        binary: PathBuf,

        /// Base address of the firmware (hex)
        #[arg(short = 'a', long, value_parser = commands::parse_address)]
        base_address: u32,

        /// Device class the nodes must have
        #[arg(short = 'c', long)]
        device_class: String,

        /// Page size in bytes
        #[arg(long, default_value = "2048")]
        page_size: u32,

        /// Run the application after flashing
        #[arg(short, long)]
        run: bool,

        /// Node ids
        #[arg(required = true)]
        ids: Vec<u8>,
    },

    /// Check the firmware on nodes against a binary
    Verify {
        /// Binary file to compare with
        #[arg(short, long)]
        binary: PathBuf,

        /// Base address of the firmware (hex)
        #[arg(short = 'a', long, value_parser = commands::parse_address)]
        base_address: u32,

        /// Node ids
        #[arg(required = true)]
        ids: Vec<u8>,
    },

    /// Start the application on nodes
    Run {
        /// Node ids
        ids: Vec<u8>,

        /// Send to every node id on the bus
        #[arg(short, long)]
        all: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig::new()
        .with_source_id(cli.source_id)
        .with_receive_retries(cli.timeout_ms.max(1))
        .with_retry_limit(cli.retries);
    let conn = match Connection::udp(cli.bind, cli.nodes, Duration::from_millis(1), config) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("{}: {}", "Cannot open bus".red(), e);
            std::process::exit(1);
        }
    };
    let mut client = Client::new(conn);

    match commands::execute(&mut client, cli.command) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    }
}
