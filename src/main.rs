//! canboot - Simulated CAN bootloader node
//!
//! Runs one bootloader node on the UDP virtual bus, backed by simulated flash.

use canboot_bootloader::{Bootloader, BootloaderError, NodeSettings};
use canboot_hal::{BootArg, RecordingBoot, SimFlash, SystemTimer, UdpBus};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), BootloaderError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match NodeSettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("Failed to load settings: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("CANBOOT_CONFIG") {
        tracing::info!("Loaded settings from {}", path);
    }
    if let Err(e) = settings.validate() {
        tracing::error!("Invalid settings: {}", e);
        return Err(e.into());
    }

    let layout = settings.memory;
    let flash = match &settings.flash_image {
        Some(path) => SimFlash::open(path, layout.flash, layout.page_size)?,
        None => SimFlash::new(layout.flash, layout.page_size),
    };
    let bus = UdpBus::bind(
        settings.bus.bind_addr,
        settings.bus.peers.clone(),
        settings.bus.poll_interval(),
    )?;

    tracing::info!("Starting canboot node");
    tracing::info!("  Bind address: {}", settings.bus.bind_addr);
    tracing::info!("  Peers: {:?}", settings.bus.peers);
    match &settings.flash_image {
        Some(path) => tracing::info!("  Flash image: {}", path.display()),
        None => tracing::info!("  Flash image: volatile"),
    }
    tracing::info!("  Boot timeout: {:?}", settings.boot.timeout());

    let fallback = settings.fallback();
    let mut parts = (bus, flash, RecordingBoot::new(), SystemTimer::new());
    let mut boot_arg = settings.boot.boot_arg;

    loop {
        let (bus, flash, boot, timer) = parts;
        let mut node = Bootloader::from_flash(bus, flash, boot, timer, layout, &fallback)
            .with_timeout(settings.boot.timeout())
            .with_boot_arg(boot_arg)
            .with_retries(settings.bus.send_retries, settings.bus.receive_retries);

        boot_arg = node.run();
        match boot_arg {
            BootArg::StartBootloader | BootArg::StartBootloaderNoTimeout => {
                tracing::info!("Restarting bootloader ({:?})", boot_arg);
                parts = node.into_parts();
            }
            BootArg::StartApplication => {
                tracing::info!(
                    "Jumping to application at {:#010x}",
                    node.layout().application.base
                );
                return Ok(());
            }
            BootArg::StartStBootloader => {
                tracing::info!("Handing over to the system bootloader");
                return Ok(());
            }
        }
    }
}
