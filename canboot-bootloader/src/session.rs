//! The bootloader receive loop.

use crate::commands::{application_boot_arg, DEFAULT_COMMANDS};
use crate::dispatcher::{dispatch, CommandEntry, NodeContext};
use crate::BUFFER_MARGIN;
use canboot_hal::{
    BootArg, BootControl, CanInterface, Flash, MemoryLayout, Timer, RECEIVE_RETRIES, SEND_RETRIES,
};
use canboot_protocol::{Datagram, Frame, FrameSplitter};
use canboot_storage::{BootConfig, ConfigSource, ConfigStore};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default inactivity timeout before the application is started.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bootloader node: reassembles datagrams from the bus, runs the commands
/// addressed to it and sends the replies back to the sender.
pub struct Bootloader<B, F, K, T> {
    bus: B,
    flash: F,
    boot: K,
    timer: T,
    layout: MemoryLayout,
    store: ConfigStore,
    config: BootConfig,
    datagram: Datagram,
    reply: Vec<u8>,
    table: &'static [CommandEntry],
    timeout: Duration,
    timeout_active: bool,
    send_retries: u32,
    receive_retries: u32,
}

impl<B, F, K, T> Bootloader<B, F, K, T>
where
    B: CanInterface,
    F: Flash,
    K: BootControl,
    T: Timer,
{
    /// Creates a node running with `config` as its RAM config.
    pub fn new(bus: B, flash: F, boot: K, mut timer: T, layout: MemoryLayout, config: BootConfig) -> Self {
        let buffer_len = layout.page_size as usize + BUFFER_MARGIN;
        timer.restart();
        Self {
            bus,
            flash,
            boot,
            timer,
            store: ConfigStore::from_layout(&layout),
            layout,
            config,
            datagram: Datagram::new(buffer_len),
            reply: vec![0; buffer_len],
            table: &DEFAULT_COMMANDS,
            timeout: DEFAULT_TIMEOUT,
            timeout_active: true,
            send_retries: SEND_RETRIES,
            receive_retries: RECEIVE_RETRIES,
        }
    }

    /// Creates a node with the config found on flash.
    ///
    /// Uses `fallback` when neither page is valid. A single corrupt page is
    /// restored from the valid one.
    pub fn from_flash(
        bus: B,
        mut flash: F,
        boot: K,
        timer: T,
        layout: MemoryLayout,
        fallback: &BootConfig,
    ) -> Self {
        let store = ConfigStore::from_layout(&layout);
        let outcome = store.load(&flash, fallback);

        match outcome.source {
            ConfigSource::Defaults => {
                warn!("No valid config page, using defaults for node {}", outcome.config.id);
            }
            source => {
                info!(
                    "Loaded config from {:?}: node {} ({}), update {}",
                    source, outcome.config.id, outcome.config.board_name, outcome.config.update_count
                );
                if let Err(e) = store.repair(&mut flash) {
                    warn!("Failed to restore config page: {}", e);
                }
            }
        }

        Self::new(bus, flash, boot, timer, layout, outcome.config)
    }

    /// Replaces the command table.
    pub fn with_commands(mut self, table: &'static [CommandEntry]) -> Self {
        self.table = table;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Applies the argument this start was requested with.
    pub fn with_boot_arg(mut self, arg: BootArg) -> Self {
        self.timeout_active = arg.timeout_enabled();
        self.timer.restart();
        if !self.timeout_active {
            info!("Boot timeout disabled");
        }
        self
    }

    pub fn with_retries(mut self, send: u32, receive: u32) -> Self {
        self.send_retries = send;
        self.receive_retries = receive;
        self
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn boot(&self) -> &K {
        &self.boot
    }

    /// Returns whether the node jumps to the application when idle.
    pub fn timeout_active(&self) -> bool {
        self.timeout_active
    }

    /// Releases the collaborators, as a reset would.
    pub fn into_parts(self) -> (B, F, K, T) {
        (self.bus, self.flash, self.boot, self.timer)
    }

    /// Runs until the node reboots, returning the boot argument.
    pub fn run(&mut self) -> BootArg {
        info!("Bootloader running as node {}", self.config.id);
        loop {
            if let Some(arg) = self.poll() {
                return arg;
            }
        }
    }

    /// One loop iteration: checks the timeout, then receives and handles at
    /// most one frame. Returns the boot argument if the node rebooted.
    pub fn poll(&mut self) -> Option<BootArg> {
        if self.timeout_active && self.timer.elapsed() >= self.timeout {
            let arg = application_boot_arg(&self.flash, &self.layout, &self.config);
            info!("No valid datagram for {:?}, leaving bootloader", self.timeout);
            return Some(self.reboot(arg));
        }

        match self.bus.receive(self.receive_retries) {
            Ok(frame) => self.handle_frame(&frame),
            Err(e) => {
                trace!("No frame: {}", e);
                None
            }
        }
    }

    /// Feeds one frame into the datagram reader.
    pub fn handle_frame(&mut self, frame: &Frame) -> Option<BootArg> {
        if frame.is_start_of_datagram() {
            self.datagram.start();
        }
        self.datagram.input(frame.data());

        if !self.datagram.is_complete() {
            return None;
        }

        let reboot = self.handle_datagram(frame.source());
        self.datagram.start();
        reboot.map(|arg| self.reboot(arg))
    }

    fn handle_datagram(&mut self, sender: u8) -> Option<BootArg> {
        if !self.datagram.is_valid() {
            warn!("Dropping invalid datagram from node {}", sender);
            return None;
        }
        self.timer.restart();

        if !self.datagram.is_addressed_to(self.config.id) {
            trace!("Datagram from node {} not addressed to us", sender);
            return None;
        }
        debug!(
            "Datagram from node {}: {} bytes",
            sender,
            self.datagram.data_len()
        );

        let mut ctx = NodeContext {
            config: &mut self.config,
            flash: &mut self.flash,
            layout: &self.layout,
            store: &self.store,
            reboot: None,
        };
        let written = match dispatch(self.datagram.data(), self.table, &mut self.reply, &mut ctx) {
            Ok(written) => written,
            Err(e) => {
                warn!("Command from node {} rejected ({}): {}", sender, e.code(), e);
                0
            }
        };
        let reboot = ctx.reboot;

        if written > 0 {
            self.send_reply(sender, written);
        }
        reboot
    }

    /// Sends the first `len` bytes of the reply buffer to `to`. A frame that
    /// cannot be sent aborts the rest of the reply.
    fn send_reply(&mut self, to: u8, len: usize) {
        let mut reply = match Datagram::from_parts(&[to], &self.reply[..len]) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Cannot build reply to node {}: {}", to, e);
                return;
            }
        };

        for frame in FrameSplitter::new(&mut reply, self.config.id) {
            if let Err(e) = self.bus.send(&frame, self.send_retries) {
                warn!("Reply to node {} aborted: {}", to, e);
                return;
            }
        }
        debug!("Replied to node {} with {} bytes", to, len);
    }

    fn reboot(&mut self, arg: BootArg) -> BootArg {
        self.boot.reboot(arg);
        arg
    }
}
