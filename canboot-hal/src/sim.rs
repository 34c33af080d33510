//! Simulated board: flash, bus, timers and reset.
//!
//! Used by the hosted node binary and by tests. Flash behaves like NOR flash:
//! erase sets every byte of a page to `0xff` and programming can only clear
//! bits, so writing over data that was not erased first reads back wrong.

use crate::error::HalError;
use crate::interface::{BootControl, CanInterface, Flash, Timer};
use crate::layout::{BootArg, Region};
use crate::ERASED_BYTE;
use canboot_protocol::{Datagram, Frame, FrameSplitter};
use std::cell::Cell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Byte-addressable simulated flash.
#[derive(Debug)]
pub struct SimFlash {
    region: Region,
    page_size: u32,
    memory: Vec<u8>,
    locked: bool,
    backing: Option<PathBuf>,
    power_budget: Option<u32>,
    erases: u64,
    writes: u64,
}

impl SimFlash {
    /// Creates an erased, locked flash covering `region`.
    pub fn new(region: Region, page_size: u32) -> Self {
        Self {
            region,
            page_size,
            memory: vec![ERASED_BYTE; region.len as usize],
            locked: true,
            backing: None,
            power_budget: None,
            erases: 0,
            writes: 0,
        }
    }

    /// Opens a flash image file, creating it erased if it does not exist.
    ///
    /// Every erase and write is written back to the file.
    pub fn open(path: impl AsRef<Path>, region: Region, page_size: u32) -> Result<Self, HalError> {
        let path = path.as_ref().to_path_buf();
        let mut memory = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if memory.len() != region.len as usize {
            debug!(
                "Resizing flash image {} from {} to {} bytes",
                path.display(),
                memory.len(),
                region.len
            );
            memory.resize(region.len as usize, ERASED_BYTE);
        }

        let flash = Self {
            region,
            page_size,
            memory,
            locked: true,
            backing: Some(path),
            power_budget: None,
            erases: 0,
            writes: 0,
        };
        flash.persist()?;
        Ok(flash)
    }

    /// Makes every erase or write after the first `ops` fail with
    /// [`HalError::PowerLoss`].
    pub fn with_power_loss_after(mut self, ops: u32) -> Self {
        self.power_budget = Some(ops);
        self
    }

    pub fn set_power_loss_after(&mut self, ops: Option<u32>) {
        self.power_budget = ops;
    }

    /// Ends a simulated power loss.
    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of page erases performed.
    pub fn erase_count(&self) -> u64 {
        self.erases
    }

    /// Number of writes performed.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Stores bytes directly, bypassing the lock, power loss and programming
    /// rules. For setting up images and corrupting pages.
    pub fn load(&mut self, addr: u32, data: &[u8]) -> Result<(), HalError> {
        let offset = self.offset(addr, data.len() as u32)?;
        self.memory[offset..offset + data.len()].copy_from_slice(data);
        self.persist()
    }

    fn offset(&self, addr: u32, len: u32) -> Result<usize, HalError> {
        if !self.region.contains_range(addr, len) {
            return Err(HalError::OutOfRange { addr, len });
        }
        Ok((addr - self.region.base) as usize)
    }

    fn begin_mutation(&mut self) -> Result<(), HalError> {
        if self.locked {
            return Err(HalError::Locked);
        }
        if let Some(budget) = self.power_budget.as_mut() {
            if *budget == 0 {
                warn!("Simulated power loss");
                return Err(HalError::PowerLoss);
            }
            *budget -= 1;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), HalError> {
        if let Some(path) = &self.backing {
            std::fs::write(path, &self.memory)?;
        }
        Ok(())
    }
}

impl Flash for SimFlash {
    fn unlock(&mut self) {
        self.locked = false;
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn erase_page(&mut self, addr: u32) -> Result<(), HalError> {
        if !self.region.contains(addr) {
            return Err(HalError::OutOfRange { addr, len: 0 });
        }
        let offset = self.offset(addr, 0)?;
        self.begin_mutation()?;

        let page_size = self.page_size as usize;
        let start = offset - offset % page_size;
        let end = (start + page_size).min(self.memory.len());
        self.memory[start..end].fill(ERASED_BYTE);
        self.erases += 1;
        self.persist()
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), HalError> {
        let offset = self.offset(addr, data.len() as u32)?;
        self.begin_mutation()?;

        for (cell, byte) in self.memory[offset..offset + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.writes += 1;
        self.persist()
    }

    fn read(&self, addr: u32, len: u32) -> Result<&[u8], HalError> {
        let offset = self.offset(addr, len)?;
        Ok(&self.memory[offset..offset + len as usize])
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}

/// Scripted bus: frames to deliver, and a log of frames sent.
#[derive(Debug, Default)]
pub struct MockBus {
    inbound: VecDeque<Frame>,
    sent: Vec<Frame>,
    fail_after: Option<usize>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one frame for delivery.
    pub fn push_frame(&mut self, frame: Frame) {
        self.inbound.push_back(frame);
    }

    /// Queues a whole datagram as sent by node `source`.
    pub fn push_datagram(&mut self, datagram: &mut Datagram, source: u8) {
        self.inbound.extend(FrameSplitter::new(datagram, source));
    }

    /// Makes every send fail once `frames` frames have been sent.
    pub fn fail_sends_after(&mut self, frames: usize) {
        self.fail_after = Some(frames);
    }

    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.sent)
    }

    /// Number of frames not yet delivered.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }
}

impl CanInterface for MockBus {
    fn send(&mut self, frame: &Frame, retries: u32) -> Result<(), HalError> {
        if self.fail_after.is_some_and(|n| self.sent.len() >= n) {
            return Err(HalError::RetriesExhausted(retries));
        }
        self.sent.push(*frame);
        Ok(())
    }

    fn receive(&mut self, retries: u32) -> Result<Frame, HalError> {
        self.inbound.pop_front().ok_or(HalError::Timeout(retries))
    }
}

/// Timer driven by the test. Clones share the same clock.
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    now: Rc<Cell<Duration>>,
    started: Duration,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the shared clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Timer for ManualTimer {
    fn restart(&mut self) {
        self.started = self.now.get();
    }

    fn elapsed(&self) -> Duration {
        self.now.get().saturating_sub(self.started)
    }
}

/// Wall-clock timer.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimer {
    started: Instant,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SystemTimer {
    fn restart(&mut self) {
        self.started = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Records reboot requests instead of resetting.
#[derive(Debug, Default)]
pub struct RecordingBoot {
    requests: Vec<BootArg>,
}

impl RecordingBoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> &[BootArg] {
        &self.requests
    }

    pub fn last(&self) -> Option<BootArg> {
        self.requests.last().copied()
    }
}

impl BootControl for RecordingBoot {
    fn reboot(&mut self, arg: BootArg) {
        info!("Reboot requested: {:?} ({})", arg, arg.code());
        self.requests.push(arg);
    }
}
