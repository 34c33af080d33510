//! Collaborator traits implemented by each platform.

use crate::error::HalError;
use crate::layout::BootArg;
use canboot_protocol::Frame;
use std::time::Duration;

/// A CAN controller.
pub trait CanInterface {
    /// Sends one frame, retrying up to `retries` times.
    fn send(&mut self, frame: &Frame, retries: u32) -> Result<(), HalError>;

    /// Waits for one frame, polling up to `retries` times.
    fn receive(&mut self, retries: u32) -> Result<Frame, HalError>;
}

/// Flash memory with page erase and byte programming.
pub trait Flash {
    /// Allows erase and write.
    fn unlock(&mut self);

    /// Forbids erase and write.
    fn lock(&mut self);

    /// Erases the page containing `addr`.
    fn erase_page(&mut self, addr: u32) -> Result<(), HalError>;

    /// Programs `data` at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), HalError>;

    /// Reads `len` bytes at `addr`.
    fn read(&self, addr: u32, len: u32) -> Result<&[u8], HalError>;

    fn page_size(&self) -> u32;
}

/// Reset with a boot argument for the next start.
pub trait BootControl {
    fn reboot(&mut self, arg: BootArg);
}

/// Free-running timer used for the bootloader timeout.
pub trait Timer {
    fn restart(&mut self);

    fn elapsed(&self) -> Duration;
}

impl<T: CanInterface + ?Sized> CanInterface for &mut T {
    fn send(&mut self, frame: &Frame, retries: u32) -> Result<(), HalError> {
        (**self).send(frame, retries)
    }

    fn receive(&mut self, retries: u32) -> Result<Frame, HalError> {
        (**self).receive(retries)
    }
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn unlock(&mut self) {
        (**self).unlock()
    }

    fn lock(&mut self) {
        (**self).lock()
    }

    fn erase_page(&mut self, addr: u32) -> Result<(), HalError> {
        (**self).erase_page(addr)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), HalError> {
        (**self).write(addr, data)
    }

    fn read(&self, addr: u32, len: u32) -> Result<&[u8], HalError> {
        (**self).read(addr, len)
    }

    fn page_size(&self) -> u32 {
        (**self).page_size()
    }
}

impl<T: BootControl + ?Sized> BootControl for &mut T {
    fn reboot(&mut self, arg: BootArg) {
        (**self).reboot(arg)
    }
}

impl<T: Timer + ?Sized> Timer for &mut T {
    fn restart(&mut self) {
        (**self).restart()
    }

    fn elapsed(&self) -> Duration {
        (**self).elapsed()
    }
}
