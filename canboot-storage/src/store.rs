//! Redundant configuration store on two flash pages.
//!
//! Both pages hold the same record. A commit rewrites them one after the
//! other, always starting with a page whose loss is covered by the other
//! one still being valid, so an interrupted commit leaves either the old or
//! the new record readable.

use crate::error::StorageError;
use crate::page::{decode_page, encode_page, page_is_valid};
use crate::record::BootConfig;
use canboot_hal::{Flash, MemoryLayout, Region};
use tracing::{debug, error, info, warn};

/// Where a loaded record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Page1,
    Page2,
    /// Neither page was valid.
    Defaults,
}

/// Result of loading the config at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub config: BootConfig,
    pub source: ConfigSource,
}

/// The two config pages. Both must be one flash page long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStore {
    pages: [Region; 2],
}

impl ConfigStore {
    pub fn new(pages: [Region; 2]) -> Self {
        Self { pages }
    }

    pub fn from_layout(layout: &MemoryLayout) -> Self {
        Self::new(layout.config_pages)
    }

    pub fn pages(&self) -> [Region; 2] {
        self.pages
    }

    fn read_page<'f, F: Flash + ?Sized>(
        &self,
        flash: &'f F,
        index: usize,
    ) -> Result<&'f [u8], StorageError> {
        let region = self.pages[index];
        Ok(flash.read(region.base, region.len)?)
    }

    /// Returns true if page `index` (0 or 1) carries a valid CRC.
    pub fn is_valid<F: Flash + ?Sized>(&self, flash: &F, index: usize) -> bool {
        self.read_page(flash, index)
            .map(page_is_valid)
            .unwrap_or(false)
    }

    /// Loads the record from page 1, else page 2, else returns `fallback`.
    ///
    /// Keys missing from a stored record keep their value from `fallback`.
    pub fn load<F: Flash + ?Sized>(&self, flash: &F, fallback: &BootConfig) -> LoadOutcome {
        let candidates = [(0, ConfigSource::Page1), (1, ConfigSource::Page2)];

        for (index, source) in candidates {
            let page = match self.read_page(flash, index) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Config page {} unreadable: {}", index + 1, e);
                    continue;
                }
            };
            if !page_is_valid(page) {
                warn!("Config page {} failed CRC check", index + 1);
                continue;
            }
            match decode_page(page, fallback) {
                Ok(config) => {
                    debug!("Loaded config from page {}", index + 1);
                    return LoadOutcome { config, source };
                }
                Err(e) => warn!("Config page {} could not be decoded: {}", index + 1, e),
            }
        }

        warn!("No valid config page, using defaults");
        LoadOutcome {
            config: fallback.clone(),
            source: ConfigSource::Defaults,
        }
    }

    /// Copies the valid page over the invalid one when exactly one is valid.
    ///
    /// Returns whether a page was rewritten.
    pub fn repair<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<bool, StorageError> {
        let valid = [self.is_valid(&*flash, 0), self.is_valid(&*flash, 1)];
        let (from, to) = match valid {
            [true, false] => (0, 1),
            [false, true] => (1, 0),
            _ => return Ok(false),
        };

        info!("Restoring config page {} from page {}", to + 1, from + 1);
        let image = self.read_page(&*flash, from)?.to_vec();

        flash.unlock();
        let result = self.write_page(flash, to, &image);
        flash.lock();
        result.map(|()| true)
    }

    /// Increments the update counter and writes `config` to both pages.
    ///
    /// If page 2 is valid, page 1 is written first; otherwise, if page 1 is
    /// valid, page 2 is written first, and either order stops at the first
    /// page that fails to verify. With no valid page both pages are written,
    /// page 1 then page 2, whatever the outcome of the first. The counter in
    /// `config` only changes when every page verified.
    pub fn commit<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        config: &mut BootConfig,
    ) -> Result<(), StorageError> {
        let mut next = config.clone();
        next.update_count = next.update_count.wrapping_add(1);
        let image = encode_page(&next, self.pages[0].len as usize)?;

        flash.unlock();
        let result = if self.is_valid(&*flash, 1) {
            self.write_page(flash, 0, &image)
                .and_then(|()| self.write_page(flash, 1, &image))
        } else if self.is_valid(&*flash, 0) {
            self.write_page(flash, 1, &image)
                .and_then(|()| self.write_page(flash, 0, &image))
        } else {
            let first = self.write_page(flash, 0, &image);
            let second = self.write_page(flash, 1, &image);
            first.and(second)
        };
        flash.lock();

        match &result {
            Ok(()) => {
                config.update_count = next.update_count;
                info!("Config committed (update {})", config.update_count);
            }
            Err(e) => error!("Config commit failed: {}", e),
        }
        result
    }

    /// Erases, programs and re-checks one page. The flash must be unlocked.
    fn write_page<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        index: usize,
        image: &[u8],
    ) -> Result<(), StorageError> {
        let region = self.pages[index];
        flash.erase_page(region.base)?;
        flash.write(region.base, image)?;

        if !self.is_valid(&*flash, index) {
            return Err(StorageError::VerifyFailed(index + 1));
        }
        debug!("Config page {} written", index + 1);
        Ok(())
    }
}
