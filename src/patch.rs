//! Byte patches over live process memory.

use std::ptr;
use std::slice;

use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::protect::{Protection, with_protection};

/// Overwrites `bytes.len()` bytes at `address`.
///
/// With `make_executable` the pages are temporarily made read/write/execute
/// (needed for code) and their previous protection is put back afterwards;
/// without it the memory must already be writable.
///
/// # Safety
///
/// `address..address + bytes.len()` must be mapped, and nothing may be
/// executing the bytes while they change.
pub unsafe fn write(address: usize, bytes: &[u8], make_executable: bool) -> Result<()> {
    if address == 0 {
        return Err(Error::InvalidParameter);
    }
    if bytes.is_empty() {
        return Ok(());
    }
    let copy = || unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len()) };
    if make_executable {
        with_protection(address, bytes.len(), Protection::all(), copy)?;
        flush_icache(address, bytes.len());
    } else {
        copy();
    }
    Ok(())
}

/// Copies `len` bytes starting at `address`.
///
/// # Safety
///
/// The range must be mapped readable.
pub unsafe fn read(address: usize, len: usize) -> Vec<u8> {
    unsafe { slice::from_raw_parts(address as *const u8, len) }.to_vec()
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn flush_icache(addr: usize, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let end = addr + len;

    let mut p = addr & !(dline - 1);
    while p < end {
        unsafe { asm!("dc cvau, {}", in(reg) p) };
        p += dline;
    }
    unsafe { asm!("dsb ish") };
    let mut p = addr & !(iline - 1);
    while p < end {
        unsafe { asm!("ic ivau, {}", in(reg) p) };
        p += iline;
    }
    unsafe { asm!("dsb ish", "isb") };
}

#[cfg(not(target_arch = "aarch64"))]
pub(crate) fn flush_icache(_addr: usize, _len: usize) {}

/// A discovered location plus the bytes it held when it was discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    label: &'static str,
    address: Option<usize>,
    original: Vec<u8>,
}

impl PatchSite {
    /// A site whose signature was not found.
    pub fn unavailable(label: &'static str) -> Self {
        Self {
            label,
            address: None,
            original: vec![],
        }
    }

    /// # Safety
    ///
    /// `address..address + original.len()` must stay mapped for as long as
    /// the site is patched through.
    pub unsafe fn discovered(label: &'static str, address: usize, original: Vec<u8>) -> Self {
        Self {
            label,
            address: (address != 0).then_some(address),
            original,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn address(&self) -> Option<usize> {
        self.address
    }

    /// The snapshot taken at discovery. Never changes afterwards.
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn is_available(&self) -> bool {
        self.address.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Written,
    /// Nothing was written: unknown index or the site was not found.
    Skipped,
}

/// Patch sites in signature declaration order. Consumers address sites by
/// position, so the order is part of the contract.
#[derive(Debug, Clone, Default)]
pub struct PatchSiteTable {
    sites: Vec<PatchSite>,
}

impl PatchSiteTable {
    pub fn new(sites: Vec<PatchSite>) -> Self {
        Self { sites }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PatchSite> {
        self.sites.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchSite> {
        self.sites.iter()
    }

    pub fn available_count(&self) -> usize {
        self.sites.iter().filter(|s| s.is_available()).count()
    }

    fn site_address(&self, index: usize) -> Option<(usize, &PatchSite)> {
        let Some(site) = self.sites.get(index) else {
            warn!("patch site #{} does not exist", index);
            return None;
        };
        let Some(address) = site.address else {
            warn!("patch site #{} ({}) unavailable, skipped", index, site.label);
            return None;
        };
        Some((address, site))
    }

    /// Writes `bytes` at site `index`.
    ///
    /// The snapshot only covers the signature's own bytes unless the pattern
    /// was declared with [`SignaturePattern::with_span`]. Writes longer than
    /// the snapshot are refused because they could not be reverted.
    ///
    /// [`SignaturePattern::with_span`]: crate::scanner::SignaturePattern::with_span
    pub fn apply(&self, index: usize, bytes: &[u8]) -> Result<PatchOutcome> {
        let Some((address, site)) = self.site_address(index) else {
            return Ok(PatchOutcome::Skipped);
        };
        if bytes.len() > site.original.len() {
            return Err(Error::InvalidParameter);
        }
        unsafe { write(address, bytes, true) }?;
        debug!("patched {} at {:#x} ({} bytes)", site.label, address, bytes.len());
        Ok(PatchOutcome::Written)
    }

    /// Replays the discovery snapshot at site `index`.
    pub fn revert(&self, index: usize) -> Result<PatchOutcome> {
        let Some((address, site)) = self.site_address(index) else {
            return Ok(PatchOutcome::Skipped);
        };
        unsafe { write(address, &site.original, true) }?;
        debug!("reverted {} at {:#x}", site.label, address);
        Ok(PatchOutcome::Written)
    }

    /// `apply` when `on`, `revert` otherwise.
    pub fn set(&self, index: usize, on: bool, bytes: &[u8]) -> Result<PatchOutcome> {
        if on {
            self.apply(index, bytes)
        } else {
            self.revert(index)
        }
    }
}
