use std::ptr;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, c_void, mmap, mprotect, munmap};
use tracing::trace;

use crate::err::{Error, Result};
use crate::patch::flush_icache;
use crate::protect::{Protection, page_size};

/// Distance between two probed allocation hints.
const HINT_STEP: usize = 16 << 20;
const HINT_TRIES: usize = 64;

/// Anonymous pages holding trampoline code. Writable until sealed, then
/// read/execute only.
#[derive(Debug)]
pub(crate) struct ExecMemory {
    addr: usize,
    len: usize,
}

fn map_at(hint: usize, len: usize) -> Option<usize> {
    let addr = unsafe {
        mmap(
            hint as *mut c_void,
            len,
            (Protection::READ | Protection::WRITE).bits(),
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    (addr != MAP_FAILED).then_some(addr as usize)
}

impl ExecMemory {
    /// Maps pages close to `near` when the kernel honours one of the hints,
    /// anywhere otherwise. Callers must cope with both.
    pub fn allocate(near: usize, len: usize) -> Result<Self> {
        let page = page_size();
        let len = len.max(1).next_multiple_of(page);
        let base = near & !(page - 1);

        for i in 1..=HINT_TRIES {
            let Some(hint) = base.checked_sub(i * HINT_STEP) else {
                break;
            };
            let Some(addr) = map_at(hint, len) else {
                continue;
            };
            if addr.abs_diff(near) < (i32::MAX as usize) {
                trace!("trampoline page {:#x} for {:#x}", addr, near);
                return Ok(Self { addr, len });
            }
            unsafe { munmap(addr as *mut c_void, len) };
        }

        let addr = map_at(0, len).ok_or(Error::MemoryAllocation)?;
        trace!("trampoline page {:#x} (far from {:#x})", addr, near);
        Ok(Self { addr, len })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Copies `code` to the start of the block and makes it executable.
    pub fn seal(&mut self, code: &[u8]) -> Result<()> {
        if code.len() > self.len {
            return Err(Error::MoveCode);
        }
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), self.addr as *mut u8, code.len()) };
        let ret = unsafe {
            mprotect(
                self.addr as *mut c_void,
                self.len,
                (Protection::READ | Protection::EXEC).bits(),
            )
        };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        flush_icache(self.addr, code.len());
        Ok(())
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        unsafe { munmap(self.addr as *mut c_void, self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::query;

    #[test]
    fn test_allocate_and_seal() {
        let anchor = test_allocate_and_seal as usize;
        let mut mem = ExecMemory::allocate(anchor, 64).unwrap();
        mem.seal(&[0xc3; 16]).unwrap();
        let regions = query(mem.addr(), 16).unwrap();
        assert_eq!(regions[0].protection, Protection::READ | Protection::EXEC);
        assert_eq!(unsafe { *(mem.addr() as *const u8) }, 0xc3);
    }

    #[test]
    fn test_seal_too_long() {
        let mut mem = ExecMemory::allocate(0, 1).unwrap();
        let code = vec![0u8; page_size() + 1];
        assert!(matches!(mem.seal(&code), Err(Error::MoveCode)));
    }
}
