//! Inline hooks for AArch64.
//!
//! The entry becomes `b replacement` when it is within 128MB, otherwise
//! `ldr x17, #8; br x17; .quad replacement`. The displaced words are
//! relocated into a trampoline ending in an absolute jump back.

use std::slice;

use tracing::debug;

use super::{ExecMemory, HookBackend, HookPoint};
use crate::err::{Error, Result};
use crate::patch;
use crate::protect::page_size;

pub(crate) mod relocate;

use relocate::{absolute_jump, jump, to_bytes};

const TRAMPOLINE_SIZE: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct Arm64Backend;

impl HookBackend for Arm64Backend {
    fn init(&self) -> Result<()> {
        debug!("aarch64 inline hook backend, page size {:#x}", page_size());
        Ok(())
    }

    unsafe fn hook(&self, target: usize, replacement: usize) -> Result<HookPoint> {
        if target % 4 != 0 {
            return Err(Error::InvalidParameter);
        }
        let mut trampoline = ExecMemory::allocate(target, TRAMPOLINE_SIZE)?;

        let entry = jump(target as u64, replacement as u64);
        let stolen_words = unsafe { slice::from_raw_parts(target as *const u32, entry.len()) };
        let mut code = relocate::relocate(stolen_words, target as u64)?;
        let resume = (target + entry.len() * 4) as u64;
        code.extend_from_slice(&absolute_jump(resume));
        trampoline.seal(&to_bytes(&code))?;

        let stolen = to_bytes(stolen_words);
        unsafe { patch::write(target, &to_bytes(&entry), true) }?;
        debug!(
            "{:#x}: {} words stolen, trampoline {:#x}",
            target,
            entry.len(),
            trampoline.addr()
        );
        Ok(HookPoint::new(target, trampoline.addr(), stolen, Some(trampoline)))
    }
}
