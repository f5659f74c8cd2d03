//! Inline hooks for x86_64.
//!
//! The target entry is overwritten with `jmp rel32` when the replacement is
//! within reach and with `jmp qword ptr [rip]; dq replacement` otherwise. The
//! displaced instructions are relocated into a trampoline that jumps back to
//! the first untouched instruction.

use std::slice;

use iced_x86::{Code, Decoder, DecoderOptions, Instruction};
use tracing::debug;

use super::{ExecMemory, HookBackend, HookPoint};
use crate::err::{Error, Result};
use crate::patch;
use crate::protect::page_size;

pub(crate) mod relocate;

const NOP: u8 = 0x90;
const MAX_INST_LEN: usize = 15;
const FAR_JMP_LEN: usize = 14;
const TRAMPOLINE_SIZE: usize = 256;

#[derive(Debug, Default, Clone, Copy)]
pub struct X64Backend;

/// `jmp` from `from` to `to` in the shortest form that reaches.
pub(crate) fn jmp_bytes(from: usize, to: usize) -> Vec<u8> {
    let rel = (to as i64).wrapping_sub(from as i64 + 5);
    match i32::try_from(rel) {
        Ok(rel) => {
            let mut code = vec![0xe9];
            code.extend_from_slice(&rel.to_le_bytes());
            code
        }
        Err(_) => {
            let mut code = vec![0xff, 0x25, 0, 0, 0, 0];
            code.extend_from_slice(&(to as u64).to_le_bytes());
            code
        }
    }
}

/// Decodes whole instructions at `addr` until at least `min_len` bytes.
fn decode_stolen(code: &[u8], addr: usize, min_len: usize) -> Result<Vec<Instruction>> {
    let mut decoder = Decoder::with_ip(64, code, addr as u64, DecoderOptions::NONE);
    let mut insts = vec![];
    let mut len = 0;
    while len < min_len {
        if !decoder.can_decode() {
            return Err(Error::Disassemble(addr + len));
        }
        let inst = decoder.decode();
        if inst.code() == Code::INVALID {
            return Err(Error::Disassemble(addr + len));
        }
        len += inst.len();
        insts.push(inst);
    }
    Ok(insts)
}

impl HookBackend for X64Backend {
    fn init(&self) -> Result<()> {
        debug!("x86_64 inline hook backend, page size {:#x}", page_size());
        Ok(())
    }

    unsafe fn hook(&self, target: usize, replacement: usize) -> Result<HookPoint> {
        let mut trampoline = ExecMemory::allocate(target, TRAMPOLINE_SIZE)?;
        let mut entry = jmp_bytes(target, replacement);

        let window = unsafe { slice::from_raw_parts(target as *const u8, FAR_JMP_LEN + MAX_INST_LEN) };
        let insts = decode_stolen(window, target, entry.len())?;
        let stolen_len: usize = insts.iter().map(Instruction::len).sum();

        let mut code = relocate::relocate(&insts, trampoline.addr() as u64)?;
        let back = jmp_bytes(trampoline.addr() + code.len(), target + stolen_len);
        code.extend_from_slice(&back);
        trampoline.seal(&code)?;

        let stolen = window[..stolen_len].to_vec();
        entry.resize(stolen_len, NOP);
        unsafe { patch::write(target, &entry, true) }?;
        debug!(
            "{:#x}: {} bytes stolen, trampoline {:#x}",
            target,
            stolen_len,
            trampoline.addr()
        );
        Ok(HookPoint::new(target, trampoline.addr(), stolen, Some(trampoline)))
    }
}
