//! Moving stolen x86_64 instructions into a trampoline.
//!
//! Within +/-2GB of the original `BlockEncoder` can fix every relative
//! operand. Further away each instruction is rewritten to an absolute form,
//! and branch targets go through a table of 8-byte addresses appended after
//! the moved code.

use std::ops::Range;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Encoder, FlowControl, Instruction, InstructionBlock,
    MemoryOperand, Mnemonic, Register,
};

use crate::err::{Error, Result};

const NEAR_LIMIT: u64 = 0x7fff_f000;

/// Where the rel32 of a rewritten instruction must point.
struct Slot {
    /// Offset of the rel32 inside the rewritten instruction.
    disp_at: usize,
    /// Offset the rel32 is relative to.
    rip_at: usize,
    target: u64,
}

enum Dest {
    /// Index of a stolen instruction, which moved too.
    Moved(usize),
    Absolute(u64),
}

struct Fixup {
    disp_at: usize,
    rip_at: usize,
    dest: Dest,
}

/// Encodes `insts` so that they behave the same when placed at `new_ip`.
pub(crate) fn relocate(insts: &[Instruction], new_ip: u64) -> Result<Vec<u8>> {
    let (Some(first), Some(last)) = (insts.first(), insts.last()) else {
        return Ok(vec![]);
    };
    if first.ip().abs_diff(new_ip) < NEAR_LIMIT {
        let block = InstructionBlock::new(insts, new_ip);
        return BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
            .map(|r| r.code_buffer)
            .map_err(|_| Error::MoveCode);
    }

    let stolen: Range<u64> = first.ip()..last.next_ip();
    let mut code = Vec::with_capacity(128);
    let mut starts = Vec::with_capacity(insts.len());
    let mut fixups = vec![];
    for inst in insts {
        let start = code.len();
        starts.push(start);
        let Some(slot) = emit_far(inst, new_ip + start as u64, &mut code)? else {
            continue;
        };
        let dest = if stolen.contains(&slot.target) {
            let index = insts
                .iter()
                .position(|i| i.ip() == slot.target)
                .ok_or(Error::MovingCodeNotSupported)?;
            Dest::Moved(index)
        } else {
            Dest::Absolute(slot.target)
        };
        fixups.push(Fixup {
            disp_at: start + slot.disp_at,
            rip_at: start + slot.rip_at,
            dest,
        });
    }
    if fixups.is_empty() {
        return Ok(code);
    }

    // jmp over the table, whose entries are 8-byte aligned
    let end = new_ip + code.len() as u64;
    let padding = ((end + 5 + 7) & !7) - (end + 5);
    let skip = padding + fixups.len() as u64 * 8;
    code.push(0xe9);
    code.extend_from_slice(&(skip as u32).to_le_bytes());
    code.resize(code.len() + padding as usize, 0xcc);

    for fixup in &fixups {
        let entry = code.len();
        let disp = (entry - fixup.rip_at) as u32;
        code[fixup.disp_at..fixup.disp_at + 4].copy_from_slice(&disp.to_le_bytes());
        let absolute = match fixup.dest {
            Dest::Moved(index) => new_ip + starts[index] as u64,
            Dest::Absolute(addr) => addr,
        };
        code.extend_from_slice(&absolute.to_le_bytes());
    }
    Ok(code)
}

fn encode_one(inst: &Instruction, ip: u64) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(64);
    encoder.encode(inst, ip).map_err(|_| Error::MoveCode)?;
    Ok(encoder.take_buffer())
}

/// Appends the far form of `inst` to `code`. Returns the rel32 slot that has
/// to be pointed at the address table, if any.
fn emit_far(inst: &Instruction, ip: u64, code: &mut Vec<u8>) -> Result<Option<Slot>> {
    match inst.flow_control() {
        FlowControl::UnconditionalBranch => {
            // jmp qword ptr [rip+table]
            code.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
            Ok(Some(Slot {
                disp_at: 2,
                rip_at: 6,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectBranch if inst.is_ip_rel_memory_operand() => {
            // mov [rsp-0x10], rax; mov rax, mem; push [rax]; mov rax, [rsp-8]; ret
            code.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0xf0, 0x48, 0xb8]);
            code.extend_from_slice(&inst.ip_rel_memory_address().to_le_bytes());
            code.extend_from_slice(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3]);
            Ok(None)
        }
        FlowControl::ConditionalBranch if inst.is_jcc_short_or_near() => {
            // j!cc +6; jmp qword ptr [rip+table]
            let mut skip = *inst;
            skip.negate_condition_code();
            skip.set_near_branch64(ip + 8);
            skip.as_short_branch();
            code.extend_from_slice(&encode_one(&skip, ip)?);
            code.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
            Ok(Some(Slot {
                disp_at: 4,
                rip_at: 8,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::ConditionalBranch
            if inst.is_jcx_short() || inst.is_loop() || inst.is_loopcc() =>
        {
            // jrcxz +2; jmp +6; jmp qword ptr [rip+table]
            let mut taken = *inst;
            taken.set_near_branch64(ip + 4);
            code.extend_from_slice(&encode_one(&taken, ip)?);
            code.extend_from_slice(&[0xeb, 0x06, 0xff, 0x25, 0, 0, 0, 0]);
            Ok(Some(Slot {
                disp_at: 6,
                rip_at: 10,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::Call if inst.is_call_near() || inst.is_call_far() => {
            // call qword ptr [rip+table]
            code.extend_from_slice(&[0xff, 0x15, 0, 0, 0, 0]);
            Ok(Some(Slot {
                disp_at: 2,
                rip_at: 6,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectCall if inst.is_ip_rel_memory_operand() => {
            // Push the return address by halves, then "call" via push+ret:
            // mov [rsp-0x18], rax; mov rax, mem; push lo; mov dword ptr [rsp+4], hi;
            // push qword ptr [rax]; mov rax, [rsp-8]; ret
            code.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0xe8, 0x48, 0xb8]);
            code.extend_from_slice(&inst.ip_rel_memory_address().to_le_bytes());
            let ret_addr = ip + 0x24;
            code.push(0x68);
            code.extend_from_slice(&(ret_addr as u32).to_le_bytes());
            code.extend_from_slice(&[0xc7, 0x44, 0x24, 0x04]);
            code.extend_from_slice(&((ret_addr >> 32) as u32).to_le_bytes());
            code.extend_from_slice(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3]);
            Ok(None)
        }
        _ if inst.is_ip_rel_memory_operand() => {
            if inst.op0_register() == Register::RSP {
                // e.g. add rsp, [rip+x]: the scratch spill below would break
                return Err(Error::MovingCodeNotSupported);
            }
            code.extend_from_slice(&absolute_memory_form(inst, ip)?);
            Ok(None)
        }
        _ => {
            code.extend_from_slice(&encode_one(inst, ip)?);
            Ok(None)
        }
    }
}

fn uses_register(inst: &Instruction, full: Register) -> bool {
    (0..inst.op_count()).any(|i| inst.op_register(i).full_register() == full)
}

/// Rewrites a rip-relative memory operand as an absolute one.
fn absolute_memory_form(inst: &Instruction, ip: u64) -> Result<Vec<u8>> {
    let mem = inst.ip_rel_memory_address();
    if inst.mnemonic() == Mnemonic::Lea {
        // lea r, [rip+x]  =>  mov r, imm64
        let mov = Instruction::with2(Code::Mov_r64_imm64, inst.op0_register().full_register(), mem)
            .map_err(|_| Error::MoveCode)?;
        return encode_one(&mov, ip);
    }

    // Borrow a register the instruction does not touch:
    // mov [rsp-0x10], tmp; mov tmp, imm64; op [tmp]; mov tmp, [rsp-0x10]
    let tmp = [Register::RBX, Register::R8, Register::R9]
        .into_iter()
        .find(|&r| !uses_register(inst, r))
        .ok_or(Error::MovingCodeNotSupported)?;
    let spill = Instruction::with2(
        Code::Mov_rm64_r64,
        MemoryOperand::with_base_displ(Register::RSP, -16),
        tmp,
    )
    .map_err(|_| Error::MoveCode)?;
    let load = Instruction::with2(Code::Mov_r64_imm64, tmp, mem).map_err(|_| Error::MoveCode)?;
    let mut op = *inst;
    op.set_memory_base(tmp);
    op.set_memory_displacement64(0);
    op.set_memory_displ_size(0);
    let reload = Instruction::with2(
        Code::Mov_r64_rm64,
        tmp,
        MemoryOperand::with_base_displ(Register::RSP, -16 - inst.stack_pointer_increment() as i64),
    )
    .map_err(|_| Error::MoveCode)?;

    let block = [spill, load, op, reload];
    BlockEncoder::encode(64, InstructionBlock::new(&block, ip), BlockEncoderOptions::NONE)
        .map(|r| r.code_buffer)
        .map_err(|_| Error::MoveCode)
}
