//! Moving stolen A64 instructions into a trampoline.
//!
//! Every pc-relative instruction is rewritten to load its absolute target
//! from an inline literal through x17 (IP1), which the procedure call
//! standard leaves free at function entry.

use crate::err::{Error, Result};

pub(crate) const NOP: u32 = 0xd503_201f;
const LDR_X17_8: u32 = 0x5800_0051;
const LDR_X17_12: u32 = 0x5800_0071;
const BR_X17: u32 = 0xd61f_0220;
const BLR_X17: u32 = 0xd63f_0220;
const B: u32 = 0x1400_0000;

pub(crate) const B_RANGE: i64 = 128 << 20;

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// `b` from `from` to `to`, if it reaches.
pub(crate) fn branch(from: u64, to: u64) -> Option<u32> {
    let off = (to as i64).wrapping_sub(from as i64);
    (off % 4 == 0 && (-B_RANGE..B_RANGE).contains(&off))
        .then(|| B | ((off >> 2) as u32 & 0x03ff_ffff))
}

fn quad(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

/// `ldr x17, #8; br x17; .quad to`
pub(crate) fn absolute_jump(to: u64) -> [u32; 4] {
    let [lo, hi] = quad(to);
    [LDR_X17_8, BR_X17, lo, hi]
}

/// Shortest jump from `from` to `to`.
pub(crate) fn jump(from: u64, to: u64) -> Vec<u32> {
    match branch(from, to) {
        Some(b) => vec![b],
        None => absolute_jump(to).to_vec(),
    }
}

enum Kind {
    B { target: u64 },
    Bl { target: u64 },
    /// B.cond, CBZ/CBNZ and TBZ/TBNZ. `mask` selects the immediate field.
    CondBranch { target: u64, shift: u32, mask: u32 },
    Adr { rd: u32, value: u64 },
    Literal { rt: u32, addr: u64, load: Option<u32> },
    Other,
}

fn classify(inst: u32, pc: u64) -> Result<Kind> {
    let rel = |imm: i64| pc.wrapping_add_signed(imm);
    let kind = if inst & 0x7c00_0000 == 0x1400_0000 {
        let target = rel(sign_extend(inst & 0x03ff_ffff, 26) << 2);
        if inst & 0x8000_0000 == 0 {
            Kind::B { target }
        } else {
            Kind::Bl { target }
        }
    } else if inst & 0xff00_0010 == 0x5400_0000 || inst & 0x7e00_0000 == 0x3400_0000 {
        // b.cond / cbz / cbnz: imm19 at [23:5]
        Kind::CondBranch {
            target: rel(sign_extend((inst >> 5) & 0x7ffff, 19) << 2),
            shift: 5,
            mask: 0x7ffff,
        }
    } else if inst & 0x7e00_0000 == 0x3600_0000 {
        // tbz / tbnz: imm14 at [18:5]
        Kind::CondBranch {
            target: rel(sign_extend((inst >> 5) & 0x3fff, 14) << 2),
            shift: 5,
            mask: 0x3fff,
        }
    } else if inst & 0x1f00_0000 == 0x1000_0000 {
        let imm = (((inst >> 5) & 0x7ffff) << 2) | ((inst >> 29) & 3);
        let imm = sign_extend(imm, 21);
        let rd = inst & 0x1f;
        let value = if inst & 0x8000_0000 == 0 {
            rel(imm)
        } else {
            (pc & !0xfff).wrapping_add_signed(imm << 12)
        };
        Kind::Adr { rd, value }
    } else if inst & 0x3b00_0000 == 0x1800_0000 {
        let addr = rel(sign_extend((inst >> 5) & 0x7ffff, 19) << 2);
        let rt = inst & 0x1f;
        let simd = inst & 0x0400_0000 != 0;
        let load = match (inst >> 30, simd) {
            (0b00, false) => Some(0xb940_0000), // ldr wt, [x17]
            (0b01, false) => Some(0xf940_0000), // ldr xt, [x17]
            (0b10, false) => Some(0xb980_0000), // ldrsw xt, [x17]
            (0b11, false) => None,              // prfm
            (0b00, true) => Some(0xbd40_0000),  // ldr st, [x17]
            (0b01, true) => Some(0xfd40_0000),  // ldr dt, [x17]
            (0b10, true) => Some(0x3dc0_0000),  // ldr qt, [x17]
            _ => return Err(Error::MovingCodeNotSupported),
        };
        Kind::Literal { rt, addr, load }
    } else {
        Kind::Other
    };
    Ok(kind)
}

/// Rewrites `insts`, originally at `pc`, so they can run from anywhere.
pub(crate) fn relocate(insts: &[u32], pc: u64) -> Result<Vec<u32>> {
    let mut code = Vec::with_capacity(insts.len() * 6);
    for (i, &inst) in insts.iter().enumerate() {
        let pc = pc + 4 * i as u64;
        match classify(inst, pc)? {
            Kind::B { target } => code.extend_from_slice(&absolute_jump(target)),
            Kind::Bl { target } => {
                // ldr x17, #12; blr x17; b #12; .quad target
                let [lo, hi] = quad(target);
                code.extend_from_slice(&[LDR_X17_12, BLR_X17, B | 3, lo, hi]);
            }
            Kind::CondBranch { target, shift, mask } => {
                // b.cond #8; b #20; ldr x17, #8; br x17; .quad target
                let skip = (inst & !(mask << shift)) | (2 << shift);
                code.extend_from_slice(&[skip, B | 5]);
                code.extend_from_slice(&absolute_jump(target));
            }
            Kind::Adr { rd, value } => {
                // ldr xd, #8; b #12; .quad value
                let [lo, hi] = quad(value);
                code.extend_from_slice(&[0x5800_0040 | rd, B | 3, lo, hi]);
            }
            Kind::Literal { rt, addr, load } => match load {
                Some(load) => {
                    // ldr x17, #12; ldr rt, [x17]; b #12; .quad addr
                    let [lo, hi] = quad(addr);
                    code.extend_from_slice(&[LDR_X17_12, load | (17 << 5) | rt, B | 3, lo, hi]);
                }
                None => code.push(NOP),
            },
            Kind::Other => code.push(inst),
        }
    }
    Ok(code)
}

pub(crate) fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PC: u64 = 0x7f12_3400_0000;

    #[test]
    fn test_branch_range() {
        assert_eq!(branch(0x1000, 0x1010), Some(0x1400_0004));
        assert_eq!(branch(0x1010, 0x1000), Some(0x17ff_fffc));
        assert_eq!(branch(0x1000, 0x1000 + (128 << 20)), None);
        assert_eq!(branch(0x1000, 0x1002), None);
        assert_eq!(jump(0x1000, 0x1_0000_1000).len(), 4);
    }

    #[test]
    fn test_plain_instructions_copied() {
        // stp x29, x30, [sp, #-16]!; mov x29, sp
        let insts = [0xa9bf_7bfd, 0x9100_03fd];
        assert_eq!(relocate(&insts, PC).unwrap(), insts);
    }

    #[test]
    fn test_b_becomes_absolute() {
        // b #0x40
        let code = relocate(&[0x1400_0010], PC).unwrap();
        assert_eq!(code, absolute_jump(PC + 0x40));
    }

    #[test]
    fn test_bl_returns_past_literal() {
        // bl #-8
        let code = relocate(&[0x97ff_fffe], PC).unwrap();
        let target = PC - 8;
        assert_eq!(
            code,
            [LDR_X17_12, BLR_X17, 0x1400_0003, target as u32, (target >> 32) as u32]
        );
    }

    #[test]
    fn test_conditional_branches() {
        // b.ne #0x20
        let code = relocate(&[0x5400_0101], PC + 4).unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(code[0], 0x5400_0041);
        assert_eq!(code[1], 0x1400_0005);
        assert_eq!(code[2..], absolute_jump(PC + 0x24));

        // cbz x0, #-4
        let code = relocate(&[0xb4ff_ffe0], PC).unwrap();
        assert_eq!(code[0], 0xb400_0040);
        assert_eq!(code[2..], absolute_jump(PC - 4));

        // tbnz w3, #2, #0x10
        let code = relocate(&[0x3710_0083], PC).unwrap();
        assert_eq!(code[0], 0x3710_0043);
        assert_eq!(code[2..], absolute_jump(PC + 0x10));
    }

    #[test]
    fn test_adr_adrp_materialised() {
        // adrp x8, #0x1000
        let code = relocate(&[0xb000_0008], PC + 0x123).unwrap();
        let value = (PC & !0xfff) + 0x1000;
        assert_eq!(code, [0x5800_0048, 0x1400_0003, value as u32, (value >> 32) as u32]);

        // adr x1, #-4
        let code = relocate(&[0x10ff_ffe1], PC).unwrap();
        let value = PC - 4;
        assert_eq!(code, [0x5800_0041, 0x1400_0003, value as u32, (value >> 32) as u32]);
    }

    #[test]
    fn test_literal_loads() {
        let addr = PC + 0x10;
        let [lo, hi] = [addr as u32, (addr >> 32) as u32];
        // ldr x2, #0x10
        assert_eq!(
            relocate(&[0x5800_0082], PC).unwrap(),
            [LDR_X17_12, 0xf940_0222, 0x1400_0003, lo, hi]
        );
        // ldr w2, #0x10
        assert_eq!(relocate(&[0x1800_0082], PC).unwrap()[1], 0xb940_0222);
        // ldrsw x2, #0x10
        assert_eq!(relocate(&[0x9800_0082], PC).unwrap()[1], 0xb980_0222);
        // ldr q2, #0x10
        assert_eq!(relocate(&[0x9c00_0082], PC).unwrap()[1], 0x3dc0_0222);
        // prfm pldl1keep, #0x10
        assert_eq!(relocate(&[0xd800_0080], PC).unwrap(), [NOP]);
    }

    #[test]
    fn test_offsets_follow_position() {
        // nop; b #0 (a branch to itself at pc + 4)
        let code = relocate(&[NOP, 0x1400_0000], PC).unwrap();
        assert_eq!(code[0], NOP);
        assert_eq!(code[1..], absolute_jump(PC + 4));
    }

    #[test]
    fn test_to_bytes_little_endian() {
        assert_eq!(to_bytes(&[NOP]), [0x1f, 0x20, 0x03, 0xd5]);
    }
}
