//! AArch64 rewrite strategies.
//!
//! Fixed 4-byte words; the interesting degrees of freedom are the wide-move
//! family (MOVZ/MOVN) and arithmetic reconstruction via ADD. Register 31
//! reads as the zero register in the forms used here.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::{Architecture, Insn};

use super::{ArchFilter, Registry, RunContext, Strategy};

const ZR: u8 = 31;

/// MOVZ rd, #imm16, LSL #(hw*16)
fn movz(sf: bool, rd: u8, imm16: u16, hw: u8) -> u32 {
    0x5280_0000
        | ((sf as u32) << 31)
        | ((hw as u32 & 0x3) << 21)
        | ((imm16 as u32) << 5)
        | (rd as u32 & 0x1f)
}

/// MOVN rd, #imm16, LSL #(hw*16) — loads the complement of the shifted field.
fn movn(sf: bool, rd: u8, imm16: u16, hw: u8) -> u32 {
    0x1280_0000
        | ((sf as u32) << 31)
        | ((hw as u32 & 0x3) << 21)
        | ((imm16 as u32) << 5)
        | (rd as u32 & 0x1f)
}

/// ORR rd, rn, rm (shifted register, shift #0)
fn orr_reg(sf: bool, rd: u8, rn: u8, rm: u8) -> u32 {
    0x2a00_0000
        | ((sf as u32) << 31)
        | ((rm as u32 & 0x1f) << 16)
        | ((rn as u32 & 0x1f) << 5)
        | (rd as u32 & 0x1f)
}

/// ADD rd, rn, #imm12
fn add_imm(sf: bool, rd: u8, rn: u8, imm12: u16) -> u32 {
    0x1100_0000
        | ((sf as u32) << 31)
        | ((imm12 as u32 & 0xfff) << 10)
        | ((rn as u32 & 0x1f) << 5)
        | (rd as u32 & 0x1f)
}

/// Width mask of the destination register.
fn width_mask(sf: bool) -> u64 {
    if sf {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

/// The MOVZ window `(hw, imm16)` holding `value`, if it fits one.
fn movz_parts(sf: bool, value: u64) -> Option<(u8, u16)> {
    let windows = if sf { 4 } else { 2 };
    for hw in 0..windows {
        if value & !(0xffffu64 << (hw * 16)) == 0 {
            return Some((hw as u8, (value >> (hw * 16)) as u16));
        }
    }
    None
}

/// The MOVN window producing `value`, if the complement fits one.
fn movn_parts(sf: bool, value: u64) -> Option<(u8, u16)> {
    movz_parts(sf, !value & width_mask(sf))
}

/// Decoded shape of a wide-move register load.
struct MovImmView {
    rd: u8,
    sf: bool,
    value: u64,
}

fn mov_imm_view(insn: &Insn) -> Option<MovImmView> {
    if insn.mnemonic != "mov" && insn.mnemonic != "movz" {
        return None;
    }
    let (reg, imm) = insn.reg_imm()?;
    let rd = reg.encoding?;
    if rd == ZR {
        return None;
    }
    let sf = reg.name.starts_with('x');
    let value = if sf {
        imm as u64
    } else {
        imm as i32 as u32 as u64
    };
    Some(MovImmView { rd, sf, value })
}

/// `MOV rd, #0` → `ORR rd, zr, zr`. MOVZ with a zero field is nothing but
/// null bytes; the register form never is for rd < 29.
struct A64ZeroViaZr;

impl Strategy for A64ZeroViaZr {
    fn name(&self) -> &'static str {
        "a64_zero_via_zr"
    }
    fn priority(&self) -> i32 {
        90
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm64)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        matches!(mov_imm_view(insn), Some(v) if v.value == 0)
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        4
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        out.write_word_le(orr_reg(v.sf, v.rd, ZR, ZR));
    }
}

/// MOVN complement form for values whose inverse fits one 16-bit window.
struct A64MovnForm;

impl Strategy for A64MovnForm {
    fn name(&self) -> &'static str {
        "a64_movn_form"
    }
    fn priority(&self) -> i32 {
        80
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm64)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        matches!(mov_imm_view(insn), Some(v) if movn_parts(v.sf, v.value).is_some())
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        4
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        let Some((hw, imm16)) = movn_parts(v.sf, v.value) else {
            return;
        };
        out.write_word_le(movn(v.sf, v.rd, imm16, hw));
    }
}

/// `MOVZ rd, #a; ADD rd, rd, #b` with `a + b == value`. The adjustment is
/// rotated through a run counter so repeated loads diverge.
struct A64MovAddSplit;

impl Strategy for A64MovAddSplit {
    fn name(&self) -> &'static str {
        "a64_mov_add_split"
    }
    fn priority(&self) -> i32 {
        70
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm64)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        mov_imm_view(insn).is_some()
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        8
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        let rotation = ctx.bump(self.name());
        for i in 0..0xfffu32 {
            let b = (((i + rotation) % 0xfff) + 1) as u16;
            let Some(a) = v.value.checked_sub(b as u64) else {
                continue;
            };
            let Some((hw, imm16)) = movz_parts(v.sf, a) else {
                continue;
            };
            let load = movz(v.sf, v.rd, imm16, hw);
            let bump = add_imm(v.sf, v.rd, v.rd, b);
            if ctx.bad().clean_u32(load) && ctx.bad().clean_u32(bump) {
                out.write_word_le(load);
                out.write_word_le(bump);
                return;
            }
        }
    }
}

/// Register the AArch64 catalog.
pub fn register_all(registry: &mut Registry) {
    registry.register(Arc::new(A64ZeroViaZr));
    registry.register(Arc::new(A64MovnForm));
    registry.register(Arc::new(A64MovAddSplit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BadByteSet, Operand, Reg, MAX_INSTRUCTION_SIZE};

    fn a64_insn(reg_name: &str, enc: u8, imm: i64, raw: [u8; 4]) -> Insn {
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[..4].copy_from_slice(&raw);
        Insn {
            addr: 0,
            size: 4,
            mnemonic: "mov".to_string(),
            op_str: format!("{}, #{:#x}", reg_name, imm),
            bytes,
            operands: vec![
                Operand::Reg(Reg {
                    name: reg_name.to_string(),
                    encoding: Some(enc),
                }),
                Operand::Imm(imm),
            ],
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Architecture::Arm64, BadByteSet::default())
    }

    #[test]
    fn test_zero_via_zr() {
        // mov w0, #0 = 52800000
        let insn = a64_insn("w0", 0, 0, [0x00, 0x00, 0x80, 0x52]);
        let mut c = ctx();
        assert!(A64ZeroViaZr.applies(&insn, &c));

        let mut out = Buffer::new();
        A64ZeroViaZr.generate(&insn, &mut c, &mut out);
        // orr w0, wzr, wzr
        assert_eq!(out.bytes(), &[0xe0, 0x03, 0x1f, 0x2a]);
    }

    #[test]
    fn test_zero_via_zr_64bit() {
        // mov x5, #0 = d2800005
        let insn = a64_insn("x5", 5, 0, [0x05, 0x00, 0x80, 0xd2]);
        let mut c = ctx();

        let mut out = Buffer::new();
        A64ZeroViaZr.generate(&insn, &mut c, &mut out);
        // orr x5, xzr, xzr
        assert_eq!(out.bytes(), &[0xe5, 0x03, 0x1f, 0xaa]);
    }

    #[test]
    fn test_movn_form() {
        // mov w1, #0xffffffff — complement 0 fits window 0
        let insn = a64_insn("w1", 1, -1, [0x01, 0x00, 0x80, 0x12]);
        let c = ctx();
        assert!(A64MovnForm.applies(&insn, &c));
        assert_eq!(movn_parts(false, 0xffff_ffff), Some((0, 0)));

        // mov w1, #0x12345678 — complement does not fit one window
        let insn = a64_insn("w1", 1, 0x1234_5678, [0x01, 0x00, 0x80, 0x52]);
        assert!(!A64MovnForm.applies(&insn, &c));
    }

    #[test]
    fn test_add_split_reconstructs() {
        // mov w2, #0x10000 = movz w2, #1, lsl #16 = 52a00022
        let insn = a64_insn("w2", 2, 0x1_0000, [0x22, 0x00, 0xa0, 0x52]);
        let mut c = ctx();
        assert!(A64MovAddSplit.applies(&insn, &c));

        let mut out = Buffer::new();
        A64MovAddSplit.generate(&insn, &mut c, &mut out);
        assert_eq!(out.len(), 8);
        assert!(c.bad().is_clean(out.bytes()));

        // decode: movz value plus add immediate equals the target
        let w1 = u32::from_le_bytes(out.bytes()[..4].try_into().unwrap());
        let w2 = u32::from_le_bytes(out.bytes()[4..].try_into().unwrap());
        let hw = (w1 >> 21) & 0x3;
        let imm16 = ((w1 >> 5) & 0xffff) as u64;
        let imm12 = ((w2 >> 10) & 0xfff) as u64;
        assert_eq!((imm16 << (hw * 16)) + imm12, 0x1_0000);
    }

    #[test]
    fn test_movz_parts() {
        assert_eq!(movz_parts(false, 0x1000), Some((0, 0x1000)));
        assert_eq!(movz_parts(false, 0x1000_0000), Some((1, 0x1000)));
        assert_eq!(movz_parts(false, 0x1000_1000), None);
        assert_eq!(movz_parts(true, 0xffff_0000_0000), Some((2, 0xffff)));
    }
}
