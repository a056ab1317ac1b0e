//! ARM (32-bit, ARM mode) rewrite strategies.
//!
//! All generators re-derive the condition and S bit from the original
//! instruction word, so conditional variants (`movne`, `ldreq`, ...) keep
//! their predication. Flag-setting originals are left to other strategies:
//! changing the rotate amount of a MOVS changes the carry out.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::{Architecture, Insn};

use super::arm_imm::{
    dp_imm, dp_reg, encodings, insn_cond, ldr_str_imm, word_of, OP_ADD, OP_MOV, OP_MVN, OP_SUB,
};
use super::{ArchFilter, Registry, RunContext, Strategy};

/// Decoded shape of a data-processing-immediate MOV: destination register,
/// loaded value, condition, and whether the S bit is set.
struct MovImmView {
    rd: u8,
    value: u32,
    cond: u8,
    sets_flags: bool,
}

fn mov_imm_view(insn: &Insn) -> Option<MovImmView> {
    let word = word_of(insn.bytes())?;
    let cond = insn_cond(insn.bytes());
    if cond == 0xf {
        return None;
    }

    let dp_mov = (word >> 26) & 0b11 == 0
        && (word >> 25) & 1 == 1
        && ((word >> 21) & 0xf) as u8 == OP_MOV;
    // MOVW (16-bit immediate) is the common dirty register load on ARMv7
    let movw = (word >> 20) & 0xff == 0x30;
    if !dp_mov && !movw {
        return None;
    }

    let (_, imm) = insn.reg_imm()?;
    Some(MovImmView {
        rd: ((word >> 12) & 0xf) as u8,
        value: imm as u32,
        cond,
        sets_flags: dp_mov && (word >> 20) & 1 == 1,
    })
}

/// Re-encode the same MOV with a different rotation of the immediate.
struct ArmMovRotate;

impl Strategy for ArmMovRotate {
    fn name(&self) -> &'static str {
        "arm_mov_rotate"
    }
    fn priority(&self) -> i32 {
        90
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        match mov_imm_view(insn) {
            // zero only has degenerate rotations; the zero idiom owns it
            Some(v) => !v.sets_flags && v.value != 0 && !encodings(v.value).is_empty(),
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        4
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        for (rot, imm8) in encodings(v.value) {
            let word = dp_imm(v.cond, OP_MOV, false, 0, v.rd, rot, imm8);
            if ctx.bad().clean_u32(word) {
                out.write_word_le(word);
                return;
            }
        }
    }
}

/// Zero loads. `MOV rd, #0` always encodes a null byte, so rewrite it as
/// `SUB rd, rd, rd`, falling back to the rotated `MOV rd, #1; SUB rd, rd, #1`
/// pair when the register number itself makes the subtraction dirty (r0).
struct ArmZeroIdiom;

impl Strategy for ArmZeroIdiom {
    fn name(&self) -> &'static str {
        "arm_zero_idiom"
    }
    fn priority(&self) -> i32 {
        88
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        match mov_imm_view(insn) {
            Some(v) => v.value == 0 && !v.sets_flags && v.rd != 15,
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        8
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };

        let sub = dp_reg(v.cond, OP_SUB, false, v.rd, v.rd, v.rd);
        if ctx.bad().clean_u32(sub) {
            out.write_word_le(sub);
            return;
        }

        for (rot1, imm1) in encodings(1) {
            let load = dp_imm(v.cond, OP_MOV, false, 0, v.rd, rot1, imm1);
            if !ctx.bad().clean_u32(load) {
                continue;
            }
            for (rot2, imm2) in encodings(1) {
                let takedown = dp_imm(v.cond, OP_SUB, false, v.rd, v.rd, rot2, imm2);
                if ctx.bad().clean_u32(takedown) {
                    out.write_word_le(load);
                    out.write_word_le(takedown);
                    return;
                }
            }
        }
    }
}

/// `MOV rd, #v` → `MVN rd, #~v` when the complement is encodable.
struct ArmMovMvn;

impl Strategy for ArmMovMvn {
    fn name(&self) -> &'static str {
        "arm_mov_mvn"
    }
    fn priority(&self) -> i32 {
        80
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        match mov_imm_view(insn) {
            Some(v) => !v.sets_flags && !encodings(!v.value).is_empty(),
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        4
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        for (rot, imm8) in encodings(!v.value) {
            let word = dp_imm(v.cond, OP_MVN, false, 0, v.rd, rot, imm8);
            if ctx.bad().clean_u32(word) {
                out.write_word_le(word);
                return;
            }
        }
    }
}

/// `MOV rd, #v` → `MOV rd, #a; ADD rd, rd, #b` with `a + b == v`.
struct ArmMovAddSplit;

impl Strategy for ArmMovAddSplit {
    fn name(&self) -> &'static str {
        "arm_mov_add_split"
    }
    fn priority(&self) -> i32 {
        70
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        match mov_imm_view(insn) {
            Some(v) => !v.sets_flags,
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        8
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = mov_imm_view(insn) else {
            return;
        };
        for rot1 in 0..16u32 {
            for imm1 in 1..=0xffu32 {
                let a = imm1.rotate_right(rot1 * 2);
                let load = dp_imm(v.cond, OP_MOV, false, 0, v.rd, rot1 as u8, imm1 as u8);
                if !ctx.bad().clean_u32(load) {
                    continue;
                }
                let b = v.value.wrapping_sub(a);
                for (rot2, imm2) in encodings(b) {
                    let bump = dp_imm(v.cond, OP_ADD, false, v.rd, v.rd, rot2, imm2);
                    if ctx.bad().clean_u32(bump) {
                        out.write_word_le(load);
                        out.write_word_le(bump);
                        return;
                    }
                }
            }
        }
    }
}

/// Decoded shape of an LDR/STR-immediate with offset addressing.
struct LdrStrView {
    rn: u8,
    rd: u8,
    disp: i32,
    cond: u8,
    is_load: bool,
    byte_access: bool,
}

fn ldr_str_view(insn: &Insn) -> Option<LdrStrView> {
    let word = word_of(insn.bytes())?;
    // single data transfer, immediate offset: P=1, W=0, register fields valid
    if (word >> 25) & 0b111 != 0b010 {
        return None;
    }
    if (word >> 24) & 1 != 1 || (word >> 21) & 1 != 0 {
        return None;
    }
    let cond = insn_cond(insn.bytes());
    if cond == 0xf {
        return None;
    }
    let rn = ((word >> 16) & 0xf) as u8;
    if rn == 15 {
        return None; // pc-relative loads shift meaning with the base
    }
    let imm12 = (word & 0xfff) as i32;
    let disp = if (word >> 23) & 1 == 1 { imm12 } else { -imm12 };
    Some(LdrStrView {
        rn,
        rd: ((word >> 12) & 0xf) as u8,
        disp,
        cond,
        is_load: (word >> 20) & 1 == 1,
        byte_access: (word >> 22) & 1 == 1,
    })
}

/// Bad displacement bytes → pre-adjust the base, access with a residual
/// displacement, then restore the base. The restore is skipped when a load
/// overwrites its own base register.
struct ArmLdrStrAdjust;

impl Strategy for ArmLdrStrAdjust {
    fn name(&self) -> &'static str {
        "arm_ldr_str_adjust"
    }
    fn priority(&self) -> i32 {
        60
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(Architecture::Arm)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        ldr_str_view(insn).is_some()
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        12
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(v) = ldr_str_view(insn) else {
            return;
        };
        let clobbers_base = v.is_load && v.rd == v.rn;

        for rot in 0..16u32 {
            for imm8 in 1..=0xffu32 {
                let magnitude = imm8.rotate_right(rot * 2);
                if magnitude > 0x7fff_ffff {
                    continue;
                }
                for &sign in &[1i64, -1i64] {
                    let pre = sign * magnitude as i64;
                    let resid = v.disp as i64 - pre;
                    if resid.unsigned_abs() > 4095 {
                        continue;
                    }

                    let (fwd, back) = if sign >= 0 {
                        (OP_ADD, OP_SUB)
                    } else {
                        (OP_SUB, OP_ADD)
                    };
                    let adjust = dp_imm(v.cond, fwd, false, v.rn, v.rn, rot as u8, imm8 as u8);
                    let Some(access) = ldr_str_imm(
                        v.cond,
                        v.is_load,
                        v.byte_access,
                        v.rn,
                        v.rd,
                        resid as i32,
                    ) else {
                        continue;
                    };
                    let restore = dp_imm(v.cond, back, false, v.rn, v.rn, rot as u8, imm8 as u8);

                    let clean = ctx.bad().clean_u32(adjust)
                        && ctx.bad().clean_u32(access)
                        && (clobbers_base || ctx.bad().clean_u32(restore));
                    if clean {
                        out.write_word_le(adjust);
                        out.write_word_le(access);
                        if !clobbers_base {
                            out.write_word_le(restore);
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Register the ARM catalog.
pub fn register_all(registry: &mut Registry) {
    registry.register(Arc::new(ArmMovRotate));
    registry.register(Arc::new(ArmZeroIdiom));
    registry.register(Arc::new(ArmMovMvn));
    registry.register(Arc::new(ArmMovAddSplit));
    registry.register(Arc::new(ArmLdrStrAdjust));
}
