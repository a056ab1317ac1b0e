//! x86-32 / x86-64 rewrite strategies.
//!
//! Immediate loads are rebuilt with 32-bit operations; on x86-64 a 32-bit
//! write zero-extends, so 64-bit destinations are handled whenever the
//! immediate fits an unsigned 32-bit value. Registers r8-r15 take a REX.B
//! (or REX.RB) prefix.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::decoder::jcc_condition;
use crate::{Architecture, Insn};

use super::{ArchFilter, Registry, RunContext, Strategy};

/// Register operand width, derived from the Capstone name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    W8,
    W16,
    W32,
    W64,
}

fn reg_width(name: &str) -> Option<Width> {
    match name {
        "al" | "cl" | "dl" | "bl" | "ah" | "ch" | "dh" | "bh" | "spl" | "bpl" | "sil" | "dil" => {
            Some(Width::W8)
        }
        "ax" | "cx" | "dx" | "bx" | "sp" | "bp" | "si" | "di" => Some(Width::W16),
        "rax" | "rcx" | "rdx" | "rbx" | "rsp" | "rbp" | "rsi" | "rdi" => Some(Width::W64),
        _ if name.starts_with('e') => Some(Width::W32),
        _ => {
            let rest = name.strip_prefix('r')?;
            if rest.ends_with('d') {
                Some(Width::W32)
            } else if rest.ends_with('w') {
                Some(Width::W16)
            } else if rest.ends_with('b') {
                Some(Width::W8)
            } else if rest.chars().all(|c| c.is_ascii_digit()) {
                Some(Width::W64)
            } else {
                None
            }
        }
    }
}

/// The `mov reg, imm` shape the immediate strategies rebuild: encoding
/// number, value as an unsigned 32-bit quantity, and destination width.
/// 64-bit destinations qualify only when the value zero-extends.
fn imm32_view(insn: &Insn) -> Option<(u8, u32, Width)> {
    if insn.mnemonic != "mov" && insn.mnemonic != "movabs" {
        return None;
    }
    let (reg, imm) = insn.reg_imm()?;
    let enc = reg.encoding?;
    match reg_width(&reg.name)? {
        Width::W32 => Some((enc, imm as u32, Width::W32)),
        Width::W64 if (0..=u32::MAX as i64).contains(&imm) => {
            Some((enc, imm as u32, Width::W64))
        }
        _ => None,
    }
}

fn emit_mov_imm(out: &mut Buffer, enc: u8, value: u32) {
    if enc >= 8 {
        out.write_u8(0x41);
    }
    out.write_u8(0xb8 + (enc & 7));
    out.write_u32_le(value);
}

/// `81 /ext reg, imm32` — ADD is /0, XOR is /6.
fn emit_alu_imm(out: &mut Buffer, ext: u8, enc: u8, value: u32) {
    if enc >= 8 {
        out.write_u8(0x41);
    }
    out.write_u8(0x81);
    out.write_u8(0xc0 | (ext << 3) | (enc & 7));
    out.write_u32_le(value);
}

/// `F7 /ext reg` — NOT is /2, NEG is /3.
fn emit_grp3(out: &mut Buffer, ext: u8, enc: u8) {
    if enc >= 8 {
        out.write_u8(0x41);
    }
    out.write_u8(0xf7);
    out.write_u8(0xc0 | (ext << 3) | (enc & 7));
}

/// `MOV r, 0` → `XOR r, r`. The most compact zeroing idiom there is.
struct MovZeroXor {
    arch: Architecture,
}

impl Strategy for MovZeroXor {
    fn name(&self) -> &'static str {
        "mov_zero_xor"
    }
    fn priority(&self) -> i32 {
        95
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        matches!(imm32_view(insn), Some((_, 0, _)))
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        3
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, _, _)) = imm32_view(insn) else {
            return;
        };
        if enc >= 8 {
            out.write_u8(0x45);
        }
        out.write_u8(0x31);
        out.write_u8(0xc0 | ((enc & 7) << 3) | (enc & 7));
    }
}

/// Small immediates via `PUSH imm8; POP r`. The push sign-extends, so a
/// 32-bit destination on x86-64 only qualifies for non-negative values.
struct PushPopImm {
    arch: Architecture,
}

impl PushPopImm {
    fn view(&self, insn: &Insn) -> Option<(u8, i8)> {
        if insn.mnemonic != "mov" && insn.mnemonic != "movabs" {
            return None;
        }
        let (reg, imm) = insn.reg_imm()?;
        let enc = reg.encoding?;
        match reg_width(&reg.name)? {
            Width::W32 => {
                let v = imm as u32 as i32;
                let ok = match self.arch {
                    Architecture::X86 => (-128..=127).contains(&v),
                    _ => (0..=127).contains(&v),
                };
                if ok {
                    Some((enc, v as i8))
                } else {
                    None
                }
            }
            Width::W64 if (-128..=127).contains(&imm) => Some((enc, imm as i8)),
            _ => None,
        }
    }
}

impl Strategy for PushPopImm {
    fn name(&self) -> &'static str {
        "push_pop_imm"
    }
    fn priority(&self) -> i32 {
        90
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        self.view(insn).is_some()
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        4
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, v)) = self.view(insn) else {
            return;
        };
        out.write_u8(0x6a);
        out.write_u8(v as u8);
        if enc >= 8 {
            out.write_u8(0x41);
        }
        out.write_u8(0x58 + (enc & 7));
    }
}

/// `MOV r, imm^K; XOR r, K` with a repeated-byte key chosen so both halves
/// scan clean. The key pick rotates with a run counter so neighbouring
/// rewrites don't all share one key.
struct MovXorImm {
    arch: Architecture,
}

impl Strategy for MovXorImm {
    fn name(&self) -> &'static str {
        "mov_xor_imm"
    }
    fn priority(&self) -> i32 {
        80
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        imm32_view(insn).is_some()
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        13
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, value, _)) = imm32_view(insn) else {
            return;
        };
        let rotation = ctx.bump(self.name());
        for i in 0..255u32 {
            let k = (((i + rotation) % 255) + 1) as u8;
            if ctx.bad().contains(k) {
                continue;
            }
            let key = u32::from(k) * 0x0101_0101;
            if ctx.bad().clean_u32(value ^ key) {
                emit_mov_imm(out, enc, value ^ key);
                emit_alu_imm(out, 6, enc, key);
                return;
            }
        }
    }
}

/// `MOV r, -imm; NEG r` when the two's complement scans clean.
struct MovNegImm {
    arch: Architecture,
}

impl Strategy for MovNegImm {
    fn name(&self) -> &'static str {
        "mov_neg_imm"
    }
    fn priority(&self) -> i32 {
        75
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, ctx: &RunContext) -> bool {
        match imm32_view(insn) {
            Some((_, value, _)) => ctx.bad().clean_u32(value.wrapping_neg()),
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        9
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, value, _)) = imm32_view(insn) else {
            return;
        };
        emit_mov_imm(out, enc, value.wrapping_neg());
        emit_grp3(out, 3, enc);
    }
}

/// `MOV r, !imm; NOT r` when the complement scans clean. NOT leaves the
/// flags alone, unlike the NEG form.
struct MovNotImm {
    arch: Architecture,
}

impl Strategy for MovNotImm {
    fn name(&self) -> &'static str {
        "mov_not_imm"
    }
    fn priority(&self) -> i32 {
        70
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, ctx: &RunContext) -> bool {
        match imm32_view(insn) {
            Some((_, value, _)) => ctx.bad().clean_u32(!value),
            None => false,
        }
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        9
    }
    fn generate(&self, insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, value, _)) = imm32_view(insn) else {
            return;
        };
        emit_mov_imm(out, enc, !value);
        emit_grp3(out, 2, enc);
    }
}

/// `MOV r, a; ADD r, b` with `a + b == imm` and both halves clean.
struct MovAddSplit {
    arch: Architecture,
}

impl Strategy for MovAddSplit {
    fn name(&self) -> &'static str {
        "mov_add_split"
    }
    fn priority(&self) -> i32 {
        65
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        imm32_view(insn).is_some()
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        13
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some((enc, value, _)) = imm32_view(insn) else {
            return;
        };
        let rotation = ctx.bump(self.name());
        for i in 0..255u32 {
            let k = (((i + rotation) % 255) + 1) as u8;
            if ctx.bad().contains(k) {
                continue;
            }
            let b = u32::from(k) * 0x0101_0101;
            let a = value.wrapping_sub(b);
            if ctx.bad().clean_u32(a) {
                emit_mov_imm(out, enc, a);
                emit_alu_imm(out, 0, enc, b);
                return;
            }
        }
    }
}

/// Near → short branch form. The displacement byte is a placeholder the
/// relocation pass overwrites; applicability is pre-filtered to targets
/// that were short-range in the original layout.
struct JmpNarrow {
    arch: Architecture,
}

fn short_range_plausible(insn: &Insn) -> bool {
    match insn.rel_target() {
        Some(target) => {
            let after = insn.addr as i64 + insn.size as i64;
            (target as i64 - after).abs() <= 100
        }
        None => false,
    }
}

impl Strategy for JmpNarrow {
    fn name(&self) -> &'static str {
        "jmp_narrow"
    }
    fn priority(&self) -> i32 {
        85
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        insn.mnemonic == "jmp" && insn.bytes()[0] == 0xe9 && short_range_plausible(insn)
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        2
    }
    fn generate(&self, _insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        out.write_u8(0xeb);
        out.write_u8(ctx.filler_byte());
    }
}

/// Near → short conditional branch form.
struct JccNarrow {
    arch: Architecture,
}

impl Strategy for JccNarrow {
    fn name(&self) -> &'static str {
        "jcc_narrow"
    }
    fn priority(&self) -> i32 {
        85
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        jcc_condition(&insn.mnemonic).is_some()
            && insn.bytes()[0] == 0x0f
            && short_range_plausible(insn)
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        2
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(cc) = jcc_condition(&insn.mnemonic) else {
            return;
        };
        out.write_u8(0x70 + cc);
        out.write_u8(ctx.filler_byte());
    }
}

/// Short → near branch form: the longer-form escape hatch the relocation
/// pass routes to when a displacement stops fitting eight bits.
struct JmpWiden {
    arch: Architecture,
}

impl Strategy for JmpWiden {
    fn name(&self) -> &'static str {
        "jmp_widen"
    }
    fn priority(&self) -> i32 {
        60
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        insn.mnemonic == "jmp" && insn.bytes()[0] == 0xeb
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        5
    }
    fn generate(&self, _insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let filler = ctx.filler_byte();
        out.write_u8(0xe9);
        out.append(&[filler; 4]);
    }
}

/// Short → near conditional branch form.
struct JccWiden {
    arch: Architecture,
}

impl Strategy for JccWiden {
    fn name(&self) -> &'static str {
        "jcc_widen"
    }
    fn priority(&self) -> i32 {
        60
    }
    fn arch(&self) -> ArchFilter {
        ArchFilter::Only(self.arch)
    }
    fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
        jcc_condition(&insn.mnemonic).is_some() && (0x70..=0x7f).contains(&insn.bytes()[0])
    }
    fn max_size(&self, _insn: &Insn) -> usize {
        6
    }
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer) {
        let Some(cc) = jcc_condition(&insn.mnemonic) else {
            return;
        };
        let filler = ctx.filler_byte();
        out.write_u8(0x0f);
        out.write_u8(0x80 + cc);
        out.append(&[filler; 4]);
    }
}

/// Register the x86 catalog for both x86-32 and x86-64.
pub fn register_all(registry: &mut Registry) {
    for &arch in &[Architecture::X86, Architecture::X64] {
        registry.register(Arc::new(MovZeroXor { arch }));
        registry.register(Arc::new(PushPopImm { arch }));
        registry.register(Arc::new(JccNarrow { arch }));
        registry.register(Arc::new(JmpNarrow { arch }));
        registry.register(Arc::new(MovXorImm { arch }));
        registry.register(Arc::new(MovNegImm { arch }));
        registry.register(Arc::new(MovNotImm { arch }));
        registry.register(Arc::new(MovAddSplit { arch }));
        registry.register(Arc::new(JccWiden { arch }));
        registry.register(Arc::new(JmpWiden { arch }));
    }
}
