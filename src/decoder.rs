//! Capstone-based instruction decoding with semantic operand classification.

use std::fmt;

use capstone::arch::arm::ArchMode as ArmMode;
use capstone::arch::arm::{ArmOperand, ArmOperandType};
use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::arch::arm64::{Arm64Operand, Arm64OperandType};
use capstone::arch::x86::ArchMode as X86Mode;
use capstone::arch::x86::{X86Operand, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Capstone, RegId};

use crate::{
    Address, Architecture, EngineError, Insn, MemOperand, Operand, Reg, MAX_INSTRUCTION_SIZE,
};

/// A Capstone-based decoder configured for one architecture.
///
/// Detail mode is always on: selection and relocation need the operand
/// classification, not just mnemonic text.
pub struct CapstoneDecoder {
    cs: Capstone,
    arch: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture.
    pub fn for_architecture(arch: Architecture) -> Result<Self, EngineError> {
        let cs = match arch {
            Architecture::X86 => Capstone::new()
                .x86()
                .mode(X86Mode::Mode32)
                .detail(true)
                .build()?,
            Architecture::X64 => Capstone::new()
                .x86()
                .mode(X86Mode::Mode64)
                .detail(true)
                .build()?,
            Architecture::Arm => Capstone::new()
                .arm()
                .mode(ArmMode::Arm)
                .detail(true)
                .build()?,
            Architecture::Arm64 => Capstone::new()
                .arm64()
                .mode(Arm64Mode::Arm)
                .detail(true)
                .build()?,
        };

        Ok(CapstoneDecoder { cs, arch })
    }

    /// The architecture this decoder was built for.
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Decode the whole buffer into an ordered instruction list.
    ///
    /// Fails with a located `Decode` error if the disassembler cannot make
    /// forward progress before the end of the buffer — a malformed or
    /// truncated instruction is fatal for the run, never skipped.
    pub fn decode_all(&self, image: &[u8], base: Address) -> Result<Vec<Insn>, EngineError> {
        let decoded = self.cs.disasm_all(image, base)?;

        let mut out = Vec::with_capacity(decoded.len());
        let mut consumed = 0usize;

        for i in decoded.iter() {
            let mnemonic = i.mnemonic().unwrap_or("").to_string();
            let op_str = i.op_str().unwrap_or("").to_string();

            let detail = self.cs.insn_detail(i)?;
            let operands = self.classify_operands(&mnemonic, detail.arch_detail().operands());

            let raw = i.bytes();
            let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
            bytes[..raw.len().min(MAX_INSTRUCTION_SIZE)]
                .copy_from_slice(&raw[..raw.len().min(MAX_INSTRUCTION_SIZE)]);

            out.push(Insn {
                addr: i.address(),
                size: raw.len() as u8,
                mnemonic,
                op_str,
                bytes,
                operands,
            });

            consumed += raw.len();
        }

        if consumed < image.len() {
            return Err(EngineError::Decode {
                offset: base + consumed as Address,
            });
        }

        log::debug!(
            "decoded {} instructions from {} bytes ({})",
            out.len(),
            image.len(),
            self.arch
        );
        Ok(out)
    }

    /// Map Capstone operand detail onto the engine's operand model. The
    /// last immediate of a relative-branch mnemonic becomes a `Rel` target.
    fn classify_operands(&self, mnemonic: &str, ops: Vec<ArchOperand>) -> Vec<Operand> {
        let rel_slot = if is_relative_branch(self.arch, mnemonic) {
            last_imm_index(&ops)
        } else {
            None
        };

        ops.into_iter()
            .enumerate()
            .filter_map(|(idx, op)| self.classify_one(op, rel_slot == Some(idx)))
            .collect()
    }

    fn classify_one(&self, op: ArchOperand, is_rel: bool) -> Option<Operand> {
        match op {
            ArchOperand::X86Operand(X86Operand { op_type, .. }) => match op_type {
                X86OperandType::Reg(id) => Some(Operand::Reg(self.reg(id))),
                X86OperandType::Imm(v) if is_rel => Some(Operand::Rel(v as Address)),
                X86OperandType::Imm(v) => Some(Operand::Imm(v)),
                X86OperandType::Mem(m) => {
                    let base = self.reg_opt(m.base());
                    let pc_relative = base
                        .as_ref()
                        .map(|r| r.name == "rip" || r.name == "eip")
                        .unwrap_or(false);
                    Some(Operand::Mem(MemOperand {
                        base,
                        index: self.reg_opt(m.index()),
                        scale: m.scale(),
                        disp: m.disp(),
                        pc_relative,
                    }))
                }
                _ => None,
            },
            ArchOperand::ArmOperand(ArmOperand { op_type, .. }) => match op_type {
                ArmOperandType::Reg(id) => Some(Operand::Reg(self.reg(id))),
                ArmOperandType::Imm(v) if is_rel => Some(Operand::Rel(v as u32 as Address)),
                ArmOperandType::Imm(v) => Some(Operand::Imm(v as i64)),
                ArmOperandType::Mem(m) => {
                    let base = self.reg_opt(m.base());
                    let pc_relative = base.as_ref().map(|r| r.name == "pc").unwrap_or(false);
                    Some(Operand::Mem(MemOperand {
                        base,
                        index: self.reg_opt(m.index()),
                        scale: m.scale(),
                        disp: m.disp() as i64,
                        pc_relative,
                    }))
                }
                _ => None,
            },
            ArchOperand::Arm64Operand(Arm64Operand { op_type, .. }) => match op_type {
                Arm64OperandType::Reg(id) => Some(Operand::Reg(self.reg(id))),
                Arm64OperandType::Imm(v) if is_rel => Some(Operand::Rel(v as Address)),
                Arm64OperandType::Imm(v) => Some(Operand::Imm(v)),
                Arm64OperandType::Mem(m) => Some(Operand::Mem(MemOperand {
                    base: self.reg_opt(m.base()),
                    index: self.reg_opt(m.index()),
                    scale: 1,
                    disp: m.disp() as i64,
                    pc_relative: false,
                })),
                _ => None,
            },
            _ => None,
        }
    }

    fn reg(&self, id: RegId) -> Reg {
        let name = self.cs.reg_name(id).unwrap_or_default();
        Reg {
            encoding: reg_encoding(self.arch, &name),
            name,
        }
    }

    fn reg_opt(&self, id: RegId) -> Option<Reg> {
        if id.0 == 0 {
            None
        } else {
            Some(self.reg(id))
        }
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

/// Index of the last immediate operand, the slot that holds the branch
/// target (TBZ-style instructions carry a bit-number immediate before it).
fn last_imm_index(ops: &[ArchOperand]) -> Option<usize> {
    ops.iter().rposition(|op| {
        matches!(
            op,
            ArchOperand::X86Operand(X86Operand {
                op_type: X86OperandType::Imm(_),
                ..
            }) | ArchOperand::ArmOperand(ArmOperand {
                op_type: ArmOperandType::Imm(_),
                ..
            }) | ArchOperand::Arm64Operand(Arm64Operand {
                op_type: Arm64OperandType::Imm(_),
                ..
            })
        )
    })
}

/// ARM condition suffixes, as Capstone prints them.
const ARM_CONDS: &[&str] = &[
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
    "al",
];

/// True if `mnemonic` is a PC-relative branch/call on `arch`. Register- and
/// memory-indirect forms of the same mnemonics are harmless here: only
/// immediate operands get reclassified as targets.
pub fn is_relative_branch(arch: Architecture, mnemonic: &str) -> bool {
    match arch {
        Architecture::X86 | Architecture::X64 => {
            matches!(
                mnemonic,
                "jmp" | "call" | "loop" | "loope" | "loopne" | "jcxz" | "jecxz" | "jrcxz"
            ) || jcc_condition(mnemonic).is_some()
        }
        Architecture::Arm => {
            mnemonic == "b"
                || mnemonic == "bl"
                || mnemonic
                    .strip_prefix("bl")
                    .map(|c| ARM_CONDS.contains(&c))
                    .unwrap_or(false)
                || mnemonic
                    .strip_prefix('b')
                    .map(|c| ARM_CONDS.contains(&c))
                    .unwrap_or(false)
        }
        Architecture::Arm64 => {
            mnemonic == "b"
                || mnemonic == "bl"
                || mnemonic.starts_with("b.")
                || matches!(mnemonic, "cbz" | "cbnz" | "tbz" | "tbnz")
        }
    }
}

/// Condition nibble for an x86 conditional-jump mnemonic (the `cc` in
/// `70+cc` / `0F 80+cc`), or `None` if the mnemonic is not a Jcc.
pub fn jcc_condition(mnemonic: &str) -> Option<u8> {
    let cond = match mnemonic {
        "jo" => 0x0,
        "jno" => 0x1,
        "jb" | "jc" | "jnae" => 0x2,
        "jae" | "jnb" | "jnc" => 0x3,
        "je" | "jz" => 0x4,
        "jne" | "jnz" => 0x5,
        "jbe" | "jna" => 0x6,
        "ja" | "jnbe" => 0x7,
        "js" => 0x8,
        "jns" => 0x9,
        "jp" | "jpe" => 0xa,
        "jnp" | "jpo" => 0xb,
        "jl" | "jnge" => 0xc,
        "jge" | "jnl" => 0xd,
        "jle" | "jng" => 0xe,
        "jg" | "jnle" => 0xf,
        _ => return None,
    };
    Some(cond)
}

/// Hardware encoding number for a general-purpose register name, or `None`
/// for names the rewriter never manipulates (segment, vector, flags, ...).
pub fn reg_encoding(arch: Architecture, name: &str) -> Option<u8> {
    match arch {
        Architecture::X86 | Architecture::X64 => x86_reg_encoding(name),
        Architecture::Arm => arm_reg_encoding(name),
        Architecture::Arm64 => arm64_reg_encoding(name),
    }
}

fn x86_reg_encoding(name: &str) -> Option<u8> {
    match name {
        "al" | "ax" | "eax" | "rax" => Some(0),
        "cl" | "cx" | "ecx" | "rcx" => Some(1),
        "dl" | "dx" | "edx" | "rdx" => Some(2),
        "bl" | "bx" | "ebx" | "rbx" => Some(3),
        "spl" | "sp" | "esp" | "rsp" => Some(4),
        "bpl" | "bp" | "ebp" | "rbp" => Some(5),
        "sil" | "si" | "esi" | "rsi" => Some(6),
        "dil" | "di" | "edi" | "rdi" => Some(7),
        _ => {
            // r8..r15 with optional d/w/b width suffix
            let rest = name.strip_prefix('r')?;
            let digits = rest.trim_end_matches(|c| c == 'd' || c == 'w' || c == 'b');
            match digits.parse::<u8>() {
                Ok(n @ 8..=15) => Some(n),
                _ => None,
            }
        }
    }
}

fn arm_reg_encoding(name: &str) -> Option<u8> {
    match name {
        "sb" => Some(9),
        "sl" => Some(10),
        "fp" => Some(11),
        "ip" => Some(12),
        "sp" => Some(13),
        "lr" => Some(14),
        "pc" => Some(15),
        _ => {
            let rest = name.strip_prefix('r')?;
            match rest.parse::<u8>() {
                Ok(n @ 0..=15) => Some(n),
                _ => None,
            }
        }
    }
}

fn arm64_reg_encoding(name: &str) -> Option<u8> {
    match name {
        "xzr" | "wzr" => Some(31),
        "sp" | "wsp" => Some(31),
        _ => {
            let rest = name.strip_prefix('x').or_else(|| name.strip_prefix('w'))?;
            match rest.parse::<u8>() {
                Ok(n @ 0..=30) => Some(n),
                _ => None,
            }
        }
    }
}
