//! Core IR, traits, and the engine entry point for the Nullsweep rewriter.
//!
//! This library rewrites machine-code byte sequences (shellcode) so that the
//! result contains no byte from a configurable forbidden set — by default the
//! null byte — while preserving execution semantics. It supports x86-32,
//! x86-64, ARM and AArch64 and integrates with the Capstone disassembly
//! engine for decoding.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use nullsweep::{transform, Architecture, BadByteSet};
//!
//! // mov eax, 0x1000 ; ret — the immediate encodes three null bytes
//! let payload = [0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3];
//!
//! let clean = transform(&payload, Architecture::X86, &BadByteSet::default(), None).unwrap();
//!
//! // Same register-load effect, zero null bytes
//! assert!(!clean.contains(&0x00));
//! ```

pub mod batch;
pub mod buffer;
pub mod decoder;
pub mod engine;
pub mod format;
pub mod model;
pub mod reloc;
pub mod strategy;
mod pipeline_tests;
#[cfg(feature = "extension-module")]
pub mod python;

pub use engine::{transform, Engine, Transformed};
pub use format::{OutputFormat, TransformReport};

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

/// Represents an address (or offset) in the payload
pub type Address = u64;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// 64-bit x86
    X64,
    /// ARM (32-bit, ARM mode)
    Arm,
    /// AArch64 (ARM 64-bit)
    Arm64,
}

impl Architecture {
    /// All supported architectures.
    pub fn all() -> &'static [Architecture] {
        &[
            Architecture::X86,
            Architecture::X64,
            Architecture::Arm,
            Architecture::Arm64,
        ]
    }

    /// Fixed instruction width in bytes, if the ISA has one.
    pub fn fixed_insn_width(&self) -> Option<usize> {
        match self {
            Architecture::X86 | Architecture::X64 => None,
            Architecture::Arm | Architecture::Arm64 => Some(4),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86-32"),
            Architecture::X64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Arm64 => write!(f, "AArch64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86" | "x86-32" | "i386" | "ia32" => Ok(Architecture::X86),
            "x64" | "x86-64" | "x86_64" | "amd64" => Ok(Architecture::X64),
            "arm" | "arm32" | "armv7" => Ok(Architecture::Arm),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(format!("Unsupported architecture: {}", s)),
        }
    }
}

/// The set of byte values forbidden from appearing anywhere in the output.
///
/// Stored as a 256-bit map. The default profile forbids only the null byte,
/// which is what most string-handling delivery channels terminate on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BadByteSet {
    bits: [u64; 4],
}

impl Default for BadByteSet {
    fn default() -> Self {
        let mut set = BadByteSet { bits: [0; 4] };
        set.insert(0x00);
        set
    }
}

impl BadByteSet {
    /// An empty set (forbids nothing). Mostly useful in tests.
    pub fn empty() -> Self {
        BadByteSet { bits: [0; 4] }
    }

    /// Build a set from explicit byte values.
    pub fn from_bytes(values: &[u8]) -> Self {
        let mut set = BadByteSet::empty();
        for &v in values {
            set.insert(v);
        }
        set
    }

    /// Parse the comma-separated hex syntax used on the command line,
    /// e.g. `"00,0a,0d"`. An empty string yields the default profile.
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        if spec.trim().is_empty() {
            return Ok(BadByteSet::default());
        }

        let mut set = BadByteSet::empty();
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let value = u8::from_str_radix(token, 16)
                .map_err(|_| EngineError::BadByteSpec(format!("invalid hex byte: {:?}", token)))?;
            set.insert(value);
        }

        if set.is_empty() {
            return Ok(BadByteSet::default());
        }
        if set.len() == 256 {
            return Err(EngineError::BadByteSpec(
                "set forbids every possible byte value".into(),
            ));
        }
        Ok(set)
    }

    /// Add a byte value to the set.
    pub fn insert(&mut self, value: u8) {
        self.bits[(value >> 6) as usize] |= 1u64 << (value & 0x3f);
    }

    /// Membership test.
    pub fn contains(&self, value: u8) -> bool {
        self.bits[(value >> 6) as usize] & (1u64 << (value & 0x3f)) != 0
    }

    /// Number of forbidden values.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if the set forbids nothing.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// True if no byte of `bytes` is forbidden.
    pub fn is_clean(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| !self.contains(b))
    }

    /// First forbidden byte in `bytes`, with its position.
    pub fn first_bad(&self, bytes: &[u8]) -> Option<(usize, u8)> {
        bytes
            .iter()
            .enumerate()
            .find(|(_, &b)| self.contains(b))
            .map(|(i, &b)| (i, b))
    }

    /// True if every byte of the little-endian encoding of `value` is allowed.
    pub fn clean_u32(&self, value: u32) -> bool {
        self.is_clean(&value.to_le_bytes())
    }

    /// Iterate over the forbidden values.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).map(|v| v as u8).filter(move |&v| self.contains(v))
    }
}

impl fmt::Debug for BadByteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.iter().map(|v| format!("{:02x}", v)).collect();
        write!(f, "BadByteSet{{{}}}", values.join(","))
    }
}

/// A register operand: the Capstone name plus the hardware encoding index
/// when the name maps onto a general-purpose register of the architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reg {
    /// Register name as printed by the disassembler (e.g. "eax", "r3", "x0")
    pub name: String,
    /// Hardware encoding number, when known
    pub encoding: Option<u8>,
}

/// A decoded memory operand.
#[derive(Debug, Clone, PartialEq)]
pub struct MemOperand {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: i32,
    pub disp: i64,
    /// True when the effective address is computed relative to the
    /// instruction pointer (RIP-relative on x64, literal loads on ARM).
    pub pc_relative: bool,
}

/// Semantic operand classification produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(MemOperand),
    /// A program-counter-relative branch target, already resolved to an
    /// absolute address within (or beyond) the input buffer.
    Rel(Address),
}

/// One decoded instruction. Read-only view; the mutable byte encoding lives
/// on the owning sequence node.
#[derive(Debug, Clone, PartialEq)]
pub struct Insn {
    /// Original address of the instruction
    pub addr: Address,
    /// Size of the original encoding in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g. "mov", "bne")
    pub mnemonic: String,
    /// Operands as string representation
    pub op_str: String,
    /// Raw bytes of the original encoding (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Classified operands
    pub operands: Vec<Operand>,
}

impl Insn {
    /// Returns the original instruction bytes, up to the actual size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// The relative-branch target, if the decoder classified one.
    pub fn rel_target(&self) -> Option<Address> {
        self.operands.iter().find_map(|op| match op {
            Operand::Rel(target) => Some(*target),
            _ => None,
        })
    }

    /// True if the original encoding contains a forbidden byte.
    pub fn has_bad_byte(&self, bad: &BadByteSet) -> bool {
        !bad.is_clean(self.bytes())
    }

    /// The common `op reg, imm` shape most immediate strategies match on.
    pub fn reg_imm(&self) -> Option<(&Reg, i64)> {
        match self.operands.as_slice() {
            [Operand::Reg(reg), Operand::Imm(imm)] => Some((reg, *imm)),
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.op_str)
    }
}

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed bad-byte set specification
    #[error("Malformed bad-byte set: {0}")]
    BadByteSpec(String),

    /// Undecodable byte sequence at an offset — fatal for the run
    #[error("Undecodable instruction at offset 0x{offset:x}")]
    Decode { offset: Address },

    /// A strategy's generator produced more bytes than it declared
    #[error("Strategy '{strategy}' exceeded its declared size bound")]
    SizeContractViolation { strategy: &'static str },

    /// Instructions left with no clean encoding within the iteration bound
    #[error("No clean encoding found for instructions at offsets {offsets:?}")]
    UnresolvedInstructions { offsets: Vec<Address> },

    /// Capstone error
    #[error("Decoder error: {0}")]
    Capstone(String),

    /// Report serialization error
    #[error("Report error: {0}")]
    Report(String),

    /// I/O error (batch/CLI file handling)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<capstone::Error> for EngineError {
    fn from(e: capstone::Error) -> Self {
        EngineError::Capstone(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_byte_set_default() {
        let set = BadByteSet::default();
        assert!(set.contains(0x00));
        assert!(!set.contains(0x01));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_bad_byte_set_parse() {
        let set = BadByteSet::parse("00,0a,0d").unwrap();
        assert!(set.contains(0x00));
        assert!(set.contains(0x0a));
        assert!(set.contains(0x0d));
        assert!(!set.contains(0x0b));
        assert_eq!(set.len(), 3);

        // Empty spec falls back to the default profile
        let set = BadByteSet::parse("").unwrap();
        assert_eq!(set, BadByteSet::default());

        assert!(BadByteSet::parse("zz").is_err());
        assert!(BadByteSet::parse("100").is_err());
    }

    #[test]
    fn test_bad_byte_set_scan() {
        let set = BadByteSet::from_bytes(&[0x00, 0xff]);
        assert!(set.is_clean(&[0x01, 0x02, 0x03]));
        assert!(!set.is_clean(&[0x01, 0x00, 0x03]));
        assert_eq!(set.first_bad(&[0x01, 0xff, 0x00]), Some((1, 0xff)));
        assert!(set.clean_u32(0x11223344));
        assert!(!set.clean_u32(0x11003344));
    }

    #[test]
    fn test_insn_bytes() {
        let insn = Insn {
            addr: 0x1000,
            size: 3,
            mnemonic: "add".to_string(),
            op_str: "eax, ebx".to_string(),
            bytes: [0x01, 0xd8, 0x90, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            operands: Vec::new(),
        };

        assert_eq!(insn.bytes(), &[0x01, 0xd8, 0x90]);
        assert!(!insn.has_bad_byte(&BadByteSet::default()));
    }

    #[test]
    fn test_insn_rel_target() {
        let insn = Insn {
            addr: 0,
            size: 2,
            mnemonic: "jmp".to_string(),
            op_str: "0x10".to_string(),
            bytes: [0xeb, 0x0e, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            operands: vec![Operand::Rel(0x10)],
        };

        assert_eq!(insn.rel_target(), Some(0x10));
    }

    #[test]
    fn test_architecture_from_str() {
        assert_eq!("x86".parse::<Architecture>().unwrap(), Architecture::X86);
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X64);
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("mips".parse::<Architecture>().is_err());
    }
}
