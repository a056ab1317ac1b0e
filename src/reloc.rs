//! Relocation: address recomputation and displacement re-encoding.
//!
//! Runs after any pass that may have changed encoding lengths. Displacement
//! fields are re-encoded from each node's *current* bytes, so a branch whose
//! form was changed by a strategy (short ↔ near) is patched in its new form.
//! A displacement that no longer fits its field, or whose re-encoded bytes
//! pick up a forbidden value, flags the node for another selection round.

use crate::model::Sequence;
use crate::strategy::arm_imm::{branch_word_offset, set_branch_word_offset, word_of};
use crate::{Address, Architecture, BadByteSet, EngineError};

enum Patch {
    /// Re-encoded bytes (possibly identical to the current ones)
    Done(Vec<u8>),
    /// The displacement cannot be represented in this branch form
    Unfit,
    /// Not a branch form this pass knows how to patch
    Skip,
}

/// Recompute addresses and patch every relative operand. Returns whether
/// anything changed (bytes patched or nodes newly flagged).
pub fn apply(
    seq: &mut Sequence,
    arch: Architecture,
    bad: &BadByteSet,
) -> Result<bool, EngineError> {
    seq.relayout();

    let mut changed = false;
    for idx in 0..seq.len() {
        let Some(target_orig) = seq.node(idx).insn.rel_target() else {
            continue;
        };

        let new_target = if let Some(tidx) = seq.index_of_orig(target_orig) {
            seq.node(tidx).addr
        } else if target_orig == seq.orig_end() {
            seq.current_end()
        } else if target_orig < seq.base() || target_orig > seq.orig_end() {
            log::debug!(
                "branch at 0x{:x} targets 0x{:x} outside the sequence; left as decoded",
                seq.node(idx).orig_addr(),
                target_orig
            );
            continue;
        } else {
            log::warn!(
                "branch at 0x{:x} targets mid-instruction address 0x{:x}; left as decoded",
                seq.node(idx).orig_addr(),
                target_orig
            );
            continue;
        };

        let node = seq.node_mut(idx);
        let disp = new_target as i64 - (node.addr as i64 + node.len() as i64);

        let outcome = match arch {
            Architecture::X86 | Architecture::X64 => patch_x86(&node.bytes, disp),
            Architecture::Arm => patch_arm(&node.bytes, node.addr, new_target),
            Architecture::Arm64 => patch_arm64(&node.bytes, node.addr, new_target),
        };

        match outcome {
            Patch::Done(bytes) => {
                if bytes != node.bytes {
                    let clean = bad.is_clean(&bytes);
                    node.bytes = bytes;
                    changed = true;
                    if !clean {
                        log::debug!(
                            "relocated branch at 0x{:x} picked up a bad byte; re-flagging",
                            node.orig_addr()
                        );
                        node.unresolved = true;
                    }
                }
            }
            Patch::Unfit => {
                log::debug!(
                    "displacement {} at 0x{:x} does not fit its field; re-flagging",
                    disp,
                    node.orig_addr()
                );
                if !node.unresolved {
                    node.unresolved = true;
                    changed = true;
                }
            }
            Patch::Skip => {}
        }
    }

    Ok(changed)
}

/// x86 branch forms by leading opcode: short JMP/Jcc/LOOP-family rel8,
/// near JMP/CALL rel32, near Jcc rel32.
fn patch_x86(bytes: &[u8], disp: i64) -> Patch {
    let op = match bytes.first() {
        Some(&op) => op,
        None => return Patch::Skip,
    };

    let short = op == 0xeb || (0x70..=0x7f).contains(&op) || (0xe0..=0xe3).contains(&op);
    let near = op == 0xe8 || op == 0xe9;
    let near_cc = op == 0x0f && matches!(bytes.get(1), Some(b) if (0x80..=0x8f).contains(b));

    let (at, wide) = if short && bytes.len() == 2 {
        (1, false)
    } else if near && bytes.len() == 5 {
        (1, true)
    } else if near_cc && bytes.len() == 6 {
        (2, true)
    } else {
        return Patch::Skip;
    };

    let mut out = bytes.to_vec();
    if wide {
        match i32::try_from(disp) {
            Ok(d) => out[at..at + 4].copy_from_slice(&d.to_le_bytes()),
            Err(_) => return Patch::Unfit,
        }
    } else {
        match i8::try_from(disp) {
            Ok(d) => out[at] = d as u8,
            Err(_) => return Patch::Unfit,
        }
    }
    Patch::Done(out)
}

/// ARM B/BL: signed 24-bit word offset, PC reads eight bytes ahead.
fn patch_arm(bytes: &[u8], addr: Address, target: Address) -> Patch {
    let Some(word) = word_of(bytes) else {
        return Patch::Skip;
    };
    if bytes.len() != 4 || branch_word_offset(word).is_none() {
        return Patch::Skip;
    }

    let offset = target as i64 - (addr as i64 + 8);
    if offset % 4 != 0 {
        return Patch::Unfit;
    }
    let word_offset = match i32::try_from(offset / 4) {
        Ok(w) => w,
        Err(_) => return Patch::Unfit,
    };
    match set_branch_word_offset(word, word_offset) {
        Some(patched) => Patch::Done(patched.to_le_bytes().to_vec()),
        None => Patch::Unfit,
    }
}

/// AArch64 branch families: B/BL imm26, B.cond and CBZ/CBNZ imm19,
/// TBZ/TBNZ imm14. All PC-relative to the instruction itself.
fn patch_arm64(bytes: &[u8], addr: Address, target: Address) -> Patch {
    let Some(word) = word_of(bytes) else {
        return Patch::Skip;
    };
    if bytes.len() != 4 {
        return Patch::Skip;
    }

    let offset = target as i64 - addr as i64;
    if offset % 4 != 0 {
        return Patch::Unfit;
    }
    let woff = offset / 4;

    let patched = if (word >> 26) & 0x1f == 0b00101 {
        if !(-0x0200_0000..=0x01ff_ffff).contains(&woff) {
            return Patch::Unfit;
        }
        (word & 0xfc00_0000) | (woff as u32 & 0x03ff_ffff)
    } else if word & 0xff00_0010 == 0x5400_0000 || word & 0x7e00_0000 == 0x3400_0000 {
        if !(-0x0004_0000..=0x0003_ffff).contains(&woff) {
            return Patch::Unfit;
        }
        (word & !0x00ff_ffe0) | ((woff as u32 & 0x7_ffff) << 5)
    } else if word & 0x7e00_0000 == 0x3600_0000 {
        if !(-0x2000..=0x1fff).contains(&woff) {
            return Patch::Unfit;
        }
        (word & !0x0007_ffe0) | ((woff as u32 & 0x3fff) << 5)
    } else {
        return Patch::Skip;
    };

    Patch::Done(patched.to_le_bytes().to_vec())
}
