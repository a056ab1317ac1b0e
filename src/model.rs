//! The instruction sequence model: an arena of nodes over the decoded stream.
//!
//! Nodes stay in strictly increasing original-address order for the whole
//! run; only byte lengths and current addresses change. Passes address nodes
//! by index, never by pointer.

use crate::decoder::CapstoneDecoder;
use crate::{Address, BadByteSet, EngineError, Insn};

/// One instruction slot: the decoded read-only view plus the owned, mutable
/// current encoding. The encoding is only ever replaced wholesale by the
/// selection engine or patched in place by the relocation pass.
#[derive(Debug, Clone)]
pub struct InsnNode {
    /// Decoded view of the original instruction
    pub insn: Insn,
    /// Current byte encoding
    pub bytes: Vec<u8>,
    /// Current absolute address after the last relayout
    pub addr: Address,
    /// Set when selection or relocation could not produce a clean encoding
    pub unresolved: bool,
    /// How many candidates were tried on the last selection attempt
    pub candidates_tried: usize,
    /// Name of the strategy whose encoding was accepted, if any
    pub rewritten_by: Option<&'static str>,
}

impl InsnNode {
    fn new(insn: Insn) -> Self {
        let bytes = insn.bytes().to_vec();
        let addr = insn.addr;
        InsnNode {
            insn,
            bytes,
            addr,
            unresolved: false,
            candidates_tried: 0,
            rewritten_by: None,
        }
    }

    /// Original offset of this instruction in the input buffer.
    pub fn orig_addr(&self) -> Address {
        self.insn.addr
    }

    /// Current encoding length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true: every node owns at least one byte of encoding.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True if the current encoding differs in length from the original.
    pub fn length_changed(&self) -> bool {
        self.bytes.len() != self.insn.size as usize
    }

    /// True if this node still needs a rewrite attempt: its current bytes
    /// contain a forbidden value, or relocation flagged it for retry.
    pub fn needs_rewrite(&self, bad: &BadByteSet) -> bool {
        self.unresolved || !bad.is_clean(&self.bytes)
    }
}

/// An ordered, indexable sequence of instruction nodes over one input buffer.
#[derive(Debug)]
pub struct Sequence {
    base: Address,
    orig_len: usize,
    nodes: Vec<InsnNode>,
}

impl Sequence {
    /// Decode `image` and wrap every instruction into an owned node.
    pub fn build(
        image: &[u8],
        decoder: &CapstoneDecoder,
        base: Address,
    ) -> Result<Sequence, EngineError> {
        let insns = decoder.decode_all(image, base)?;
        let nodes = insns.into_iter().map(InsnNode::new).collect();
        Ok(Sequence {
            base,
            orig_len: image.len(),
            nodes,
        })
    }

    /// Base address the sequence was decoded at.
    pub fn base(&self) -> Address {
        self.base
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[InsnNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [InsnNode] {
        &mut self.nodes
    }

    pub fn node(&self, idx: usize) -> &InsnNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut InsnNode {
        &mut self.nodes[idx]
    }

    /// Find the node that started at `orig` in the input buffer. Node order
    /// never changes, so this is a binary search over original addresses.
    pub fn index_of_orig(&self, orig: Address) -> Option<usize> {
        self.nodes
            .binary_search_by_key(&orig, |n| n.insn.addr)
            .ok()
    }

    /// Original end-of-buffer address; branch targets may point here.
    pub fn orig_end(&self) -> Address {
        self.base + self.orig_len as Address
    }

    /// Recompute every node's current address as the running sum of current
    /// lengths from the base. Idempotent while lengths are stable.
    pub fn relayout(&mut self) {
        let mut at = self.base;
        for node in &mut self.nodes {
            node.addr = at;
            at += node.len() as Address;
        }
    }

    /// True if any node's encoding length differs from its original.
    pub fn any_length_changed(&self) -> bool {
        self.nodes.iter().any(|n| n.length_changed())
    }

    /// Sum of current node lengths.
    pub fn total_len(&self) -> usize {
        self.nodes.iter().map(|n| n.len()).sum()
    }

    /// Current end address (base + total length).
    pub fn current_end(&self) -> Address {
        self.base + self.total_len() as Address
    }

    /// Concatenate the current encodings into an output buffer.
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for node in &self.nodes {
            out.extend_from_slice(&node.bytes);
        }
        out
    }

    /// Indices of nodes that still need a rewrite attempt.
    pub fn flagged(&self, bad: &BadByteSet) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.needs_rewrite(bad))
            .map(|(i, _)| i)
            .collect()
    }

    /// Original offsets of nodes that still need a rewrite, for failure
    /// reporting. Sorted by construction.
    pub fn unresolved_offsets(&self, bad: &BadByteSet) -> Vec<Address> {
        self.nodes
            .iter()
            .filter(|n| n.needs_rewrite(bad))
            .map(|n| n.orig_addr())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Architecture;

    fn x86_seq(code: &[u8]) -> Sequence {
        let decoder = CapstoneDecoder::for_architecture(Architecture::X86).unwrap();
        Sequence::build(code, &decoder, 0).unwrap()
    }

    #[test]
    fn test_build_keeps_order_and_lengths() {
        // push ebp; mov ebp, esp; ret
        let seq = x86_seq(&[0x55, 0x89, 0xe5, 0xc3]);

        assert_eq!(seq.len(), 3);
        assert_eq!(seq.node(0).orig_addr(), 0);
        assert_eq!(seq.node(1).orig_addr(), 1);
        assert_eq!(seq.node(2).orig_addr(), 3);
        assert_eq!(seq.total_len(), 4);
        assert_eq!(seq.emit(), vec![0x55, 0x89, 0xe5, 0xc3]);
    }

    #[test]
    fn test_relayout_after_growth() {
        let mut seq = x86_seq(&[0x90, 0x90, 0xc3]);

        // Grow the middle nop to three bytes
        seq.node_mut(1).bytes = vec![0x41, 0x49, 0x90];
        assert!(seq.any_length_changed());

        seq.relayout();
        assert_eq!(seq.node(0).addr, 0);
        assert_eq!(seq.node(1).addr, 1);
        assert_eq!(seq.node(2).addr, 4);
        assert_eq!(seq.total_len(), 5);
        assert_eq!(seq.total_len(), seq.emit().len());

        // Idempotent while lengths are stable
        let addrs: Vec<_> = seq.nodes().iter().map(|n| n.addr).collect();
        seq.relayout();
        let again: Vec<_> = seq.nodes().iter().map(|n| n.addr).collect();
        assert_eq!(addrs, again);
    }

    #[test]
    fn test_flagged_nodes() {
        let bad = BadByteSet::default();
        // mov eax, 0x1000 carries nulls; ret does not
        let seq = x86_seq(&[0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3]);

        assert_eq!(seq.flagged(&bad), vec![0]);
        assert_eq!(seq.unresolved_offsets(&bad), vec![0]);
    }

    #[test]
    fn test_index_of_orig() {
        let seq = x86_seq(&[0x90, 0xb8, 0x01, 0x10, 0x02, 0x10, 0xc3]);
        assert_eq!(seq.index_of_orig(0), Some(0));
        assert_eq!(seq.index_of_orig(1), Some(1));
        assert_eq!(seq.index_of_orig(6), Some(2));
        assert_eq!(seq.index_of_orig(2), None);
        assert_eq!(seq.orig_end(), 7);
    }
}
