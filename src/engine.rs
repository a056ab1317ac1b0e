//! The selection/generation engine and the fixed-point validation loop.

use crate::buffer::Buffer;
use crate::decoder::CapstoneDecoder;
use crate::format::{RewriteRecord, TransformReport};
use crate::model::Sequence;
use crate::strategy::{Registry, RunContext, Scorer, Strategy};
use crate::{Architecture, BadByteSet, EngineError};

/// A successful run: the clean output plus the rewrite ledger.
#[derive(Debug)]
pub struct Transformed {
    pub bytes: Vec<u8>,
    pub report: TransformReport,
}

/// The bad-byte elimination engine for one architecture and profile.
///
/// Owns no per-run state: `run` may be called repeatedly (and from multiple
/// threads) with independent payloads.
pub struct Engine {
    arch: Architecture,
    bad: BadByteSet,
    registry: Registry,
    scorer: Option<Box<dyn Scorer>>,
    iteration_bound: Option<usize>,
}

impl Engine {
    /// Create an engine with the built-in strategy catalog.
    pub fn new(arch: Architecture, bad: BadByteSet) -> Result<Self, EngineError> {
        if bad.len() == 256 {
            return Err(EngineError::BadByteSpec(
                "set forbids every possible byte value".into(),
            ));
        }
        Ok(Engine {
            arch,
            bad,
            registry: Registry::with_defaults(),
            scorer: None,
            iteration_bound: None,
        })
    }

    /// Replace the strategy catalog.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Install the optional heuristic scoring collaborator.
    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Override the fixed-point iteration bound. The default is on the
    /// order of the instruction count.
    pub fn with_iteration_bound(mut self, bound: usize) -> Self {
        self.iteration_bound = Some(bound.max(1));
        self
    }

    /// Transform one payload. Returns the clean output or a structured,
    /// located failure; a partially-transformed buffer is never returned
    /// as success.
    pub fn run(&self, input: &[u8]) -> Result<Transformed, EngineError> {
        let decoder = CapstoneDecoder::for_architecture(self.arch)?;
        let mut seq = Sequence::build(input, &decoder, 0)?;

        if seq.is_empty() {
            return Ok(Transformed {
                bytes: Vec::new(),
                report: self.report_for(&seq, 0, input.len()),
            });
        }

        let bound = self.iteration_bound.unwrap_or_else(|| seq.len().max(4));
        let mut ctx = RunContext::new(self.arch, self.bad);

        for pass in 1..=bound {
            let mut changed = false;

            for idx in 0..seq.len() {
                if !seq.node(idx).needs_rewrite(&self.bad) {
                    continue;
                }
                changed |= self.select_for_node(&mut seq, idx, &mut ctx)?;
            }

            changed |= crate::reloc::apply(&mut seq, self.arch, &self.bad)?;

            if seq.flagged(&self.bad).is_empty() {
                let bytes = seq.emit();
                log::debug!(
                    "clean after {} pass(es): {} -> {} bytes",
                    pass,
                    input.len(),
                    bytes.len()
                );
                return Ok(Transformed {
                    report: self.report_for(&seq, pass, input.len()),
                    bytes,
                });
            }

            if !changed {
                log::debug!("fixed point reached after {} pass(es) with residue", pass);
                break;
            }
        }

        Err(EngineError::UnresolvedInstructions {
            offsets: seq.unresolved_offsets(&self.bad),
        })
    }

    /// Try candidates in priority order until one yields a clean encoding.
    /// Returns whether the node changed.
    fn select_for_node(
        &self,
        seq: &mut Sequence,
        idx: usize,
        ctx: &mut RunContext,
    ) -> Result<bool, EngineError> {
        let insn = seq.node(idx).insn.clone();
        let retry_of = if seq.node(idx).unresolved {
            seq.node(idx).rewritten_by
        } else {
            None
        };

        let candidates = self
            .registry
            .candidates(self.arch, &insn, ctx, self.scorer.as_deref());
        let tried = candidates.len();

        for strategy in &candidates {
            // A relocation retry skips the form that just failed.
            if retry_of == Some(strategy.name()) {
                continue;
            }

            let mut out = Buffer::with_capacity(strategy.max_size(&insn));
            strategy.generate(&insn, ctx, &mut out);

            if out.is_empty() {
                continue;
            }
            if out.len() > strategy.max_size(&insn) {
                return Err(EngineError::SizeContractViolation {
                    strategy: strategy.name(),
                });
            }
            if !self.bad.is_clean(out.bytes()) {
                log::trace!(
                    "0x{:x}: '{}' generated unclean bytes, rejected",
                    insn.addr,
                    strategy.name()
                );
                continue;
            }

            let node = seq.node_mut(idx);
            node.bytes = out.into_bytes();
            node.unresolved = false;
            node.candidates_tried = tried;
            node.rewritten_by = Some(strategy.name());
            log::debug!(
                "0x{:x}: {} rewritten by '{}' ({} candidates)",
                insn.addr,
                insn,
                strategy.name(),
                tried
            );
            return Ok(true);
        }

        let node = seq.node_mut(idx);
        node.candidates_tried = tried;
        node.unresolved = true;
        log::debug!(
            "0x{:x}: no clean encoding among {} candidate(s)",
            insn.addr,
            tried
        );
        Ok(false)
    }

    fn report_for(&self, seq: &Sequence, passes: usize, input_len: usize) -> TransformReport {
        let rewrites = seq
            .nodes()
            .iter()
            .filter_map(|n| {
                n.rewritten_by.map(|strategy| RewriteRecord {
                    offset: n.orig_addr(),
                    mnemonic: n.insn.mnemonic.clone(),
                    strategy: strategy.to_string(),
                    orig_len: n.insn.size as usize,
                    new_len: n.len(),
                })
            })
            .collect();

        TransformReport {
            architecture: self.arch.to_string(),
            input_len,
            output_len: seq.total_len(),
            instructions: seq.len(),
            passes,
            rewrites,
            unresolved: seq.unresolved_offsets(&self.bad),
        }
    }
}

/// The single entry point the front ends consume: rewrite `input` for
/// `arch` so no byte of `bad` remains, within `iteration_bound` passes
/// (default: on the order of the instruction count).
pub fn transform(
    input: &[u8],
    arch: Architecture,
    bad: &BadByteSet,
    iteration_bound: Option<usize>,
) -> Result<Vec<u8>, EngineError> {
    let mut engine = Engine::new(arch, *bad)?;
    if let Some(bound) = iteration_bound {
        engine = engine.with_iteration_bound(bound);
    }
    engine.run(input).map(|t| t.bytes)
}
