//! Rewrite strategies: the pluggable unit of bad-byte elimination.
//!
//! A strategy bundles an applicability predicate, a size estimator, a byte
//! generator and a static priority, scoped to one architecture or to all of
//! them. Strategies are immutable and shared; anything a generator needs to
//! remember between invocations lives in the run-scoped [`RunContext`].

pub mod arm;
pub mod arm64;
pub mod arm_imm;
pub mod x86;

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::{Architecture, BadByteSet, Insn};

/// Which architectures a strategy is eligible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchFilter {
    /// Eligible everywhere (the applicability predicate still decides)
    Any,
    /// Eligible for exactly one architecture
    Only(Architecture),
}

impl ArchFilter {
    pub fn matches(&self, arch: Architecture) -> bool {
        match self {
            ArchFilter::Any => true,
            ArchFilter::Only(a) => *a == arch,
        }
    }
}

/// Run-scoped mutable state threaded through selection and generation.
///
/// Strategies themselves are shared and read-only; per-run variation (e.g.
/// rotating the key pick between successive rewrites) goes through the
/// counters here so runs stay deterministic and re-entrant.
pub struct RunContext {
    arch: Architecture,
    bad: BadByteSet,
    counters: HashMap<&'static str, u32>,
}

impl RunContext {
    pub fn new(arch: Architecture, bad: BadByteSet) -> Self {
        RunContext {
            arch,
            bad,
            counters: HashMap::new(),
        }
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn bad(&self) -> &BadByteSet {
        &self.bad
    }

    /// Increment and return the previous value of a named counter.
    pub fn bump(&mut self, key: &'static str) -> u32 {
        let slot = self.counters.entry(key).or_insert(0);
        let prev = *slot;
        *slot += 1;
        prev
    }

    /// Smallest allowed byte value, used as a displacement placeholder that
    /// the relocation pass overwrites.
    pub fn filler_byte(&self) -> u8 {
        (1..=0xffu8)
            .find(|&b| !self.bad.contains(b))
            .unwrap_or(0x90)
    }
}

/// A pluggable rewrite rule.
pub trait Strategy: Send + Sync {
    /// Diagnostic name, also the counter key and report label.
    fn name(&self) -> &'static str;

    /// Higher is preferred.
    fn priority(&self) -> i32;

    /// Architecture eligibility.
    fn arch(&self) -> ArchFilter {
        ArchFilter::Any
    }

    /// Whether this strategy can rewrite `insn` at all. Cheap; the engine
    /// still verifies the generated bytes, never this predicate alone.
    fn applies(&self, insn: &Insn, ctx: &RunContext) -> bool;

    /// Declared upper bound on the generated size. Exceeding it is a
    /// contract violation the engine treats as fatal.
    fn max_size(&self, insn: &Insn) -> usize;

    /// Write the replacement encoding into `out`. Writing nothing declines
    /// the instruction (the engine moves on to the next candidate).
    fn generate(&self, insn: &Insn, ctx: &mut RunContext, out: &mut Buffer);
}

/// Optional heuristic scoring collaborator. Re-orders candidates *within*
/// equal declared priority only; absent a scorer, registration order rules.
pub trait Scorer: Send + Sync {
    fn score(&self, insn: &Insn, strategy: &str) -> f64;
}

/// Priority-ordered, per-architecture-queryable strategy collection.
///
/// Registration order is preserved and breaks priority ties: the first
/// strategy registered at a given priority wins. This makes runs
/// reproducible regardless of how the catalog is assembled.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Arc<dyn Strategy>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            entries: Vec::new(),
        }
    }

    /// The built-in catalog for all supported architectures.
    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();
        x86::register_all(&mut registry);
        arm::register_all(&mut registry);
        arm64::register_all(&mut registry);
        registry
    }

    /// Append a strategy. Order of registration is meaningful.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.entries.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strategies applicable to `insn` on `arch`, best first: descending
    /// priority, registration order on ties, optionally re-ordered within
    /// equal priority by the scorer.
    pub fn candidates(
        &self,
        arch: Architecture,
        insn: &Insn,
        ctx: &RunContext,
        scorer: Option<&dyn Scorer>,
    ) -> Vec<Arc<dyn Strategy>> {
        let mut list: Vec<Arc<dyn Strategy>> = self
            .entries
            .iter()
            .filter(|s| s.arch().matches(arch))
            .filter(|s| s.applies(insn, ctx))
            .cloned()
            .collect();

        // Stable: registration order survives inside equal priority.
        list.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        if let Some(scorer) = scorer {
            reorder_within_priority(&mut list, insn, scorer);
        }
        list
    }
}

/// Sort each run of equal-priority candidates by descending score. Stable,
/// so unscored ties still fall back to registration order.
fn reorder_within_priority(list: &mut [Arc<dyn Strategy>], insn: &Insn, scorer: &dyn Scorer) {
    let mut start = 0;
    while start < list.len() {
        let prio = list[start].priority();
        let mut end = start + 1;
        while end < list.len() && list[end].priority() == prio {
            end += 1;
        }
        if end - start > 1 {
            list[start..end].sort_by(|a, b| {
                scorer
                    .score(insn, b.name())
                    .partial_cmp(&scorer.score(insn, a.name()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        priority: i32,
        arch: ArchFilter,
        bytes: Vec<u8>,
    }

    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn arch(&self) -> ArchFilter {
            self.arch
        }
        fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
            insn.mnemonic == "mov"
        }
        fn max_size(&self, _insn: &Insn) -> usize {
            self.bytes.len()
        }
        fn generate(&self, _insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
            out.append(&self.bytes);
        }
    }

    fn mov_insn() -> Insn {
        Insn {
            addr: 0,
            size: 5,
            mnemonic: "mov".to_string(),
            op_str: "eax, 0x1000".to_string(),
            bytes: [0xb8, 0x00, 0x10, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            operands: Vec::new(),
        }
    }

    fn fixed(name: &'static str, priority: i32, arch: ArchFilter) -> Arc<dyn Strategy> {
        Arc::new(Fixed {
            name,
            priority,
            arch,
            bytes: vec![0x90],
        })
    }

    #[test]
    fn test_priority_ordering() {
        let mut registry = Registry::new();
        registry.register(fixed("low", 10, ArchFilter::Any));
        registry.register(fixed("high", 50, ArchFilter::Any));

        let ctx = RunContext::new(Architecture::X86, BadByteSet::default());
        let cands = registry.candidates(Architecture::X86, &mov_insn(), &ctx, None);

        let names: Vec<_> = cands.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[test]
    fn test_equal_priority_registration_order() {
        let mut registry = Registry::new();
        registry.register(fixed("first", 10, ArchFilter::Any));
        registry.register(fixed("second", 10, ArchFilter::Any));

        let ctx = RunContext::new(Architecture::X86, BadByteSet::default());
        let cands = registry.candidates(Architecture::X86, &mov_insn(), &ctx, None);

        let names: Vec<_> = cands.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_arch_filter() {
        let mut registry = Registry::new();
        registry.register(fixed("arm_only", 10, ArchFilter::Only(Architecture::Arm)));
        registry.register(fixed("anywhere", 5, ArchFilter::Any));

        let ctx = RunContext::new(Architecture::X86, BadByteSet::default());
        let cands = registry.candidates(Architecture::X86, &mov_insn(), &ctx, None);

        let names: Vec<_> = cands.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["anywhere"]);
    }

    #[test]
    fn test_scorer_reorders_equal_priority_only() {
        struct PreferSecond;
        impl Scorer for PreferSecond {
            fn score(&self, _insn: &Insn, strategy: &str) -> f64 {
                if strategy == "second" {
                    1.0
                } else {
                    0.0
                }
            }
        }

        let mut registry = Registry::new();
        registry.register(fixed("top", 99, ArchFilter::Any));
        registry.register(fixed("first", 10, ArchFilter::Any));
        registry.register(fixed("second", 10, ArchFilter::Any));

        let ctx = RunContext::new(Architecture::X86, BadByteSet::default());
        let cands = registry.candidates(Architecture::X86, &mov_insn(), &ctx, Some(&PreferSecond));

        let names: Vec<_> = cands.iter().map(|s| s.name()).collect();
        // The scorer flips the tied pair but cannot displace "top"
        assert_eq!(names, vec!["top", "second", "first"]);
    }

    #[test]
    fn test_run_context_counters() {
        let mut ctx = RunContext::new(Architecture::X86, BadByteSet::default());
        assert_eq!(ctx.bump("k"), 0);
        assert_eq!(ctx.bump("k"), 1);
        assert_eq!(ctx.bump("other"), 0);
    }

    #[test]
    fn test_filler_byte_avoids_bad_values() {
        let ctx = RunContext::new(
            Architecture::X86,
            BadByteSet::from_bytes(&[0x00, 0x01, 0x02]),
        );
        assert_eq!(ctx.filler_byte(), 0x03);
    }

    #[test]
    fn test_default_catalog_is_nonempty() {
        let registry = Registry::with_defaults();
        assert!(registry.len() > 10);
    }
}
