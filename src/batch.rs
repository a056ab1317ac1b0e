//! Parallel batch processing of independent payloads.
//!
//! The engine itself is single-threaded per run; parallelism lives here,
//! across payloads. One shared `Engine` serves every worker — strategies
//! are immutable, and all per-run state is scoped inside `Engine::run`.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, Transformed};
use crate::{Architecture, BadByteSet, EngineError};

/// Aggregate statistics over one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub input_bytes: usize,
    pub output_bytes: usize,
    /// Accepted-rewrite counts per strategy name, sorted by name
    pub strategy_uses: BTreeMap<String, usize>,
}

impl BatchStats {
    fn absorb(&mut self, input_len: usize, result: &Result<Transformed, EngineError>) {
        self.total += 1;
        self.input_bytes += input_len;
        match result {
            Ok(t) => {
                self.succeeded += 1;
                self.output_bytes += t.bytes.len();
                for r in &t.report.rewrites {
                    *self.strategy_uses.entry(r.strategy.clone()).or_insert(0) += 1;
                }
            }
            Err(_) => self.failed += 1,
        }
    }
}

/// Transform every payload, in parallel, with one engine configuration.
/// Per-payload outcomes keep their input order; failures don't abort the
/// rest of the batch.
pub fn process_batch(
    payloads: &[Vec<u8>],
    arch: Architecture,
    bad: &BadByteSet,
    iteration_bound: Option<usize>,
) -> Result<(Vec<Result<Transformed, EngineError>>, BatchStats), EngineError> {
    let mut engine = Engine::new(arch, *bad)?;
    if let Some(bound) = iteration_bound {
        engine = engine.with_iteration_bound(bound);
    }

    let results: Vec<Result<Transformed, EngineError>> = payloads
        .par_iter()
        .map(|payload| engine.run(payload))
        .collect();

    let mut stats = BatchStats::default();
    for (payload, result) in payloads.iter().zip(&results) {
        stats.absorb(payload.len(), result);
    }

    log::debug!(
        "batch complete: {}/{} payloads clean",
        stats.succeeded,
        stats.total
    );
    Ok((results, stats))
}
