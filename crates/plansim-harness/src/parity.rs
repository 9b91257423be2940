//! Parity verdict: identical results regardless of worker count.
//!
//! Runs the same configuration twice with different worker counts, then
//! compares final entity state record by record. The parity score is the
//! fraction of matching entities over the union of both runs; anything
//! below 1.0 is a determinism defect.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::support::{harness_config, harness_pipeline};
use plansim_core::{EntityState, Pipeline, RunMode};

/// Mismatches reported verbatim before truncation.
const MAX_REPORTED_DIFFS: usize = 10;

/// One differing entity between the two runs.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDiff {
    /// Entity identifier.
    pub entity_id: String,
    /// Record from the first run, if present.
    pub left: Option<serde_json::Value>,
    /// Record from the second run, if present.
    pub right: Option<serde_json::Value>,
}

/// The machine-readable parity verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ParityVerdict {
    /// Worker count of the first run.
    pub workers_a: usize,
    /// Worker count of the second run.
    pub workers_b: usize,
    /// Final simulated year compared.
    pub year: u16,
    /// Entities in the union of both final states.
    pub entities_compared: usize,
    /// Matching entities over `entities_compared`.
    pub parity_score: f64,
    /// Whether the checkpoint digests were byte-identical.
    pub digests_equal: bool,
    /// First few differing entities, capped.
    pub diffs: Vec<EntityDiff>,
    /// True exactly when the parity score is 1.0.
    pub pass: bool,
}

/// Runs the two-worker-count comparison and renders the verdict.
///
/// # Errors
///
/// Propagates pipeline and checkpoint failures.
pub fn run(workers_a: usize, workers_b: usize, years: u16, entities: usize) -> Result<ParityVerdict> {
    let start_year = 2025;
    let end_year = start_year + years.saturating_sub(1);

    let (state_a, digest_a) = final_state(workers_a, start_year, end_year, entities)?;
    let (state_b, digest_b) = final_state(workers_b, start_year, end_year, entities)?;

    let mut ids: Vec<&String> = state_a.entities.keys().collect();
    for id in state_b.entities.keys() {
        if !state_a.entities.contains_key(id) {
            ids.push(id);
        }
    }

    let mut matching = 0usize;
    let mut diffs = Vec::new();
    for id in &ids {
        let left = state_a.entities.get(*id);
        let right = state_b.entities.get(*id);
        if left == right {
            matching += 1;
        } else if diffs.len() < MAX_REPORTED_DIFFS {
            diffs.push(EntityDiff {
                entity_id: (*id).clone(),
                left: left.map(serde_json::to_value).transpose()?,
                right: right.map(serde_json::to_value).transpose()?,
            });
        }
    }

    let entities_compared = ids.len();
    #[allow(clippy::cast_precision_loss)]
    let parity_score = if entities_compared == 0 {
        1.0
    } else {
        matching as f64 / entities_compared as f64
    };
    let digests_equal = digest_a == digest_b;

    info!(
        workers_a,
        workers_b, entities_compared, parity_score, digests_equal, "parity comparison complete"
    );

    #[allow(clippy::float_cmp)]
    let pass = parity_score == 1.0 && digests_equal;
    Ok(ParityVerdict {
        workers_a,
        workers_b,
        year: end_year,
        entities_compared,
        parity_score,
        digests_equal,
        diffs,
        pass,
    })
}

/// Runs one configuration to completion and loads its final-year state plus
/// the checkpoint digest.
fn final_state(
    workers: usize,
    start_year: u16,
    end_year: u16,
    entities: usize,
) -> Result<(EntityState, String)> {
    let dir = tempfile::TempDir::new()?;
    let config = harness_config(start_year, end_year, workers);
    let pipeline: Pipeline = harness_pipeline(config, dir.path(), entities)?;
    pipeline.run(RunMode::Fresh)?;

    let checkpoint = pipeline
        .checkpoints()
        .load(end_year)
        .with_context(|| format!("loading final checkpoint for {end_year}"))?;
    let state = EntityState::from_canonical_bytes(&checkpoint.payload)
        .context("final checkpoint payload does not parse")?;
    Ok((state, checkpoint.meta.entity_state_digest.as_hex().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_and_eight_workers_agree() {
        let verdict = run(1, 8, 3, 200).unwrap();
        assert!(verdict.pass, "diffs: {:?}", verdict.diffs);
        assert!(verdict.digests_equal);
        assert!((verdict.parity_score - 1.0).abs() < f64::EPSILON);
        assert!(verdict.entities_compared >= 200);
    }
}
