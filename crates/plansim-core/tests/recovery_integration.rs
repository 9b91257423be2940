//! End-to-end recovery and determinism scenarios across full pipeline runs.

use std::path::Path;

use plansim_core::accumulate::ReappearancePolicy;
use plansim_core::config::{AccumulatorSection, EngineSection, RunSection};
use plansim_core::{
    DemoGeneratorConfig, Pipeline, PipelineError, RunMode, SimulationConfig,
};

fn config(start: u16, end: u16, workers: usize) -> SimulationConfig {
    SimulationConfig {
        run: RunSection {
            run_id: "itest".to_owned(),
            scenario_id: "baseline".to_owned(),
            plan_design_id: "design-a".to_owned(),
            start_year: start,
            end_year: end,
            random_seed: 1234,
        },
        accumulator: AccumulatorSection {
            reappearance_policy: ReappearancePolicy::ResumePriorState,
        },
        engine: EngineSection {
            max_workers: workers,
            ..EngineSection::default()
        },
        generator: DemoGeneratorConfig::default(),
    }
}

fn final_digest(data_dir: &Path, year: u16) -> String {
    let pipeline = Pipeline::demo(config(year, year, 1), data_dir).unwrap();
    pipeline
        .checkpoints()
        .load(year)
        .unwrap()
        .meta
        .entity_state_digest
        .as_hex()
        .to_owned()
}

#[test]
fn identical_results_across_worker_counts() {
    let mut digests = Vec::new();
    for workers in [1usize, 2, 8] {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::demo(config(2025, 2029, workers), dir.path()).unwrap();
        let run = pipeline.run(RunMode::Fresh).unwrap();
        assert_eq!(run.years.len(), 5);
        digests.push(final_digest(dir.path(), 2029));
    }
    assert_eq!(digests[0], digests[1]);
    assert_eq!(digests[0], digests[2]);
}

#[test]
fn extending_the_horizon_computes_only_new_years() {
    let dir = tempfile::TempDir::new().unwrap();

    let first = Pipeline::demo(config(2025, 2027, 2), dir.path()).unwrap();
    first.run(RunMode::Fresh).unwrap();

    let extended = Pipeline::demo(config(2025, 2029, 2), dir.path()).unwrap();
    let run = extended.run(RunMode::Resume).unwrap();

    assert_eq!(run.resumed_from, Some(2027));
    let years: Vec<_> = run.years.iter().map(|y| y.year).collect();
    assert_eq!(years, vec![2028, 2029]);

    // The incremental final state must match a from-scratch run.
    let scratch_dir = tempfile::TempDir::new().unwrap();
    let scratch = Pipeline::demo(config(2025, 2029, 2), scratch_dir.path()).unwrap();
    scratch.run(RunMode::Fresh).unwrap();
    assert_eq!(
        final_digest(dir.path(), 2029),
        final_digest(scratch_dir.path(), 2029)
    );
}

#[test]
fn corrupt_newest_checkpoint_falls_back_one_year() {
    let dir = tempfile::TempDir::new().unwrap();

    let first = Pipeline::demo(config(2025, 2027, 2), dir.path()).unwrap();
    first.run(RunMode::Fresh).unwrap();
    let original_2027 = final_digest(dir.path(), 2027);

    // Truncate the newest artifact mid-file.
    let artifact = dir.path().join("checkpoints").join("year-2027.ckpt");
    let bytes = std::fs::read(&artifact).unwrap();
    std::fs::write(&artifact, &bytes[..bytes.len() / 2]).unwrap();

    let resumed = Pipeline::demo(config(2025, 2028, 2), dir.path()).unwrap();
    let run = resumed.run(RunMode::Resume).unwrap();

    // Recovery skipped the corrupt 2027 artifact and replayed from 2026.
    assert_eq!(run.resumed_from, Some(2026));
    let years: Vec<_> = run.years.iter().map(|y| y.year).collect();
    assert_eq!(years, vec![2027, 2028]);

    // The recomputed 2027 is identical to the one that was lost.
    assert_eq!(final_digest(dir.path(), 2027), original_2027);
}

#[test]
fn all_checkpoints_corrupt_is_an_explicit_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let first = Pipeline::demo(config(2025, 2026, 1), dir.path()).unwrap();
    first.run(RunMode::Fresh).unwrap();

    for year in [2025u16, 2026] {
        let artifact = dir.path().join("checkpoints").join(format!("year-{year}.ckpt"));
        std::fs::write(&artifact, b"not a checkpoint").unwrap();
    }

    let resumed = Pipeline::demo(config(2025, 2027, 1), dir.path()).unwrap();
    let err = resumed.run(RunMode::Resume).unwrap_err();
    assert!(matches!(err, PipelineError::NoResumableState { .. }));
}

#[test]
fn force_restart_ignores_existing_checkpoints() {
    let dir = tempfile::TempDir::new().unwrap();
    let first = Pipeline::demo(config(2025, 2026, 1), dir.path()).unwrap();
    first.run(RunMode::Fresh).unwrap();

    let again = Pipeline::demo(config(2025, 2026, 1), dir.path()).unwrap();
    let run = again.run(RunMode::Fresh).unwrap();

    assert_eq!(run.resumed_from, None);
    assert_eq!(run.years.len(), 2);
    // Deterministic recompute overwrote the artifacts with equal content.
    assert_eq!(run.years[1].checkpoint_ref, final_digest(dir.path(), 2026));
}

#[test]
fn cleanup_retention_preserves_the_resume_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::demo(config(2025, 2030, 2), dir.path()).unwrap();
    pipeline.run(RunMode::Fresh).unwrap();

    let deleted = pipeline.checkpoints().cleanup(2).unwrap();
    assert_eq!(deleted, 4);
    let remaining: Vec<_> = pipeline
        .checkpoints()
        .list()
        .unwrap()
        .into_iter()
        .map(|s| s.year)
        .collect();
    assert_eq!(remaining, vec![2030, 2029]);

    // Resume still works off the retained artifacts.
    let extended = Pipeline::demo(config(2025, 2031, 2), dir.path()).unwrap();
    let run = extended.run(RunMode::Resume).unwrap();
    assert_eq!(run.resumed_from, Some(2030));
}
