//! Pipeline stage orchestration.
//!
//! One controlling loop drives year-by-year progress: refresh caches,
//! generate events (external collaborator), accumulate state, validate
//! (external collaborator), checkpoint, emit the year result. No year starts
//! before the previous year's checkpoint is committed; only intra-year work
//! is parallel, and that goes through the execution engine so worker count
//! never changes output.
//!
//! A failure in generation, accumulation, or validation aborts the year
//! without writing a checkpoint — the prior checkpoint remains the valid
//! resume point. A checkpoint-write failure is fatal for the run.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accumulate::Accumulator;
use crate::cache::DerivedCache;
use crate::checkpoint::{CheckpointStatus, CheckpointStore};
use crate::config::SimulationConfig;
use crate::engine::{EngineError, ExecutionEngine, ExecutionTask, TaskError};
use crate::error::PipelineError;
use crate::events::{
    DemoEventGenerator, DemoGeneratorConfig, DemoGeneratorMode, EventGenerator, PlanEvent,
};
use crate::fingerprint::{Fingerprint, stable_draw};
use crate::state::{BootstrapSource, EntityCounts, EntityState};
use crate::validate::{Severity, ValidationRules};

/// Entity shards accumulated in parallel within a year. Shard assignment is
/// a stable hash of the entity id, so it is independent of worker count.
const ACCUMULATE_SHARDS: u64 = 8;

/// How a run treats existing checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Resume from the latest valid checkpoint.
    Resume,
    /// Ignore checkpoints and bootstrap at the start year.
    Fresh,
}

/// The fixed per-year stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Refresh and validate derived lookup tables.
    RefreshCaches,
    /// External event generation.
    GenerateEvents,
    /// Temporal state accumulation.
    AccumulateState,
    /// External validation rules.
    Validate,
    /// Checkpoint write and publication.
    Checkpoint,
}

/// Outcome of one stage within a committed year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Which stage.
    pub stage: Stage,
    /// Milliseconds spent in the stage.
    pub duration_ms: u64,
}

/// The immutable record of one committed year. Written once at year close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearResult {
    /// The simulated year.
    pub year: u16,
    /// Per-stage outcomes in execution order.
    pub stage_statuses: Vec<StageOutcome>,
    /// Entity counts at year close.
    pub entity_counts: EntityCounts,
    /// Total milliseconds for the year.
    pub duration_ms: u64,
    /// Digest of the checkpoint closing this year.
    pub checkpoint_ref: String,
    /// Warning-severity validation findings (never blocking).
    pub validation_warnings: usize,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationRun {
    /// Run identifier from the configuration.
    pub run_id: String,
    /// Scenario identifier.
    pub scenario_id: String,
    /// Plan design identifier.
    pub plan_design_id: String,
    /// First year this invocation executed.
    pub first_year: u16,
    /// Last year executed, inclusive.
    pub end_year: u16,
    /// Fingerprint the run was executed under.
    pub config_fingerprint: String,
    /// Seed for stable draws.
    pub random_seed: u64,
    /// Year the run resumed from, when a checkpoint was used.
    pub resumed_from: Option<u16>,
    /// One result per committed year, in year order.
    pub years: Vec<YearResult>,
}

/// The pipeline orchestrator.
pub struct Pipeline {
    config: SimulationConfig,
    config_fingerprint: Fingerprint,
    checkpoints: CheckpointStore,
    cache: DerivedCache,
    engine: ExecutionEngine,
    accumulator: Accumulator,
    generator: Box<dyn EventGenerator>,
    rules: Box<dyn ValidationRules>,
    bootstrap: BootstrapSource,
    cancel: Arc<AtomicBool>,
    run_log: PathBuf,
}

impl Pipeline {
    /// Builds a pipeline with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint store cannot be opened or the
    /// config fingerprint cannot be computed.
    pub fn new(
        config: SimulationConfig,
        data_dir: &Path,
        generator: Box<dyn EventGenerator>,
        rules: Box<dyn ValidationRules>,
        bootstrap: BootstrapSource,
    ) -> Result<Self, PipelineError> {
        let config_fingerprint = config
            .fingerprint()
            .map_err(|e| PipelineError::DataQuality {
                year: config.run.start_year,
                detail: format!("config fingerprint failed: {e}"),
            })?;
        let checkpoints = CheckpointStore::open(data_dir.join("checkpoints"))?;
        let cache = DerivedCache::open(data_dir.join("cache"));
        let engine = ExecutionEngine::new(config.engine.to_engine_config());
        let accumulator = Accumulator::new(config.accumulator.reappearance_policy);

        Ok(Self {
            config,
            config_fingerprint,
            checkpoints,
            cache,
            engine,
            accumulator,
            generator,
            rules,
            bootstrap,
            cancel: Arc::new(AtomicBool::new(false)),
            run_log: data_dir.join("run.log.jsonl"),
        })
    }

    /// Builds a pipeline wired to the demo generator and baseline rules,
    /// bootstrapping from an empty census. The generator salt is the run's
    /// random seed.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn demo(config: SimulationConfig, data_dir: &Path) -> Result<Self, PipelineError> {
        let generator_config = DemoGeneratorConfig {
            salt: config.run.random_seed,
            ..config.generator.clone()
        };
        let generator = Box::new(DemoEventGenerator::new(
            generator_config,
            DemoGeneratorMode::Streamed,
        ));
        let rules = Box::new(crate::validate::BaselineRules);
        Self::new(config, data_dir, generator, rules, BootstrapSource::Empty)
    }

    /// Shared cancellation flag. Raising it halts new dispatch; the last
    /// committed year stays the valid resume point.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The checkpoint store this pipeline writes to.
    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The fingerprint of this pipeline's configuration.
    #[must_use]
    pub const fn config_fingerprint(&self) -> &Fingerprint {
        &self.config_fingerprint
    }

    /// Runs the configured year range under the given mode.
    ///
    /// # Errors
    ///
    /// Propagates stage failures per the per-year failure policy; see the
    /// module docs. Fatal errors name the resume point.
    pub fn run(&self, mode: RunMode) -> Result<SimulationRun, PipelineError> {
        let start_year = self.config.run.start_year;
        let end_year = self.config.run.end_year;

        let (mut prior, first_year, resumed_from) = self.resume_point(mode, start_year)?;

        info!(
            run_id = %self.config.run.run_id,
            first_year,
            end_year,
            resumed_from,
            fingerprint = self.config_fingerprint.short(),
            "pipeline run starting"
        );

        let mut years = Vec::new();
        let mut last_committed = resumed_from;

        for year in first_year..=end_year {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(year, last_committed, "run cancelled before year start");
                return Err(PipelineError::Cancelled { last_committed });
            }
            let (state, result) = self.run_year(year, &prior)?;
            self.append_run_log(&result);
            years.push(result);
            prior = state;
            last_committed = Some(year);
        }

        Ok(SimulationRun {
            run_id: self.config.run.run_id.clone(),
            scenario_id: self.config.run.scenario_id.clone(),
            plan_design_id: self.config.run.plan_design_id.clone(),
            first_year,
            end_year,
            config_fingerprint: self.config_fingerprint.as_hex().to_owned(),
            random_seed: self.config.run.random_seed,
            resumed_from,
            years,
        })
    }

    /// Determines where the run starts and what state seeds it.
    ///
    /// Fresh mode always bootstraps. Resume mode takes the latest valid
    /// checkpoint; with artifacts present but none valid it refuses with
    /// either a config-drift or a no-resumable-state error rather than
    /// silently recomputing from scratch.
    fn resume_point(
        &self,
        mode: RunMode,
        start_year: u16,
    ) -> Result<(EntityState, u16, Option<u16>), PipelineError> {
        if mode == RunMode::Fresh {
            return Ok((self.bootstrap.seed_state(start_year), start_year, None));
        }

        if let Some(checkpoint) = self.checkpoints.latest_valid(&self.config_fingerprint)? {
            let year = checkpoint.meta.year;
            let state =
                EntityState::from_canonical_bytes(&checkpoint.payload).map_err(|e| {
                    PipelineError::Integrity {
                        year,
                        detail: format!("checkpoint payload does not parse as entity state: {e}"),
                    }
                })?;
            return Ok((state, year + 1, Some(year)));
        }

        let statuses = self.checkpoints.validate_all(&self.config_fingerprint)?;
        if statuses.is_empty() {
            // Empty store: a cold start, not an error.
            return Ok((self.bootstrap.seed_state(start_year), start_year, None));
        }
        if let Some((_, CheckpointStatus::FingerprintMismatch { stored })) = statuses
            .iter()
            .find(|(_, s)| matches!(s, CheckpointStatus::FingerprintMismatch { .. }))
        {
            return Err(PipelineError::ConfigDrift {
                stored: stored.clone(),
                current: self.config_fingerprint.as_hex().to_owned(),
            });
        }
        Err(PipelineError::NoResumableState {
            fingerprint: self.config_fingerprint.as_hex().to_owned(),
        })
    }

    /// Executes one year's stage sequence. Returns the year's state and its
    /// result; any error means no checkpoint was written for the year.
    fn run_year(
        &self,
        year: u16,
        prior: &EntityState,
    ) -> Result<(EntityState, YearResult), PipelineError> {
        let year_started = Instant::now();
        let mut stage_statuses = Vec::new();
        let mut timed = |stage: Stage, started: Instant| {
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = started.elapsed().as_millis() as u64;
            stage_statuses.push(StageOutcome { stage, duration_ms });
        };

        let started = Instant::now();
        self.refresh_caches(year);
        timed(Stage::RefreshCaches, started);

        let started = Instant::now();
        let events = self
            .generator
            .generate(year, prior)
            .map_err(|e| PipelineError::EventGeneration {
                year,
                detail: e.detail,
            })?;
        timed(Stage::GenerateEvents, started);

        let started = Instant::now();
        let state = self.accumulate_sharded(year, prior, &events)?;
        timed(Stage::AccumulateState, started);

        let started = Instant::now();
        let findings = self.rules.validate(year, &state, &events);
        let errors: Vec<_> = findings
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        let warnings = findings.len() - errors.len();
        for finding in &findings {
            match finding.severity {
                Severity::Error => {
                    warn!(year, rule = %finding.rule_id, msg = %finding.message, "validation error");
                },
                Severity::Warning => {
                    info!(year, rule = %finding.rule_id, msg = %finding.message, "validation warning");
                },
            }
        }
        if let Some(first) = errors.first() {
            return Err(PipelineError::ValidationFailed {
                year,
                count: errors.len(),
                first: first.message.clone(),
            });
        }
        timed(Stage::Validate, started);

        let started = Instant::now();
        let payload = state
            .to_canonical_bytes()
            .map_err(|e| PipelineError::DataQuality {
                year,
                detail: format!("state serialization failed: {e}"),
            })?;
        let meta = self
            .checkpoints
            .create(year, &self.config_fingerprint, &payload)?;
        timed(Stage::Checkpoint, started);

        let entity_counts = state.counts_since(Some(prior));
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = year_started.elapsed().as_millis() as u64;
        let result = YearResult {
            year,
            stage_statuses,
            entity_counts,
            duration_ms,
            checkpoint_ref: meta.entity_state_digest.as_hex().to_owned(),
            validation_warnings: warnings,
        };

        info!(
            year,
            entities = entity_counts.total,
            active = entity_counts.active,
            duration_ms,
            "year committed"
        );
        Ok((state, result))
    }

    /// Stage 1: refresh derived lookup tables for the year. The cache is
    /// advisory, so this stage cannot fail.
    fn refresh_caches(&self, year: u16) {
        #[derive(Serialize)]
        struct LimitParams<'a> {
            plan_design_id: &'a str,
            year: u16,
        }
        let params = LimitParams {
            plan_design_id: &self.config.run.plan_design_id,
            year,
        };
        let _table: Vec<u64> = self.cache.get_or_compute("contribution_limits", &params, || {
            contribution_limit_table(year)
        });
    }

    /// Stage 3: shard entities by stable hash and accumulate shards through
    /// the execution engine, merging by shard key.
    fn accumulate_sharded(
        &self,
        year: u16,
        prior: &EntityState,
        events: &[PlanEvent],
    ) -> Result<EntityState, PipelineError> {
        let mut shard_priors: Vec<EntityState> = (0..ACCUMULATE_SHARDS)
            .map(|_| EntityState::empty(prior.year))
            .collect();
        for (id, record) in &prior.entities {
            let shard = shard_of(id);
            shard_priors[shard].entities.insert(id.clone(), record.clone());
        }
        let mut shard_events: Vec<Vec<PlanEvent>> =
            (0..ACCUMULATE_SHARDS).map(|_| Vec::new()).collect();
        for event in events {
            shard_events[shard_of(&event.entity_id)].push(event.clone());
        }

        let tasks: Vec<ExecutionTask<(EntityState, Vec<PlanEvent>)>> = shard_priors
            .into_iter()
            .zip(shard_events)
            .enumerate()
            .map(|(i, (shard_prior, shard_events))| ExecutionTask {
                task_id: format!("accumulate-{year}-{i:02}"),
                stage: "accumulate".to_owned(),
                dependencies: Vec::new(),
                deterministic_key: format!("shard-{i:02}"),
                input: (shard_prior, shard_events),
            })
            .collect();

        let accumulator = self.accumulator;
        let merged = self
            .engine
            .execute_with_cancel(
                tasks,
                |task| {
                    let (shard_prior, shard_events) = &task.input;
                    accumulator
                        .accumulate(year, shard_prior, shard_events)
                        .map_err(|e| TaskError::new(e.to_string()))
                },
                &self.cancel,
            )
            .map_err(|e| engine_error_for_year(e, year, &self.checkpoints))?;

        // Merge shard maps; shards partition the key space, so inserts
        // never collide.
        let mut entities = BTreeMap::new();
        for shard_state in merged.outputs.into_values() {
            entities.extend(shard_state.entities);
        }
        Ok(EntityState { year, entities })
    }

    /// Appends a committed year to the append-only run log.
    fn append_run_log(&self, result: &YearResult) {
        let line = match serde_json::to_string(result) {
            Ok(line) => line,
            Err(err) => {
                warn!(year = result.year, error = %err, "year result not serializable for run log");
                return;
            },
        };
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.run_log)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = appended {
            warn!(path = %self.run_log.display(), error = %err, "run log append failed");
        }
    }
}

/// Stable shard assignment for an entity id.
fn shard_of(entity_id: &str) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    let shard = (stable_draw(0, entity_id, 0, "accumulate_shard") % ACCUMULATE_SHARDS) as usize;
    shard
}

/// Classifies engine failures for the year. Accumulator failures inside
/// tasks are data-quality failures; cancellation names the resume point.
fn engine_error_for_year(
    err: EngineError,
    year: u16,
    checkpoints: &CheckpointStore,
) -> PipelineError {
    match err {
        EngineError::TaskFailures { failures } => {
            let detail = failures
                .iter()
                .map(|f| f.detail.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            PipelineError::DataQuality { year, detail }
        },
        EngineError::Cancelled { .. } => PipelineError::Cancelled {
            last_committed: checkpoints.latest_pointer(),
        },
        EngineError::ResourceExhaustion { detail } => PipelineError::ResourceExhaustion(detail),
        other => PipelineError::Engine(other),
    }
}

/// Demo derived table: contribution limits for a year. Deterministic and
/// cheap; stands in for the expensive external tables the cache exists for.
fn contribution_limit_table(year: u16) -> Vec<u64> {
    let base: u64 = 2_300_000 + u64::from(year.saturating_sub(2025)) * 50_000;
    vec![base, base + 750_000, base / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::ReappearancePolicy;
    use crate::config::{AccumulatorSection, EngineSection, RunSection};

    fn config(start: u16, end: u16, workers: usize) -> SimulationConfig {
        SimulationConfig {
            run: RunSection {
                run_id: "run-test".to_owned(),
                scenario_id: "baseline".to_owned(),
                plan_design_id: "design-a".to_owned(),
                start_year: start,
                end_year: end,
                random_seed: 42,
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

    #[test]
    fn fresh_run_commits_every_year() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::demo(config(2025, 2027, 2), dir.path()).unwrap();

        let run = pipeline.run(RunMode::Fresh).unwrap();

        assert_eq!(run.years.len(), 3);
        assert_eq!(run.resumed_from, None);
        for (result, year) in run.years.iter().zip(2025u16..) {
            assert_eq!(result.year, year);
            assert_eq!(result.stage_statuses.len(), 5);
            assert!(!result.checkpoint_ref.is_empty());
        }
        assert_eq!(pipeline.checkpoints().latest_pointer(), Some(2027));
    }

    #[test]
    fn resume_continues_from_latest_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();

        let first = Pipeline::demo(config(2025, 2026, 1), dir.path()).unwrap();
        first.run(RunMode::Fresh).unwrap();

        let second = Pipeline::demo(config(2025, 2028, 1), dir.path()).unwrap();
        let run = second.run(RunMode::Resume).unwrap();

        assert_eq!(run.resumed_from, Some(2026));
        let years: Vec<_> = run.years.iter().map(|y| y.year).collect();
        assert_eq!(years, vec![2027, 2028]);
    }

    #[test]
    fn resume_on_empty_store_is_a_cold_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::demo(config(2025, 2025, 1), dir.path()).unwrap();

        let run = pipeline.run(RunMode::Resume).unwrap();
        assert_eq!(run.resumed_from, None);
        assert_eq!(run.years.len(), 1);
    }

    #[test]
    fn resume_under_changed_config_is_drift() {
        let dir = tempfile::TempDir::new().unwrap();
        Pipeline::demo(config(2025, 2025, 1), dir.path())
            .unwrap()
            .run(RunMode::Fresh)
            .unwrap();

        let mut changed = config(2025, 2026, 1);
        changed.run.random_seed = 43;
        let pipeline = Pipeline::demo(changed, dir.path()).unwrap();

        let err = pipeline.run(RunMode::Resume).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigDrift { .. }));
    }

    #[test]
    fn worker_count_does_not_change_state() {
        let dir_serial = tempfile::TempDir::new().unwrap();
        let dir_parallel = tempfile::TempDir::new().unwrap();

        let serial = Pipeline::demo(config(2025, 2027, 1), dir_serial.path()).unwrap();
        let parallel = Pipeline::demo(config(2025, 2027, 8), dir_parallel.path()).unwrap();
        serial.run(RunMode::Fresh).unwrap();
        parallel.run(RunMode::Fresh).unwrap();

        let a = serial.checkpoints().load(2027).unwrap();
        let b = parallel.checkpoints().load(2027).unwrap();
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.meta.entity_state_digest, b.meta.entity_state_digest);
    }

    #[test]
    fn cancelled_run_reports_last_committed_year() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::demo(config(2025, 2030, 1), dir.path()).unwrap();
        pipeline.cancel_flag().store(true, Ordering::Relaxed);

        let err = pipeline.run(RunMode::Fresh).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { last_committed: None }));
    }

    #[test]
    fn run_log_gets_one_line_per_year() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipeline = Pipeline::demo(config(2025, 2027, 1), dir.path()).unwrap();
        pipeline.run(RunMode::Fresh).unwrap();

        let log = std::fs::read_to_string(dir.path().join("run.log.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 3);
        let first: YearResult = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(first.year, 2025);
    }
}
