//! Core library for the plansim multi-year retirement-plan simulation
//! platform.
//!
//! A run advances strictly year by year. Within a year the pipeline executes
//! a fixed stage sequence, then commits the year with an atomic checkpoint:
//!
//! ```text
//! refresh caches -> generate events -> accumulate -> validate -> checkpoint
//! ```
//!
//! # Key Concepts
//!
//! - **Entity state**: the complete state of every plan participant at the
//!   close of a year, derived as `state(N-1) + events(N)`.
//! - **Checkpoint**: a digest-validated, fingerprint-stamped artifact per
//!   committed year; the only resume points a run recognizes.
//! - **Config fingerprint**: a domain-separated hash over the semantically
//!   meaningful configuration. Engine tunables such as worker count are
//!   excluded, so changing them never invalidates checkpoints.
//!
//! # Determinism
//!
//! Given the same configuration, bootstrap data, and collaborators, a run
//! produces byte-identical entity state regardless of worker count, task
//! scheduling, or resume point. Randomness is derived from hashes of
//! `(seed, entity id, year, purpose)`, never from generator state, and all
//! parallel work merges by deterministic key.

pub mod accumulate;
pub mod atomic;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod pipeline;
pub mod state;
pub mod validate;

pub use accumulate::{AccumulateError, Accumulator, ReappearancePolicy};
pub use cache::DerivedCache;
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointMeta, CheckpointStatus, CheckpointStore,
    CheckpointSummary,
};
pub use config::{ConfigError, SimulationConfig};
pub use engine::{EngineConfig, EngineError, ExecutionEngine, ExecutionTask, TaskError};
pub use error::PipelineError;
pub use events::{
    ChangeSource, DemoEventGenerator, DemoGeneratorConfig, DemoGeneratorMode, EffectiveDate,
    EventGenerationError, EventGenerator, EventKind, EventPayload, PlanEvent,
};
pub use fingerprint::Fingerprint;
pub use pipeline::{Pipeline, RunMode, SimulationRun, YearResult};
pub use state::{
    BootstrapSource, EntityCounts, EntityRecord, EntityState, EntityStatus,
};
pub use validate::{BaselineRules, Diagnostic, NoRules, Severity, ValidationRules};
