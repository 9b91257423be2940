//! Run-level error taxonomy.
//!
//! Component modules define their own error enums; this module classifies
//! them into the categories the orchestrator and the CLI act on. The
//! classification decides whether a failure aborts the year, aborts the run,
//! or falls back to an older checkpoint.

use thiserror::Error;

use crate::accumulate::AccumulateError;
use crate::checkpoint::CheckpointError;
use crate::engine::EngineError;

/// Errors surfaced by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Retryable I/O failure in the checkpoint or cache store.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Ambiguous or invalid input data. Fatal for the current year and never
    /// silently resolved.
    #[error("data quality failure in year {year}: {detail}")]
    DataQuality {
        /// Simulated year the failure occurred in.
        year: u16,
        /// What was wrong with the data.
        detail: String,
    },

    /// Resume was requested but the run configuration differs from the one
    /// the checkpoints were written under.
    #[error(
        "configuration drift: checkpoints were written under fingerprint {stored}, \
         current configuration is {current}; re-run with --force-restart to discard them"
    )]
    ConfigDrift {
        /// Fingerprint recorded in the persisted checkpoints.
        stored: String,
        /// Fingerprint of the current configuration.
        current: String,
    },

    /// A checkpoint failed digest verification.
    #[error("checkpoint integrity failure for year {year}: {detail}")]
    Integrity {
        /// Year of the failing checkpoint.
        year: u16,
        /// Description of the mismatch.
        detail: String,
    },

    /// The execution engine could not proceed within its resource budget,
    /// even after narrowing concurrency.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Resume was requested but no valid checkpoint exists.
    #[error("no resumable state: no valid checkpoint found for fingerprint {fingerprint}")]
    NoResumableState {
        /// Fingerprint the scan was performed under.
        fingerprint: String,
    },

    /// A validation rule reported `error` severity for the year.
    #[error("validation failed in year {year}: {count} error-severity finding(s), first: {first}")]
    ValidationFailed {
        /// Year that failed validation.
        year: u16,
        /// Number of error-severity findings.
        count: usize,
        /// Message of the first finding.
        first: String,
    },

    /// Failure inside the state accumulator. Aborts the current year.
    #[error("accumulator failure: {0}")]
    Accumulate(#[from] AccumulateError),

    /// Failure inside the checkpoint store. A failed write is fatal for the
    /// run; the prior checkpoint remains the resume point.
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// One or more execution tasks failed.
    #[error("execution engine failure: {0}")]
    Engine(#[from] EngineError),

    /// Failure in the external event-generation collaborator.
    #[error("event generation failed in year {year}: {detail}")]
    EventGeneration {
        /// Year being generated.
        year: u16,
        /// Collaborator-reported detail.
        detail: String,
    },

    /// The run was cancelled. The last committed year remains the resume
    /// point.
    #[error("run cancelled after year {last_committed:?}")]
    Cancelled {
        /// Highest year with a committed checkpoint, if any.
        last_committed: Option<u16>,
    },
}

impl PipelineError {
    /// Whether the failure leaves earlier checkpoints usable as a resume
    /// point.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::ConfigDrift { .. } | Self::NoResumableState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_drift_is_not_resumable() {
        let err = PipelineError::ConfigDrift {
            stored: "aaa".to_owned(),
            current: "bbb".to_owned(),
        };
        assert!(!err.is_resumable());
    }

    #[test]
    fn data_quality_is_resumable_from_prior_year() {
        let err = PipelineError::DataQuality {
            year: 2026,
            detail: "duplicate event id".to_owned(),
        };
        assert!(err.is_resumable());
    }

    #[test]
    fn messages_name_the_failing_year() {
        let err = PipelineError::ValidationFailed {
            year: 2027,
            count: 2,
            first: "negative compensation".to_owned(),
        };
        assert!(err.to_string().contains("2027"));
    }
}
