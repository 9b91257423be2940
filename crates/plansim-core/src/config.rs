//! Run configuration: TOML parsing, validation, and fingerprinting.
//!
//! The config fingerprint covers every field that can change simulated
//! output — identifiers, year range, seed, accumulator policy, generator
//! parameters. Execution tunables (worker count, time budgets) are excluded
//! on purpose: parallelism changes wall-clock time only, never output bytes,
//! so re-running with a different worker count must still resume from
//! existing checkpoints.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accumulate::ReappearancePolicy;
use crate::engine::EngineConfig;
use crate::events::DemoGeneratorConfig;
use crate::fingerprint::{self, Fingerprint, FingerprintError};

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML is invalid or missing required fields.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed values are inconsistent.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The fingerprint could not be computed.
    #[error("fingerprint failure: {0}")]
    Fingerprint(#[from] FingerprintError),
}

/// Identity and extent of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSection {
    /// Unique run identifier.
    pub run_id: String,
    /// Scenario this run models.
    pub scenario_id: String,
    /// Plan design under simulation.
    pub plan_design_id: String,
    /// First simulated year.
    pub start_year: u16,
    /// Last simulated year, inclusive.
    pub end_year: u16,
    /// Seed mixed into all stable draws.
    pub random_seed: u64,
}

/// Accumulator policy section. Has no default: the re-appearance policy is
/// underspecified upstream and must be an explicit choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorSection {
    /// What happens when an entity re-appears after cessation.
    pub reappearance_policy: ReappearancePolicy,
}

/// Execution tunables. Not part of the config fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Upper bound on concurrent workers.
    pub max_workers: usize,
    /// Per-task wall-clock budget in seconds.
    pub task_time_budget_secs: u64,
    /// Minimum available memory in KiB before the pool narrows.
    pub min_available_memory_kib: Option<u64>,
    /// Milliseconds between mid-run memory headroom samples.
    pub pressure_check_interval_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_time_budget_secs: 60,
            min_available_memory_kib: None,
            pressure_check_interval_ms: 250,
        }
    }
}

impl EngineSection {
    /// Converts into the engine's own config type.
    #[must_use]
    pub const fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_workers: self.max_workers,
            task_time_budget: Duration::from_secs(self.task_time_budget_secs),
            min_available_memory_kib: self.min_available_memory_kib,
            pressure_check_interval: Duration::from_millis(self.pressure_check_interval_ms),
        }
    }
}

/// The complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Run identity and extent.
    pub run: RunSection,
    /// Accumulator policy.
    pub accumulator: AccumulatorSection,
    /// Execution tunables.
    #[serde(default)]
    pub engine: EngineSection,
    /// Demo event-generator parameters.
    #[serde(default)]
    pub generator: DemoGeneratorConfig,
}

/// The fingerprint-relevant subset, serialized canonically.
///
/// `run_id` is an invocation label and `end_year` is the horizon, not a
/// simulation parameter: extending the horizon or relabeling a run must
/// still resume from existing checkpoints. `start_year` stays in because it
/// anchors bootstrap baselines.
#[derive(Serialize)]
struct FingerprintView<'a> {
    scenario_id: &'a str,
    plan_design_id: &'a str,
    start_year: u16,
    random_seed: u64,
    accumulator: &'a AccumulatorSection,
    generator: &'a DemoGeneratorConfig,
}

impl SimulationConfig {
    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error naming the first inconsistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.start_year > self.run.end_year {
            return Err(ConfigError::Validation(format!(
                "start_year {} is after end_year {}",
                self.run.start_year, self.run.end_year
            )));
        }
        if self.engine.max_workers == 0 {
            return Err(ConfigError::Validation(
                "engine.max_workers must be at least 1".to_owned(),
            ));
        }
        for (name, rate) in [
            ("termination_rate", self.generator.termination_rate),
            ("hire_rate", self.generator.hire_rate),
            ("explicit_change_rate", self.generator.explicit_change_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Validation(format!(
                    "generator.{name} {rate} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Fingerprint over the output-affecting subset of the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn fingerprint(&self) -> Result<Fingerprint, ConfigError> {
        Ok(fingerprint::config_fingerprint(&FingerprintView {
            scenario_id: &self.run.scenario_id,
            plan_design_id: &self.run.plan_design_id,
            start_year: self.run.start_year,
            random_seed: self.run.random_seed,
            accumulator: &self.accumulator,
            generator: &self.generator,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[run]
run_id = "run-001"
scenario_id = "baseline"
plan_design_id = "design-a"
start_year = 2025
end_year = 2027
random_seed = 42

[accumulator]
reappearance_policy = "resume_prior_state"
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = SimulationConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.run.start_year, 2025);
        assert_eq!(config.engine.max_workers, 4);
        assert_eq!(
            config.accumulator.reappearance_policy,
            ReappearancePolicy::ResumePriorState
        );
    }

    #[test]
    fn missing_reappearance_policy_is_rejected() {
        let without = MINIMAL.replace(
            "reappearance_policy = \"resume_prior_state\"",
            "",
        );
        assert!(SimulationConfig::from_toml(&without).is_err());
    }

    #[test]
    fn inverted_year_range_is_rejected() {
        let bad = MINIMAL.replace("end_year = 2027", "end_year = 2020");
        let err = SimulationConfig::from_toml(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = SimulationConfig::from_toml(MINIMAL).unwrap();
        let b = SimulationConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn seed_change_changes_fingerprint() {
        let a = SimulationConfig::from_toml(MINIMAL).unwrap();
        let changed = MINIMAL.replace("random_seed = 42", "random_seed = 43");
        let b = SimulationConfig::from_toml(&changed).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn worker_count_does_not_feed_fingerprint() {
        let a = SimulationConfig::from_toml(MINIMAL).unwrap();
        let with_engine = format!("{MINIMAL}\n[engine]\nmax_workers = 16\n");
        let b = SimulationConfig::from_toml(&with_engine).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn extending_the_horizon_keeps_the_fingerprint() {
        let a = SimulationConfig::from_toml(MINIMAL).unwrap();
        let extended = MINIMAL.replace("end_year = 2027", "end_year = 2032");
        let b = SimulationConfig::from_toml(&extended).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
