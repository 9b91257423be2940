//! Shared run construction for the harness scenarios.

use std::path::Path;

use anyhow::Result;
use plansim_core::accumulate::ReappearancePolicy;
use plansim_core::config::{AccumulatorSection, EngineSection, RunSection};
use plansim_core::state::{BootstrapSource, EntityRecord, EntityStatus};
use plansim_core::{
    DemoEventGenerator, DemoGeneratorConfig, DemoGeneratorMode, NoRules, Pipeline,
    SimulationConfig,
};

/// Builds the fixed-seed configuration every harness run shares.
pub fn harness_config(start_year: u16, end_year: u16, workers: usize) -> SimulationConfig {
    SimulationConfig {
        run: RunSection {
            run_id: "harness".to_owned(),
            scenario_id: "harness-baseline".to_owned(),
            plan_design_id: "design-harness".to_owned(),
            start_year,
            end_year,
            random_seed: 7,
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

/// A synthetic census of `entities` active participants, varied enough that
/// per-entity work is not uniform.
pub fn synthetic_census(entities: usize, start_year: u16) -> BootstrapSource {
    let records = (0..entities)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let spread = (i % 37) as u64;
            EntityRecord {
                entity_id: format!("census-{i:07}"),
                status: EntityStatus::Active,
                compensation_cents: 4_000_000 + spread * 250_000,
                #[allow(clippy::cast_possible_truncation)]
                deferral_rate_bps: 300 + (i % 12) as u32 * 50,
                baseline_year: start_year.saturating_sub(1),
                ceased_year: None,
            }
        })
        .collect();
    BootstrapSource::Census { records }
}

/// Builds a pipeline over a synthetic census with the demo generator and no
/// blocking validation, suitable for timing and parity runs.
///
/// # Errors
///
/// Propagates pipeline construction failures.
pub fn harness_pipeline(
    config: SimulationConfig,
    data_dir: &Path,
    entities: usize,
) -> Result<Pipeline> {
    let start_year = config.run.start_year;
    let generator_config = DemoGeneratorConfig {
        salt: config.run.random_seed,
        ..config.generator.clone()
    };
    let generator = Box::new(DemoEventGenerator::new(
        generator_config,
        DemoGeneratorMode::Streamed,
    ));
    let pipeline = Pipeline::new(
        config,
        data_dir,
        generator,
        Box::new(NoRules),
        synthetic_census(entities, start_year),
    )?;
    Ok(pipeline)
}

/// Peak resident set size of this process in KiB, from `/proc/self/status`.
/// `None` off Linux or if the field is missing.
pub fn peak_rss_kib() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn census_seeds_the_requested_population() {
        let source = synthetic_census(25, 2025);
        let state = source.seed_state(2025);
        assert_eq!(state.year, 2024);
        assert_eq!(state.entities.len(), 25);
        assert!(state.entities.contains_key("census-0000024"));
    }

    #[test]
    fn peak_rss_reads_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(peak_rss_kib().unwrap() > 0);
        }
    }
}
