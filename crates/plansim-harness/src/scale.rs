//! Scale verdict: is runtime linear in problem size?
//!
//! Sweeps the matrix twice: population sizes at a fixed year count, then
//! year counts at a fixed population. Each sweep gets its own least-squares
//! fit of runtime against the varied dimension, and the verdict passes when
//! both fits are strongly linear (R-squared at or above 0.90) with a
//! statistically significant positive slope.

use std::time::Instant;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::info;

use crate::stats::{LinearFit, fit_line};
use crate::support::{harness_config, harness_pipeline, peak_rss_kib};
use plansim_core::RunMode;

/// Minimum R-squared for a pass.
pub const R_SQUARED_THRESHOLD: f64 = 0.90;
/// Maximum slope p-value for a pass.
pub const P_VALUE_THRESHOLD: f64 = 0.05;

/// One timed run of the matrix.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleSample {
    /// Bootstrap population size.
    pub entities: usize,
    /// Years simulated.
    pub years: u16,
    /// Wall-clock duration, milliseconds.
    pub duration_ms: u64,
    /// Process peak RSS after the run, KiB. Cumulative across samples.
    pub peak_rss_kib: Option<u64>,
}

/// The machine-readable scale verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleVerdict {
    /// Worker count used for every sample.
    pub workers: usize,
    /// Entity sweep at a fixed year count, smallest population first.
    pub entity_samples: Vec<ScaleSample>,
    /// Year sweep at a fixed population, shortest horizon first.
    pub year_samples: Vec<ScaleSample>,
    /// Least-squares fit of duration against entity count.
    pub entity_fit: LinearFit,
    /// Least-squares fit of duration against year count.
    pub year_fit: LinearFit,
    /// R-squared threshold applied.
    pub r_squared_threshold: f64,
    /// Slope p-value threshold applied.
    pub p_value_threshold: f64,
    /// Whether both sweeps scale acceptably linearly.
    pub pass: bool,
}

/// Runs both sweeps of the scale matrix and renders the verdict.
///
/// The entity sweep holds the year count at the smallest entry of
/// `year_counts`; the year sweep holds the population at the smallest entry
/// of `entity_counts`.
///
/// # Errors
///
/// Fails on an empty matrix dimension, and propagates pipeline failures and
/// degenerate-matrix fitting errors.
pub fn run(entity_counts: &[usize], year_counts: &[u16], workers: usize) -> Result<ScaleVerdict> {
    let fixed_years = *year_counts
        .first()
        .ok_or_else(|| anyhow!("year matrix is empty"))?;
    let fixed_entities = *entity_counts
        .first()
        .ok_or_else(|| anyhow!("entity matrix is empty"))?;

    let mut entity_samples = Vec::with_capacity(entity_counts.len());
    for &entities in entity_counts {
        entity_samples.push(timed_sample(entities, fixed_years, workers)?);
    }

    let mut year_samples = Vec::with_capacity(year_counts.len());
    for &years in year_counts {
        year_samples.push(timed_sample(fixed_entities, years, workers)?);
    }

    #[allow(clippy::cast_precision_loss)]
    let entity_fit = fit_line(
        &entity_samples
            .iter()
            .map(|s| (s.entities as f64, s.duration_ms as f64))
            .collect::<Vec<_>>(),
    )?;
    #[allow(clippy::cast_precision_loss)]
    let year_fit = fit_line(
        &year_samples
            .iter()
            .map(|s| (f64::from(s.years), s.duration_ms as f64))
            .collect::<Vec<_>>(),
    )?;

    let linear = |fit: &LinearFit| {
        fit.r_squared >= R_SQUARED_THRESHOLD
            && fit.slope_p_value <= P_VALUE_THRESHOLD
            && fit.slope > 0.0
    };
    let pass = linear(&entity_fit) && linear(&year_fit);

    Ok(ScaleVerdict {
        workers,
        entity_samples,
        year_samples,
        entity_fit,
        year_fit,
        r_squared_threshold: R_SQUARED_THRESHOLD,
        p_value_threshold: P_VALUE_THRESHOLD,
        pass,
    })
}

/// Times one fresh run of the pipeline at the given matrix point.
fn timed_sample(entities: usize, years: u16, workers: usize) -> Result<ScaleSample> {
    let start_year = 2025;
    let end_year = start_year + years.saturating_sub(1);
    let dir = tempfile::TempDir::new()?;
    let config = harness_config(start_year, end_year, workers);
    let pipeline = harness_pipeline(config, dir.path(), entities)?;

    let started = Instant::now();
    pipeline.run(RunMode::Fresh)?;
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = started.elapsed().as_millis() as u64;

    info!(entities, years, duration_ms, "scale sample complete");
    Ok(ScaleSample {
        entities,
        years,
        duration_ms,
        peak_rss_kib: peak_rss_kib(),
    })
}
