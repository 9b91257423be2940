//! Deterministic demo event generator.
//!
//! A reference implementation of the event-generation collaborator, used by
//! the harness, the CLI demo scenario, and parity testing. Every decision it
//! makes derives from a stable hash of `(salt, entity id, year, purpose)`,
//! never from a shared generator, so its output is a pure function of the
//! prior state and its configuration.
//!
//! Two modes produce the same logical events through different internal
//! orderings, giving the parity harness a second implementation to compare
//! against.

use serde::{Deserialize, Serialize};

use crate::fingerprint::stable_fraction;
use crate::state::{EntityState, EntityStatus};

use super::{
    ChangeSource, EffectiveDate, EventGenerationError, EventGenerator, EventPayload, PlanEvent,
    sort_events,
};

/// Tunables for the demo generator. Part of the run configuration, so any
/// change lands in the config fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoGeneratorConfig {
    /// Salt mixed into every stable draw.
    pub salt: u64,
    /// Fraction of active entities terminated each year.
    pub termination_rate: f64,
    /// New hires per year as a fraction of the active population, with a
    /// floor of one hire while the population is empty.
    pub hire_rate: f64,
    /// Scheduled annual raise in basis points of current compensation.
    pub annual_raise_bps: u32,
    /// Fraction of active entities receiving an explicit off-cycle
    /// compensation change.
    pub explicit_change_rate: f64,
    /// Starting compensation for new hires, in cents.
    pub starting_compensation_cents: u64,
    /// Starting deferral rate for new hires, in basis points.
    pub starting_deferral_bps: u32,
}

impl Default for DemoGeneratorConfig {
    fn default() -> Self {
        Self {
            salt: 0,
            termination_rate: 0.08,
            hire_rate: 0.10,
            annual_raise_bps: 300,
            explicit_change_rate: 0.05,
            starting_compensation_cents: 6_000_000,
            starting_deferral_bps: 600,
        }
    }
}

/// Internal iteration strategy. Both modes emit identical event sets; the
/// parity harness compares them to prove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoGeneratorMode {
    /// Single pass over entities, emitting all of an entity's events
    /// together.
    Streamed,
    /// One pass per event kind across all entities.
    Batched,
}

/// The demo event-generation collaborator.
#[derive(Debug, Clone)]
pub struct DemoEventGenerator {
    config: DemoGeneratorConfig,
    mode: DemoGeneratorMode,
}

impl DemoEventGenerator {
    /// Builds a generator in the given mode.
    #[must_use]
    pub const fn new(config: DemoGeneratorConfig, mode: DemoGeneratorMode) -> Self {
        Self { config, mode }
    }

    fn raise_event(&self, year: u16, entity_id: &str, compensation_cents: u64) -> PlanEvent {
        let raised = compensation_cents
            + compensation_cents * u64::from(self.config.annual_raise_bps) / 10_000;
        PlanEvent {
            event_id: format!("evt-{year}-{entity_id}-raise"),
            entity_id: entity_id.to_owned(),
            source: ChangeSource::Scheduled,
            effective_date: EffectiveDate::new(year, 1, 1),
            payload: EventPayload::Compensation {
                amount_cents: raised,
            },
        }
    }

    fn explicit_change_event(&self, year: u16, entity_id: &str, compensation_cents: u64) -> PlanEvent {
        // Off-cycle adjustment between -10% and +30% of current comp,
        // derived from a stable draw so it never depends on call order.
        let f = stable_fraction(self.config.salt, entity_id, year, "explicit_amount");
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let adjusted = (compensation_cents as f64 * (0.9 + 0.4 * f)) as u64;
        PlanEvent {
            event_id: format!("evt-{year}-{entity_id}-adjust"),
            entity_id: entity_id.to_owned(),
            source: ChangeSource::Explicit,
            effective_date: EffectiveDate::new(year, 7, 1),
            payload: EventPayload::Compensation {
                amount_cents: adjusted,
            },
        }
    }

    fn termination_event(&self, year: u16, entity_id: &str) -> PlanEvent {
        PlanEvent {
            event_id: format!("evt-{year}-{entity_id}-term"),
            entity_id: entity_id.to_owned(),
            source: ChangeSource::Explicit,
            effective_date: EffectiveDate::new(year, 9, 30),
            payload: EventPayload::Termination,
        }
    }

    fn hire_event(&self, year: u16, index: usize) -> PlanEvent {
        let entity_id = format!("emp-{year}-{index:05}");
        PlanEvent {
            event_id: format!("evt-{year}-{entity_id}-hire"),
            entity_id,
            source: ChangeSource::Explicit,
            effective_date: EffectiveDate::new(year, 3, 1),
            payload: EventPayload::Hire {
                compensation_cents: self.config.starting_compensation_cents,
                deferral_rate_bps: self.config.starting_deferral_bps,
            },
        }
    }

    fn is_terminated(&self, year: u16, entity_id: &str) -> bool {
        stable_fraction(self.config.salt, entity_id, year, "termination")
            < self.config.termination_rate
    }

    fn gets_explicit_change(&self, year: u16, entity_id: &str) -> bool {
        stable_fraction(self.config.salt, entity_id, year, "explicit_change")
            < self.config.explicit_change_rate
    }

    fn hire_count(&self, active: usize) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let count = (active as f64 * self.config.hire_rate).round() as usize;
        if active == 0 { 1 } else { count }
    }

    fn generate_streamed(&self, year: u16, prior: &EntityState) -> Vec<PlanEvent> {
        let mut events = Vec::new();
        let mut active = 0usize;
        for record in prior.entities.values() {
            if record.status != EntityStatus::Active {
                continue;
            }
            active += 1;
            events.push(self.raise_event(year, &record.entity_id, record.compensation_cents));
            if self.gets_explicit_change(year, &record.entity_id) {
                events.push(self.explicit_change_event(
                    year,
                    &record.entity_id,
                    record.compensation_cents,
                ));
            }
            if self.is_terminated(year, &record.entity_id) {
                events.push(self.termination_event(year, &record.entity_id));
            }
        }
        for index in 0..self.hire_count(active) {
            events.push(self.hire_event(year, index));
        }
        events
    }

    fn generate_batched(&self, year: u16, prior: &EntityState) -> Vec<PlanEvent> {
        let active_ids: Vec<(&str, u64)> = prior
            .entities
            .values()
            .filter(|r| r.status == EntityStatus::Active)
            .map(|r| (r.entity_id.as_str(), r.compensation_cents))
            .collect();

        let mut events = Vec::new();
        for index in 0..self.hire_count(active_ids.len()) {
            events.push(self.hire_event(year, index));
        }
        for &(id, _) in &active_ids {
            if self.is_terminated(year, id) {
                events.push(self.termination_event(year, id));
            }
        }
        for &(id, comp) in &active_ids {
            if self.gets_explicit_change(year, id) {
                events.push(self.explicit_change_event(year, id, comp));
            }
        }
        for &(id, comp) in &active_ids {
            events.push(self.raise_event(year, id, comp));
        }
        events
    }
}

impl EventGenerator for DemoEventGenerator {
    fn generate(
        &self,
        year: u16,
        prior: &EntityState,
    ) -> Result<Vec<PlanEvent>, EventGenerationError> {
        if year <= prior.year {
            return Err(EventGenerationError::new(format!(
                "cannot generate events for year {year} from state of year {}",
                prior.year
            )));
        }
        let mut events = match self.mode {
            DemoGeneratorMode::Streamed => self.generate_streamed(year, prior),
            DemoGeneratorMode::Batched => self.generate_batched(year, prior),
        };
        sort_events(&mut events);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EntityRecord;

    fn population(n: usize) -> EntityState {
        let records = (0..n)
            .map(|i| EntityRecord {
                entity_id: format!("emp-2024-{i:05}"),
                status: EntityStatus::Active,
                compensation_cents: 5_000_000 + i as u64 * 10_000,
                deferral_rate_bps: 600,
                baseline_year: 2024,
                ceased_year: None,
            })
            .collect();
        EntityState::from_records(2024, records)
    }

    #[test]
    fn modes_produce_identical_event_sets() {
        let prior = population(200);
        let config = DemoGeneratorConfig::default();

        let streamed = DemoEventGenerator::new(config.clone(), DemoGeneratorMode::Streamed)
            .generate(2025, &prior)
            .unwrap();
        let batched = DemoEventGenerator::new(config, DemoGeneratorMode::Batched)
            .generate(2025, &prior)
            .unwrap();

        assert_eq!(streamed, batched);
    }

    #[test]
    fn output_is_reproducible() {
        let prior = population(50);
        let generator = DemoEventGenerator::new(
            DemoGeneratorConfig::default(),
            DemoGeneratorMode::Streamed,
        );

        let a = generator.generate(2025, &prior).unwrap();
        let b = generator.generate(2025, &prior).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn salt_changes_output() {
        let prior = population(100);
        let base = DemoEventGenerator::new(
            DemoGeneratorConfig::default(),
            DemoGeneratorMode::Streamed,
        )
        .generate(2025, &prior)
        .unwrap();

        let salted = DemoEventGenerator::new(
            DemoGeneratorConfig {
                salt: 99,
                ..DemoGeneratorConfig::default()
            },
            DemoGeneratorMode::Streamed,
        )
        .generate(2025, &prior)
        .unwrap();

        assert_ne!(base, salted);
    }

    #[test]
    fn empty_population_still_hires() {
        let generator = DemoEventGenerator::new(
            DemoGeneratorConfig::default(),
            DemoGeneratorMode::Streamed,
        );
        let events = generator.generate(2025, &EntityState::empty(2024)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), crate::events::EventKind::Hire);
    }

    #[test]
    fn rejects_generation_for_past_years() {
        let generator = DemoEventGenerator::new(
            DemoGeneratorConfig::default(),
            DemoGeneratorMode::Streamed,
        );
        let prior = population(10);
        assert!(generator.generate(2024, &prior).is_err());
    }
}
