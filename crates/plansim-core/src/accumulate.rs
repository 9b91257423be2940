//! Temporal state accumulation.
//!
//! Computes `EntityState(N)` from `EntityState(N-1)` plus `Events(N)` in one
//! pass over entities, never rescanning earlier years. The no-look-ahead rule
//! is structural: the only inputs are the prior state and the current year's
//! events, so a year's state can never depend on anything later.
//!
//! Field resolution follows a strict precedence order over concurrently
//! applicable events: explicit change beats scheduled change beats
//! carry-forward. Ties inside a precedence class are broken by
//! `(effective date, event-kind rank, event id)`; two events that compare
//! equal on class and full tie-break key are a fatal ambiguity, never
//! silently resolved.
//!
//! Lifecycle events apply separately, in causal order within a date (hire,
//! then rehire, then termination), so a same-day hire-and-separate is valid.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::events::{ChangeSource, EventKind, EventPayload, PlanEvent};
use crate::state::{EntityRecord, EntityState, EntityStatus};

/// Policy for an entity re-appearing (rehired) after cessation.
///
/// Deliberately has no `Default`; the run configuration must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReappearancePolicy {
    /// Resume the retained prior state; the rehire payload is ignored.
    ResumePriorState,
    /// Reset to a new baseline taken from the rehire payload.
    ResetToBaseline,
}

/// Errors from state accumulation. All are data-quality failures that abort
/// the current year.
#[derive(Debug, Error)]
pub enum AccumulateError {
    /// Two events with equal precedence and an equal tie-break key target the
    /// same field.
    #[error(
        "ambiguous precedence in year {year} for entity {entity_id}: \
         events {event_a} and {event_b} tie on (source, date, kind, id)"
    )]
    AmbiguousPrecedence {
        /// Year being accumulated.
        year: u16,
        /// Entity whose field could not be resolved.
        entity_id: String,
        /// First tying event.
        event_a: String,
        /// Second tying event.
        event_b: String,
    },

    /// An event's effective date falls outside the year being accumulated.
    #[error("event {event_id} effective {effective_date} is outside year {year}")]
    EventOutsideYear {
        /// Year being accumulated.
        year: u16,
        /// Offending event.
        event_id: String,
        /// Its effective date, rendered.
        effective_date: String,
    },

    /// A change event references an entity with no prior state and no hire
    /// this year.
    #[error("event {event_id} references unknown entity {entity_id} in year {year}")]
    UnknownEntity {
        /// Year being accumulated.
        year: u16,
        /// The missing entity.
        entity_id: String,
        /// Offending event.
        event_id: String,
    },

    /// A lifecycle event is invalid for the entity's current status.
    #[error(
        "invalid lifecycle transition in year {year}: {kind:?} event {event_id} \
         for entity {entity_id} ({detail})"
    )]
    InvalidLifecycle {
        /// Year being accumulated.
        year: u16,
        /// Entity the event applies to.
        entity_id: String,
        /// Offending event.
        event_id: String,
        /// The lifecycle event kind.
        kind: EventKind,
        /// What made the transition invalid.
        detail: String,
    },
}

/// The temporal state accumulator.
#[derive(Debug, Clone, Copy)]
pub struct Accumulator {
    policy: ReappearancePolicy,
}

impl Accumulator {
    /// Builds an accumulator with the configured re-appearance policy.
    #[must_use]
    pub const fn new(policy: ReappearancePolicy) -> Self {
        Self { policy }
    }

    /// Computes the state for `year` from the prior year's state and the
    /// year's event set.
    ///
    /// Entities with no events carry forward unchanged. The prior state must
    /// be for `year - 1`; for a cold start the caller seeds it from the
    /// declared bootstrap source.
    ///
    /// # Errors
    ///
    /// Returns an error on ambiguous precedence, duplicate event ids, events
    /// outside the year, or invalid lifecycle transitions. Any error aborts
    /// the year; no partial state is returned.
    pub fn accumulate(
        &self,
        year: u16,
        prior: &EntityState,
        events: &[PlanEvent],
    ) -> Result<EntityState, AccumulateError> {
        validate_event_set(year, events)?;

        let mut by_entity: BTreeMap<&str, Vec<&PlanEvent>> = BTreeMap::new();
        for event in events {
            by_entity.entry(&event.entity_id).or_default().push(event);
        }

        // Carry-forward fast path: clone prior records untouched; entities
        // with events are overwritten below.
        let mut entities: BTreeMap<String, EntityRecord> = prior.entities.clone();

        let untouched = entities.len().saturating_sub(by_entity.len());
        debug!(year, with_events = by_entity.len(), untouched, "accumulating year");

        for (entity_id, mut entity_events) in by_entity {
            entity_events.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
            let resolved = self.resolve_entity(
                year,
                entity_id,
                prior.entities.get(entity_id),
                &entity_events,
            )?;
            entities.insert(entity_id.to_owned(), resolved);
        }

        Ok(EntityState { year, entities })
    }

    /// Resolves one entity's record for the year from its prior record and
    /// its sorted events.
    fn resolve_entity(
        &self,
        year: u16,
        entity_id: &str,
        prior: Option<&EntityRecord>,
        events: &[&PlanEvent],
    ) -> Result<EntityRecord, AccumulateError> {
        let mut record = self.apply_lifecycle(year, entity_id, prior, events)?;

        if let Some(winner) = select_field_winner(year, entity_id, events, FieldTarget::Compensation)? {
            if let EventPayload::Compensation { amount_cents } = &winner.payload {
                record.compensation_cents = *amount_cents;
            }
        }
        if let Some(winner) = select_field_winner(year, entity_id, events, FieldTarget::Deferral)? {
            if let EventPayload::DeferralRate { bps } = &winner.payload {
                record.deferral_rate_bps = *bps;
            }
        }

        Ok(record)
    }

    /// Applies lifecycle events (hire, rehire, termination) in causal order,
    /// producing the base record that field changes then apply to.
    ///
    /// Within one effective date a hire applies before a rehire applies
    /// before a termination, so a same-day hire-and-separate is a valid
    /// sequence rather than a termination of a not-yet-existing entity.
    fn apply_lifecycle(
        &self,
        year: u16,
        entity_id: &str,
        prior: Option<&EntityRecord>,
        events: &[&PlanEvent],
    ) -> Result<EntityRecord, AccumulateError> {
        let mut record = prior.cloned();

        let mut lifecycle: Vec<&PlanEvent> = events
            .iter()
            .copied()
            .filter(|e| {
                matches!(
                    e.kind(),
                    EventKind::Hire | EventKind::Rehire | EventKind::Termination
                )
            })
            .collect();
        lifecycle.sort_by(|a, b| {
            (a.effective_date, a.kind().lifecycle_order(), &a.event_id)
                .cmp(&(b.effective_date, b.kind().lifecycle_order(), &b.event_id))
        });

        for event in lifecycle {
            match &event.payload {
                EventPayload::Hire {
                    compensation_cents,
                    deferral_rate_bps,
                } => {
                    if record.is_some() {
                        return Err(AccumulateError::InvalidLifecycle {
                            year,
                            entity_id: entity_id.to_owned(),
                            event_id: event.event_id.clone(),
                            kind: EventKind::Hire,
                            detail: "entity already exists; re-appearance needs a rehire event"
                                .to_owned(),
                        });
                    }
                    record = Some(EntityRecord {
                        entity_id: entity_id.to_owned(),
                        status: EntityStatus::Active,
                        compensation_cents: *compensation_cents,
                        deferral_rate_bps: *deferral_rate_bps,
                        baseline_year: year,
                        ceased_year: None,
                    });
                },
                EventPayload::Rehire {
                    compensation_cents,
                    deferral_rate_bps,
                } => {
                    let Some(existing) = record.as_mut() else {
                        return Err(AccumulateError::UnknownEntity {
                            year,
                            entity_id: entity_id.to_owned(),
                            event_id: event.event_id.clone(),
                        });
                    };
                    if existing.status == EntityStatus::Active {
                        return Err(AccumulateError::InvalidLifecycle {
                            year,
                            entity_id: entity_id.to_owned(),
                            event_id: event.event_id.clone(),
                            kind: EventKind::Rehire,
                            detail: "entity is already active".to_owned(),
                        });
                    }
                    existing.status = EntityStatus::Active;
                    existing.ceased_year = None;
                    if self.policy == ReappearancePolicy::ResetToBaseline {
                        existing.compensation_cents = *compensation_cents;
                        existing.deferral_rate_bps = *deferral_rate_bps;
                        existing.baseline_year = year;
                    }
                },
                EventPayload::Termination => {
                    let Some(existing) = record.as_mut() else {
                        return Err(AccumulateError::UnknownEntity {
                            year,
                            entity_id: entity_id.to_owned(),
                            event_id: event.event_id.clone(),
                        });
                    };
                    if existing.status == EntityStatus::Inactive {
                        return Err(AccumulateError::InvalidLifecycle {
                            year,
                            entity_id: entity_id.to_owned(),
                            event_id: event.event_id.clone(),
                            kind: EventKind::Termination,
                            detail: "entity already ceased".to_owned(),
                        });
                    }
                    existing.status = EntityStatus::Inactive;
                    existing.ceased_year = Some(year);
                },
                EventPayload::Compensation { .. } | EventPayload::DeferralRate { .. } => {},
            }
        }

        record.ok_or_else(|| {
            // Only field-change events and no prior record.
            let first = events.first().map_or_else(String::new, |e| e.event_id.clone());
            AccumulateError::UnknownEntity {
                year,
                entity_id: entity_id.to_owned(),
                event_id: first,
            }
        })
    }
}

/// Which resolved field a change event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldTarget {
    Compensation,
    Deferral,
}

fn targets(event: &PlanEvent, field: FieldTarget) -> bool {
    matches!(
        (&event.payload, field),
        (EventPayload::Compensation { .. }, FieldTarget::Compensation)
            | (EventPayload::DeferralRate { .. }, FieldTarget::Deferral)
    )
}

/// Precedence comparison between two events targeting the same field.
///
/// Explicit beats scheduled; within a class the later effective date wins,
/// then the lower event-kind rank, then the lower event id. `Equal` means
/// genuine ambiguity.
fn precedence(a: &PlanEvent, b: &PlanEvent) -> Ordering {
    let class = |e: &PlanEvent| match e.source {
        ChangeSource::Explicit => 1u8,
        ChangeSource::Scheduled => 0u8,
    };
    class(a)
        .cmp(&class(b))
        .then(a.effective_date.cmp(&b.effective_date))
        .then(b.kind().rank().cmp(&a.kind().rank()))
        .then(b.event_id.cmp(&a.event_id))
}

/// Selects the winning change event for a field, or `None` to carry forward.
fn select_field_winner<'e>(
    year: u16,
    entity_id: &str,
    events: &[&'e PlanEvent],
    field: FieldTarget,
) -> Result<Option<&'e PlanEvent>, AccumulateError> {
    let mut winner: Option<&PlanEvent> = None;
    for event in events.iter().filter(|e| targets(e, field)) {
        match winner {
            None => winner = Some(event),
            Some(current) => match precedence(event, current) {
                Ordering::Greater => winner = Some(event),
                Ordering::Less => {},
                Ordering::Equal => {
                    return Err(AccumulateError::AmbiguousPrecedence {
                        year,
                        entity_id: entity_id.to_owned(),
                        event_a: current.event_id.clone(),
                        event_b: event.event_id.clone(),
                    });
                },
            },
        }
    }
    Ok(winner)
}

/// Rejects events dated outside the year being accumulated.
fn validate_event_set(year: u16, events: &[PlanEvent]) -> Result<(), AccumulateError> {
    for event in events {
        if event.effective_date.year != year {
            return Err(AccumulateError::EventOutsideYear {
                year,
                event_id: event.event_id.clone(),
                effective_date: event.effective_date.to_string(),
            });
        }
    }
    Ok(())
}
