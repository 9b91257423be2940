//! Plan events and the event-generation collaborator interface.
//!
//! Events are the only way entity state changes between years. Each event
//! names the entity it applies to, the date it takes effect, whether it is an
//! explicit change or a scheduled one, and a typed payload. The accumulator
//! resolves concurrently-applicable events by precedence; the generator is an
//! opaque, replaceable collaborator behind the [`EventGenerator`] trait.
//!
//! Event sets are always ordered by `(effective_date, kind rank, event_id)`
//! before they leave a generator, so downstream consumers never observe
//! generation order.

mod demo;

pub use demo::{DemoGeneratorConfig, DemoGeneratorMode, DemoEventGenerator};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::EntityState;

/// A calendar date, ordered, with no timezone concerns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EffectiveDate {
    /// Four-digit year.
    pub year: u16,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
}

impl EffectiveDate {
    /// Builds a date without range validation; generators own validity.
    #[must_use]
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }
}

impl std::fmt::Display for EffectiveDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// The kinds of event the accumulator understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First appearance of an entity; establishes its baseline.
    Hire,
    /// Re-appearance after cessation.
    Rehire,
    /// Compensation change.
    CompensationChange,
    /// Deferral-rate change.
    DeferralChange,
    /// Terminal event; the entity ceases, its state is retained.
    Termination,
}

impl EventKind {
    /// Rank used as the second component of the deterministic tie-break.
    /// Lower ranks win when precedence class and effective date are equal.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Termination => 0,
            Self::Hire => 1,
            Self::Rehire => 2,
            Self::CompensationChange => 3,
            Self::DeferralChange => 4,
        }
    }

    /// Causal order for applying lifecycle events that share an effective
    /// date: an entity must exist (hire, then rehire) before it can cease.
    /// Distinct from [`rank`](Self::rank), which only breaks precedence ties.
    #[must_use]
    pub const fn lifecycle_order(self) -> u8 {
        match self {
            Self::Hire => 0,
            Self::Rehire => 1,
            Self::Termination => 2,
            Self::CompensationChange | Self::DeferralChange => 3,
        }
    }
}

/// Whether an event was an explicit change or a scheduled one.
///
/// Explicit changes always take precedence over scheduled changes targeting
/// the same field in the same year; absence of either means the field carries
/// forward unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Entered by a person or an upstream correction; strongest precedence.
    Explicit,
    /// Produced by a standing schedule (annual raise, auto-escalation).
    Scheduled,
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Baseline for a newly-appearing entity.
    Hire {
        /// Starting annual compensation in cents.
        compensation_cents: u64,
        /// Starting deferral rate in basis points.
        deferral_rate_bps: u32,
    },
    /// Baseline or resumption values for a re-appearing entity.
    Rehire {
        /// Compensation in cents on rehire.
        compensation_cents: u64,
        /// Deferral rate in basis points on rehire.
        deferral_rate_bps: u32,
    },
    /// New annual compensation.
    Compensation {
        /// Amount in cents. An explicit zero is a real change, distinct from
        /// the absence of any compensation event.
        amount_cents: u64,
    },
    /// New deferral rate.
    DeferralRate {
        /// Rate in basis points.
        bps: u32,
    },
    /// Terminal event; no payload.
    Termination,
}

impl EventPayload {
    /// The event kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Hire { .. } => EventKind::Hire,
            Self::Rehire { .. } => EventKind::Rehire,
            Self::Compensation { .. } => EventKind::CompensationChange,
            Self::DeferralRate { .. } => EventKind::DeferralChange,
            Self::Termination => EventKind::Termination,
        }
    }
}

/// A single plan event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEvent {
    /// Unique, stable event identifier.
    pub event_id: String,
    /// Entity the event applies to.
    pub entity_id: String,
    /// Explicit or scheduled change.
    pub source: ChangeSource,
    /// Date the event takes effect. Must fall in the event's year.
    pub effective_date: EffectiveDate,
    /// Typed payload; also determines the event kind.
    pub payload: EventPayload,
}

impl PlanEvent {
    /// The event kind, derived from the payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The deterministic ordering key: `(effective_date, kind rank, id)`.
    #[must_use]
    pub fn ordering_key(&self) -> (EffectiveDate, u8, &str) {
        (self.effective_date, self.kind().rank(), &self.event_id)
    }
}

/// Sorts an event set into its canonical order.
pub fn sort_events(events: &mut [PlanEvent]) {
    events.sort_by(|a, b| {
        a.ordering_key()
            .cmp(&b.ordering_key())
    });
}

/// Error from an event-generation collaborator.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct EventGenerationError {
    /// Collaborator-reported description.
    pub detail: String,
}

impl EventGenerationError {
    /// Wraps a collaborator-side failure description.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// The event-generation collaborator.
///
/// Generators read only the prior year's state plus their own year-N inputs;
/// they never see the state they are generating events for. Implementations
/// must return events in canonical order (see [`sort_events`]).
pub trait EventGenerator: Send + Sync {
    /// Produces the ordered event set for `year` given the prior year's
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error when the collaborator cannot produce a complete,
    /// valid event set; the orchestrator aborts the year.
    fn generate(
        &self,
        year: u16,
        prior: &EntityState,
    ) -> Result<Vec<PlanEvent>, EventGenerationError>;
}
