//! Entity state: the authoritative per-year snapshot of every plan entity.
//!
//! A year's state is materialized once by the accumulator and never mutated
//! afterwards; corrections arrive as new events in a later year. Entities are
//! kept in a `BTreeMap` so serialization order, digests, and iteration are
//! all deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint::{self, Fingerprint};

/// Active/inactive flag. Ceased entities stay in the map, flagged inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Participating in the current year.
    Active,
    /// Ceased in some year at or before the current one; state retained.
    Inactive,
}

/// One entity's resolved fields for a year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable entity identifier.
    pub entity_id: String,
    /// Active or ceased.
    pub status: EntityStatus,
    /// Annual compensation in cents.
    pub compensation_cents: u64,
    /// Deferral rate in basis points.
    pub deferral_rate_bps: u32,
    /// Year this entity's current baseline was established (hire or, under
    /// the reset policy, rehire).
    pub baseline_year: u16,
    /// Year the entity ceased, if it is inactive.
    pub ceased_year: Option<u16>,
}

/// Aggregate counts recorded in each `YearResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityCounts {
    /// All entities ever seen, active or not.
    pub total: usize,
    /// Entities active this year.
    pub active: usize,
    /// Entities first appearing this year.
    pub new_this_year: usize,
    /// Entities that ceased this year.
    pub ceased_this_year: usize,
}

/// The complete entity state for one simulated year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// The year this state is authoritative for.
    pub year: u16,
    /// Every entity keyed by id, in deterministic order.
    pub entities: BTreeMap<String, EntityRecord>,
}

impl EntityState {
    /// An empty state for `year`, used as the cold-start seed when the
    /// bootstrap source carries no entities.
    #[must_use]
    pub fn empty(year: u16) -> Self {
        Self {
            year,
            entities: BTreeMap::new(),
        }
    }

    /// Builds a state from records, keyed by their entity ids.
    #[must_use]
    pub fn from_records(year: u16, records: Vec<EntityRecord>) -> Self {
        let entities = records
            .into_iter()
            .map(|r| (r.entity_id.clone(), r))
            .collect();
        Self { year, entities }
    }

    /// Serializes this state to its canonical byte form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a state from its canonical byte form.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid serialized state.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Digest over the canonical byte form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn digest(&self) -> Result<Fingerprint, serde_json::Error> {
        Ok(fingerprint::state_digest(&self.to_canonical_bytes()?))
    }

    /// Counts for this year, comparing against the prior year's state to
    /// attribute new and ceased entities.
    #[must_use]
    pub fn counts_since(&self, prior: Option<&Self>) -> EntityCounts {
        let active = self
            .entities
            .values()
            .filter(|r| r.status == EntityStatus::Active)
            .count();
        let new_this_year = self
            .entities
            .keys()
            .filter(|id| prior.map_or(true, |p| !p.entities.contains_key(*id)))
            .count();
        let ceased_this_year = self
            .entities
            .values()
            .filter(|r| r.ceased_year == Some(self.year))
            .count();
        EntityCounts {
            total: self.entities.len(),
            active,
            new_this_year,
            ceased_this_year,
        }
    }
}

/// The declared cold-start source for a run's first year.
///
/// A first year seeds from exactly one of these; later years seed from the
/// prior year's checkpoint, never from a bootstrap source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum BootstrapSource {
    /// Start with no entities; the first year's events hire everyone.
    Empty,
    /// Start from an explicit census of baseline records.
    Census {
        /// Baseline records, applied as-is for `start_year - 1`.
        records: Vec<EntityRecord>,
    },
}

impl BootstrapSource {
    /// Materializes the seed state for the year before `start_year`.
    #[must_use]
    pub fn seed_state(&self, start_year: u16) -> EntityState {
        let prior_year = start_year.saturating_sub(1);
        match self {
            Self::Empty => EntityState::empty(prior_year),
            Self::Census { records } => EntityState::from_records(prior_year, records.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: EntityStatus) -> EntityRecord {
        EntityRecord {
            entity_id: id.to_owned(),
            status,
            compensation_cents: 6_000_000,
            deferral_rate_bps: 600,
            baseline_year: 2024,
            ceased_year: None,
        }
    }

    #[test]
    fn canonical_bytes_round_trip() {
        let state = EntityState::from_records(
            2025,
            vec![record("emp-0002", EntityStatus::Active), record("emp-0001", EntityStatus::Active)],
        );

        let bytes = state.to_canonical_bytes().unwrap();
        let parsed = EntityState::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn digest_is_insertion_order_independent() {
        let a = EntityState::from_records(
            2025,
            vec![record("emp-0001", EntityStatus::Active), record("emp-0002", EntityStatus::Active)],
        );
        let b = EntityState::from_records(
            2025,
            vec![record("emp-0002", EntityStatus::Active), record("emp-0001", EntityStatus::Active)],
        );
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn counts_attribute_new_and_ceased() {
        let prior = EntityState::from_records(2024, vec![record("emp-0001", EntityStatus::Active)]);

        let mut ceased = record("emp-0001", EntityStatus::Inactive);
        ceased.ceased_year = Some(2025);
        let current =
            EntityState::from_records(2025, vec![ceased, record("emp-0002", EntityStatus::Active)]);

        let counts = current.counts_since(Some(&prior));
        assert_eq!(counts.total, 2);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.new_this_year, 1);
        assert_eq!(counts.ceased_this_year, 1);
    }

    #[test]
    fn bootstrap_census_seeds_prior_year() {
        let source = BootstrapSource::Census {
            records: vec![record("emp-0001", EntityStatus::Active)],
        };
        let seed = source.seed_state(2025);
        assert_eq!(seed.year, 2024);
        assert_eq!(seed.entities.len(), 1);
    }
}
