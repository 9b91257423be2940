//! Validation-rules collaborator interface and the baseline rule set.
//!
//! Rules consume the year's materialized state plus its event set and report
//! diagnostics. Error severity aborts the year before a checkpoint is
//! written; warnings are reported and never block.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::events::PlanEvent;
use crate::state::{EntityState, EntityStatus};

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Aborts the year.
    Error,
    /// Reported, never blocks.
    Warning,
}

/// One finding from a validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable rule identifier.
    pub rule_id: String,
    /// Error or warning.
    pub severity: Severity,
    /// Human-readable finding.
    pub message: String,
}

impl Diagnostic {
    /// Builds an error-severity finding.
    #[must_use]
    pub fn error(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    /// Builds a warning-severity finding.
    #[must_use]
    pub fn warning(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// The validation collaborator. Opaque and replaceable; the pipeline only
/// looks at diagnostic severities.
pub trait ValidationRules: Send + Sync {
    /// Checks the year's state and events, returning all findings.
    fn validate(&self, year: u16, state: &EntityState, events: &[PlanEvent]) -> Vec<Diagnostic>;
}

/// A rule set that reports nothing. Useful for harness runs that measure
/// orchestration cost in isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl ValidationRules for NoRules {
    fn validate(&self, _year: u16, _state: &EntityState, _events: &[PlanEvent]) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Reference rule set exercising the collaborator interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineRules;

impl ValidationRules for BaselineRules {
    fn validate(&self, year: u16, state: &EntityState, events: &[PlanEvent]) -> Vec<Diagnostic> {
        let mut findings = Vec::new();

        // Globally duplicated event ids break audit attribution.
        let mut seen = BTreeSet::new();
        for event in events {
            if !seen.insert(event.event_id.as_str()) {
                findings.push(Diagnostic::error(
                    "events.duplicate_id",
                    format!("event id {} appears more than once in year {year}", event.event_id),
                ));
            }
        }

        for record in state.entities.values() {
            match record.status {
                EntityStatus::Active => {
                    if record.ceased_year.is_some() {
                        findings.push(Diagnostic::error(
                            "state.active_with_cessation",
                            format!(
                                "entity {} is active but carries ceased_year {:?}",
                                record.entity_id, record.ceased_year
                            ),
                        ));
                    }
                    if record.compensation_cents == 0 {
                        findings.push(Diagnostic::warning(
                            "state.zero_compensation",
                            format!("active entity {} has zero compensation", record.entity_id),
                        ));
                    }
                },
                EntityStatus::Inactive => {
                    if record.ceased_year.is_none() {
                        findings.push(Diagnostic::error(
                            "state.inactive_without_cessation",
                            format!("entity {} is inactive with no ceased_year", record.entity_id),
                        ));
                    }
                },
            }
            if record.deferral_rate_bps > 10_000 {
                findings.push(Diagnostic::error(
                    "state.deferral_over_100_percent",
                    format!(
                        "entity {} defers {} bps",
                        record.entity_id, record.deferral_rate_bps
                    ),
                ));
            }
        }

        // Changes applied to entities that stayed inactive all year are
        // legal corrections but worth surfacing.
        for event in events {
            if let Some(record) = state.entities.get(&event.entity_id) {
                if record.status == EntityStatus::Inactive
                    && record.ceased_year.is_some_and(|c| c < year)
                {
                    findings.push(Diagnostic::warning(
                        "events.inactive_entity_change",
                        format!(
                            "event {} targets entity {} ceased in {:?}",
                            event.event_id, event.entity_id, record.ceased_year
                        ),
                    ));
                }
            }
        }

        findings
    }
}

/// Splits findings into (errors, warnings) counts.
#[must_use]
pub fn tally(findings: &[Diagnostic]) -> (usize, usize) {
    let errors = findings.iter().filter(|d| d.severity == Severity::Error).count();
    (errors, findings.len() - errors)
}
