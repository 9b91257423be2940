//! Domain-separated hashing for fingerprints, digests, and stable task
//! randomness.
//!
//! Every hash in the system is a BLAKE3-256 over a domain constant plus
//! canonically-serialized input, so two different kinds of value can never
//! collide into the same digest space. Fingerprints are rendered as lowercase
//! hex for storage and logging.
//!
//! Stable randomness for execution tasks is derived here as well: a task that
//! needs a "random" draw hashes (salt, entity id, year, purpose) instead of
//! consulting a shared generator, so the draw is independent of scheduling
//! order.

use serde::Serialize;
use thiserror::Error;

/// Domain separator for configuration fingerprints.
const CONFIG_FINGERPRINT_DOMAIN: &str = "plansim.config_fingerprint.v1";

/// Domain separator for derived-table parameter fingerprints.
const PARAMETER_FINGERPRINT_DOMAIN: &str = "plansim.cache.parameter_fingerprint.v1";

/// Domain separator for entity-state digests stored in checkpoints.
const STATE_DIGEST_DOMAIN: &str = "plansim.checkpoint.state_digest.v1";

/// Domain separator for per-task stable randomness.
const TASK_DRAW_DOMAIN: &str = "plansim.engine.task_draw.v1";

/// Errors from fingerprint computation.
#[derive(Debug, Error)]
pub enum FingerprintError {
    /// The input could not be canonically serialized.
    #[error("fingerprint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A 256-bit fingerprint rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-computed hex digest.
    ///
    /// Used when reading fingerprints back from persisted metadata.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex form of this fingerprint.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes a domain constant plus raw bytes into a hex digest.
fn hash_domain_bytes(domain: &str, bytes: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(bytes);
    Fingerprint(hasher.finalize().to_hex().to_string())
}

/// Fingerprints a serializable value under a domain constant.
///
/// Serialization goes through `serde_json`; callers must use map types with
/// stable iteration order (`BTreeMap`, struct fields) so the serialized form
/// is canonical.
fn fingerprint_value<T: Serialize>(domain: &str, value: &T) -> Result<Fingerprint, FingerprintError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_domain_bytes(domain, &bytes))
}

/// Computes the fingerprint of a simulation configuration.
///
/// # Errors
///
/// Returns an error if the configuration cannot be serialized.
pub fn config_fingerprint<T: Serialize>(config: &T) -> Result<Fingerprint, FingerprintError> {
    fingerprint_value(CONFIG_FINGERPRINT_DOMAIN, config)
}

/// Computes the fingerprint of a derived-table parameter set.
///
/// # Errors
///
/// Returns an error if the parameters cannot be serialized.
pub fn parameter_fingerprint<T: Serialize>(parameters: &T) -> Result<Fingerprint, FingerprintError> {
    fingerprint_value(PARAMETER_FINGERPRINT_DOMAIN, parameters)
}

/// Computes the digest of a serialized entity-state payload.
///
/// The digest covers the uncompressed payload bytes, so it stays valid across
/// changes to the compression level.
#[must_use]
pub fn state_digest(payload: &[u8]) -> Fingerprint {
    hash_domain_bytes(STATE_DIGEST_DOMAIN, payload)
}

/// Derives a stable pseudo-random `u64` from identifying keys.
///
/// The draw depends only on its inputs, so any scheduling of the tasks that
/// request it produces the same value.
#[must_use]
pub fn stable_draw(salt: u64, entity_id: &str, year: u16, purpose: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TASK_DRAW_DOMAIN.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(&salt.to_le_bytes());
    hasher.update(&[0x1f]);
    hasher.update(entity_id.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(&year.to_le_bytes());
    hasher.update(&[0x1f]);
    hasher.update(purpose.as_bytes());
    let bytes = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes.as_bytes()[..8]);
    u64::from_le_bytes(out)
}

/// A stable draw scaled into `[0, 1)`.
#[must_use]
pub fn stable_fraction(salt: u64, entity_id: &str, year: u16, purpose: &str) -> f64 {
    // 53 bits of mantissa keeps the mapping exact.
    let draw = stable_draw(salt, entity_id, year, purpose) >> 11;
    #[allow(clippy::cast_precision_loss)]
    let scaled = draw as f64 / (1u64 << 53) as f64;
    scaled
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn same_input_same_fingerprint() {
        let mut params = BTreeMap::new();
        params.insert("limit_year", 2025);
        params.insert("catch_up_age", 50);

        let a = parameter_fingerprint(&params).unwrap();
        let b = parameter_fingerprint(&params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn changed_input_changes_fingerprint() {
        let mut params = BTreeMap::new();
        params.insert("limit_year", 2025);
        let a = parameter_fingerprint(&params).unwrap();

        params.insert("limit_year", 2026);
        let b = parameter_fingerprint(&params).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn domains_are_separated() {
        let value = vec!["x"];
        let a = config_fingerprint(&value).unwrap();
        let b = parameter_fingerprint(&value).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn stable_draw_is_order_independent() {
        let first = stable_draw(42, "emp-0001", 2025, "termination");
        let _interleaved = stable_draw(42, "emp-0002", 2025, "termination");
        let again = stable_draw(42, "emp-0001", 2025, "termination");
        assert_eq!(first, again);
    }

    #[test]
    fn stable_fraction_in_unit_interval() {
        for i in 0..100 {
            let f = stable_fraction(7, &format!("emp-{i:04}"), 2030, "comp_growth");
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn short_form_is_prefix() {
        let digest = state_digest(b"payload");
        assert_eq!(digest.short(), &digest.as_hex()[..12]);
        assert_eq!(digest.as_hex().len(), 64);
    }
}
