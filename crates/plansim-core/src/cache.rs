//! Parameter-fingerprinted cache for derived lookup tables.
//!
//! Expensive per-parameter-set tables (limit schedules, factor tables) are
//! memoized on disk keyed by `(table name, parameter fingerprint)`. A hit is
//! bit-identical to what the compute function would produce for the same
//! parameters; any parameter change produces a new fingerprint and retires
//! the stale entry.
//!
//! The cache is advisory, never authoritative: every read or write failure
//! degrades to direct recomputation with a warning, and the pipeline result
//! is unaffected.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atomic::write_atomic;
use crate::fingerprint::{self, Fingerprint};

/// A stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedCacheEntry<T> {
    /// Fingerprint of the parameters that produced the payload.
    pub parameter_fingerprint: Fingerprint,
    /// The table this entry belongs to.
    pub table_name: String,
    /// Wall-clock computation time, nanoseconds since the epoch.
    pub computed_at_ns: u64,
    /// The derived table itself.
    pub payload: T,
}

/// Filesystem-backed derived-value cache.
///
/// Entries are written once per logical key via atomic rename, so concurrent
/// readers never observe partial writes and reads take no locks.
pub struct DerivedCache {
    root: PathBuf,
}

impl DerivedCache {
    /// Opens a cache rooted at `root`. The directory is created lazily on
    /// first store.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_dir(&self, table_name: &str) -> PathBuf {
        self.root.join(table_name)
    }

    fn entry_path(&self, table_name: &str, fp: &Fingerprint) -> PathBuf {
        self.table_dir(table_name).join(format!("{}.json", fp.as_hex()))
    }

    /// Returns the cached table for `(table_name, parameters)`, computing and
    /// storing it on a miss.
    ///
    /// Never fails: fingerprinting, read, or write problems are logged and
    /// the table is recomputed directly.
    pub fn get_or_compute<P, T, F>(&self, table_name: &str, parameters: &P, compute_fn: F) -> T
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let fp = match fingerprint::parameter_fingerprint(parameters) {
            Ok(fp) => fp,
            Err(err) => {
                warn!(table_name, error = %err, "parameter fingerprint failed; recomputing");
                return compute_fn();
            },
        };

        if let Some(hit) = self.try_read(table_name, &fp) {
            debug!(table_name, fingerprint = fp.short(), "derived cache hit");
            return hit;
        }

        debug!(table_name, fingerprint = fp.short(), "derived cache miss");
        let payload = compute_fn();
        self.try_store(table_name, &fp, &payload);
        payload
    }

    /// Attempts a read; any failure is a miss.
    fn try_read<T: DeserializeOwned>(&self, table_name: &str, fp: &Fingerprint) -> Option<T> {
        let path = self.entry_path(table_name, fp);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(table_name, path = %path.display(), error = %err, "cache read failed; recomputing");
                return None;
            },
        };
        match serde_json::from_slice::<DerivedCacheEntry<T>>(&bytes) {
            Ok(entry) if &entry.parameter_fingerprint == fp => Some(entry.payload),
            Ok(entry) => {
                warn!(
                    table_name,
                    stored = entry.parameter_fingerprint.short(),
                    expected = fp.short(),
                    "cache entry fingerprint mismatch; recomputing"
                );
                None
            },
            Err(err) => {
                warn!(table_name, path = %path.display(), error = %err, "cache entry unparseable; recomputing");
                None
            },
        }
    }

    /// Stores an entry and retires stale siblings. Failures are warnings.
    fn try_store<T: Serialize>(&self, table_name: &str, fp: &Fingerprint, payload: &T) {
        let entry = DerivedCacheEntry {
            parameter_fingerprint: fp.clone(),
            table_name: table_name.to_owned(),
            computed_at_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            payload,
        };

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(table_name, error = %err, "cache entry serialization failed; not stored");
                return;
            },
        };

        let path = self.entry_path(table_name, fp);
        if let Err(err) = write_atomic(&path, &bytes) {
            warn!(table_name, error = %err, "cache write failed; result still returned");
            return;
        }

        self.retire_stale(table_name, &path);
    }

    /// Removes entries for the table other than the one just written.
    fn retire_stale(&self, table_name: &str, keep: &Path) {
        let dir = self.table_dir(table_name);
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path != keep && path.extension().is_some_and(|e| e == "json") {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(table_name, path = %path.display(), error = %err, "stale cache entry not removed");
                } else {
                    debug!(table_name, path = %path.display(), "stale cache entry retired");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use super::*;

    fn cache() -> (tempfile::TempDir, DerivedCache) {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = DerivedCache::open(dir.path().join("cache"));
        (dir, cache)
    }

    fn params(year: u16) -> BTreeMap<&'static str, u16> {
        let mut m = BTreeMap::new();
        m.insert("limit_year", year);
        m
    }

    #[test]
    fn identical_parameters_compute_once() {
        let (_dir, cache) = cache();
        let calls = Cell::new(0u32);
        let compute = || {
            calls.set(calls.get() + 1);
            vec![23_000u64, 30_500]
        };

        let first: Vec<u64> = cache.get_or_compute("limits", &params(2025), compute);
        let second: Vec<u64> = cache.get_or_compute("limits", &params(2025), || {
            calls.set(calls.get() + 1);
            vec![23_000, 30_500]
        });

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn changed_parameter_triggers_recompute() {
        let (_dir, cache) = cache();
        let calls = Cell::new(0u32);

        let _: Vec<u64> = cache.get_or_compute("limits", &params(2025), || {
            calls.set(calls.get() + 1);
            vec![1]
        });
        let _: Vec<u64> = cache.get_or_compute("limits", &params(2026), || {
            calls.set(calls.get() + 1);
            vec![2]
        });

        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn stale_entry_is_retired_on_recompute() {
        let (_dir, cache) = cache();

        let _: Vec<u64> = cache.get_or_compute("limits", &params(2025), || vec![1]);
        let _: Vec<u64> = cache.get_or_compute("limits", &params(2026), || vec![2]);

        let entries = fs::read_dir(cache.root.join("limits"))
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn corrupt_entry_degrades_to_recompute() {
        let (_dir, cache) = cache();
        let _: Vec<u64> = cache.get_or_compute("limits", &params(2025), || vec![7]);

        // Smash the stored entry.
        let dir = cache.root.join("limits");
        let path = fs::read_dir(&dir).unwrap().next().unwrap().unwrap().path();
        fs::write(&path, b"not json").unwrap();

        let result: Vec<u64> = cache.get_or_compute("limits", &params(2025), || vec![7]);
        assert_eq!(result, vec![7]);
    }

    #[test]
    fn tables_are_isolated() {
        let (_dir, cache) = cache();
        let _: Vec<u64> = cache.get_or_compute("limits", &params(2025), || vec![1]);

        let calls = Cell::new(0u32);
        let _: Vec<u64> = cache.get_or_compute("factors", &params(2025), || {
            calls.set(calls.get() + 1);
            vec![9]
        });
        assert_eq!(calls.get(), 1);
    }
}
