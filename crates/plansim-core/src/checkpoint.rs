//! Checkpoint storage and recovery.
//!
//! One artifact per completed year, written via write-temp-then-atomic-rename
//! so no reader ever observes a partial checkpoint. Each artifact carries a
//! format version, the config fingerprint it was written under, and a BLAKE3
//! digest of the uncompressed payload; "latest valid" is the highest year
//! whose digest re-validates and whose fingerprint matches the current run.
//!
//! Artifacts are never mutated. A later checkpoint supersedes an earlier one
//! by year; the `latest` pointer file is rewritten only after the new
//! artifact has been re-read and fully validated.
//!
//! # Artifact format
//!
//! ```text
//! magic "PSCK" | u32 LE meta length | metadata JSON | zstd payload
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic::{AtomicWriteError, write_atomic};
use crate::fingerprint::{self, Fingerprint};

/// Magic bytes at the start of every checkpoint artifact.
const CHECKPOINT_MAGIC: &[u8; 4] = b"PSCK";

/// Current artifact format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// zstd level for checkpoint payloads. Level 3 is the zstd default;
/// checkpoints are written once per year, so write speed is not critical,
/// but harness runs create many of them.
const COMPRESSION_LEVEL: i32 = 3;

/// Name of the pointer file naming the newest validated year.
const LATEST_POINTER: &str = "latest";

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure reading or scanning the store.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Atomic write failure; the store is unchanged.
    #[error("checkpoint write failed: {0}")]
    Write(#[from] AtomicWriteError),

    /// Metadata could not be serialized or parsed.
    #[error("checkpoint metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The artifact is structurally invalid (bad magic, truncated frame,
    /// undecodable payload).
    #[error("corrupt checkpoint at {path}: {detail}")]
    Corrupt {
        /// Artifact path.
        path: String,
        /// What was wrong.
        detail: String,
    },

    /// The stored digest does not match a fresh recomputation.
    #[error("digest mismatch for year {year}: stored {stored}, recomputed {recomputed}")]
    DigestMismatch {
        /// Year of the artifact.
        year: u16,
        /// Digest recorded in the metadata.
        stored: String,
        /// Digest recomputed from the payload.
        recomputed: String,
    },

    /// The artifact was written by an incompatible format version.
    #[error("unsupported checkpoint format version {found} at {path} (supported: {supported})")]
    FormatVersion {
        /// Version found in the artifact.
        found: u32,
        /// Artifact path.
        path: String,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// No artifact exists for the requested year.
    #[error("no checkpoint for year {year}")]
    NotFound {
        /// Requested year.
        year: u16,
    },
}

/// Metadata stored inside each artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Artifact format version.
    pub format_version: u32,
    /// Simulated year this checkpoint closes.
    pub year: u16,
    /// Wall-clock creation time, nanoseconds since the epoch.
    pub created_at_ns: u64,
    /// Fingerprint of the configuration the year was computed under.
    pub config_fingerprint: Fingerprint,
    /// BLAKE3 digest of the uncompressed payload.
    pub entity_state_digest: Fingerprint,
}

/// A loaded, validated checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Artifact metadata.
    pub meta: CheckpointMeta,
    /// Uncompressed payload bytes.
    pub payload: Vec<u8>,
}

/// Validation status of one artifact, for `checkpoint status`/`validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Digest and fingerprint both validate.
    Valid,
    /// Digest validates but was written under a different configuration.
    FingerprintMismatch {
        /// Fingerprint found in the artifact.
        stored: String,
    },
    /// The artifact fails structural or digest validation.
    Invalid {
        /// Human-readable reason.
        reason: String,
    },
}

/// One row of a store listing.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    /// Year the artifact covers.
    pub year: u16,
    /// Artifact size on disk in bytes.
    pub size_bytes: u64,
}

/// Filesystem checkpoint store.
///
/// The store is the only writer of its directory; readers may scan it
/// concurrently because every artifact lands via atomic rename.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Opens (creating if necessary) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CheckpointError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, year: u16) -> PathBuf {
        self.root.join(format!("year-{year:04}.ckpt"))
    }

    /// Creates the checkpoint for `year`. All-or-nothing: on any error the
    /// store is unchanged and no partial artifact is observable.
    ///
    /// The `latest` pointer is rewritten only after the new artifact has been
    /// re-read and fully validated.
    ///
    /// # Errors
    ///
    /// Returns an error if compression, the atomic write, or post-write
    /// validation fails. A create failure is fatal for the surrounding run.
    pub fn create(
        &self,
        year: u16,
        config_fingerprint: &Fingerprint,
        payload: &[u8],
    ) -> Result<CheckpointMeta, CheckpointError> {
        let meta = CheckpointMeta {
            format_version: CHECKPOINT_FORMAT_VERSION,
            year,
            created_at_ns: now_ns(),
            config_fingerprint: config_fingerprint.clone(),
            entity_state_digest: fingerprint::state_digest(payload),
        };

        let compressed = zstd::encode_all(payload, COMPRESSION_LEVEL).map_err(|source| {
            CheckpointError::Io {
                path: self.artifact_path(year).display().to_string(),
                source,
            }
        })?;

        let meta_bytes = serde_json::to_vec(&meta)?;
        let meta_len = u32::try_from(meta_bytes.len()).map_err(|_| CheckpointError::Corrupt {
            path: self.artifact_path(year).display().to_string(),
            detail: "metadata exceeds u32 length".to_owned(),
        })?;

        let mut frame = Vec::with_capacity(4 + 4 + meta_bytes.len() + compressed.len());
        frame.extend_from_slice(CHECKPOINT_MAGIC);
        frame.extend_from_slice(&meta_len.to_le_bytes());
        frame.extend_from_slice(&meta_bytes);
        frame.extend_from_slice(&compressed);

        let path = self.artifact_path(year);
        write_atomic(&path, &frame)?;

        // Re-read and fully validate before publishing the pointer; the
        // pointer never names an artifact that has not round-tripped.
        let reloaded = self.load(year)?;
        if reloaded.meta != meta {
            return Err(CheckpointError::Corrupt {
                path: path.display().to_string(),
                detail: "post-write validation re-read different metadata".to_owned(),
            });
        }
        write_atomic(&self.root.join(LATEST_POINTER), format!("{year}\n").as_bytes())?;

        info!(
            year,
            digest = meta.entity_state_digest.short(),
            bytes = frame.len(),
            "checkpoint committed"
        );
        Ok(meta)
    }

    /// Loads and validates the artifact for `year`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no artifact exists, `Corrupt`/`FormatVersion`
    /// for structural failures, and `DigestMismatch` when the payload does
    /// not hash to the stored digest.
    pub fn load(&self, year: u16) -> Result<Checkpoint, CheckpointError> {
        let path = self.artifact_path(year);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound { year });
            },
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.display().to_string(),
                    source,
                });
            },
        };

        let (meta, compressed) = parse_frame(&path, &bytes)?;

        if meta.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::FormatVersion {
                found: meta.format_version,
                path: path.display().to_string(),
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }
        if meta.year != year {
            return Err(CheckpointError::Corrupt {
                path: path.display().to_string(),
                detail: format!("artifact names year {}, file names year {year}", meta.year),
            });
        }

        let mut payload = Vec::new();
        zstd::Decoder::new(compressed)
            .and_then(|mut d| d.read_to_end(&mut payload))
            .map_err(|e| CheckpointError::Corrupt {
                path: path.display().to_string(),
                detail: format!("payload decompression failed: {e}"),
            })?;

        let recomputed = fingerprint::state_digest(&payload);
        if recomputed != meta.entity_state_digest {
            return Err(CheckpointError::DigestMismatch {
                year,
                stored: meta.entity_state_digest.as_hex().to_owned(),
                recomputed: recomputed.as_hex().to_owned(),
            });
        }

        Ok(Checkpoint { meta, payload })
    }

    /// Returns the newest checkpoint whose digest re-validates and whose
    /// fingerprint matches, scanning newest-to-oldest and logging each
    /// rejected artifact. `None` when the scan is exhausted.
    ///
    /// A corrupt newest artifact is a warning here, not a failure: recovery
    /// falls back progressively to the next older valid one.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store directory itself cannot be read.
    pub fn latest_valid(
        &self,
        config_fingerprint: &Fingerprint,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let mut years = self.years()?;
        years.sort_unstable_by(|a, b| b.cmp(a));

        for year in years {
            match self.load(year) {
                Ok(checkpoint) => {
                    if &checkpoint.meta.config_fingerprint == config_fingerprint {
                        debug!(year, "latest valid checkpoint found");
                        return Ok(Some(checkpoint));
                    }
                    warn!(
                        year,
                        stored = checkpoint.meta.config_fingerprint.short(),
                        current = config_fingerprint.short(),
                        "skipping checkpoint written under a different configuration"
                    );
                },
                Err(
                    err @ (CheckpointError::Corrupt { .. }
                    | CheckpointError::DigestMismatch { .. }
                    | CheckpointError::FormatVersion { .. }),
                ) => {
                    warn!(year, error = %err, "skipping invalid checkpoint, falling back");
                },
                Err(CheckpointError::NotFound { .. }) => {},
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Lists artifacts, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut years = self.years()?;
        years.sort_unstable_by(|a, b| b.cmp(a));
        years
            .into_iter()
            .map(|year| {
                let path = self.artifact_path(year);
                let size_bytes = fs::metadata(&path)
                    .map_err(|source| CheckpointError::Io {
                        path: path.display().to_string(),
                        source,
                    })?
                    .len();
                Ok(CheckpointSummary { year, size_bytes })
            })
            .collect()
    }

    /// Validates every artifact against the given fingerprint, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory scan fails; per-artifact
    /// failures are reported in the returned statuses.
    pub fn validate_all(
        &self,
        config_fingerprint: &Fingerprint,
    ) -> Result<Vec<(u16, CheckpointStatus)>, CheckpointError> {
        let mut years = self.years()?;
        years.sort_unstable_by(|a, b| b.cmp(a));
        Ok(years
            .into_iter()
            .map(|year| {
                let status = match self.load(year) {
                    Ok(checkpoint) => {
                        if &checkpoint.meta.config_fingerprint == config_fingerprint {
                            CheckpointStatus::Valid
                        } else {
                            CheckpointStatus::FingerprintMismatch {
                                stored: checkpoint.meta.config_fingerprint.as_hex().to_owned(),
                            }
                        }
                    },
                    Err(err) => CheckpointStatus::Invalid {
                        reason: err.to_string(),
                    },
                };
                (year, status)
            })
            .collect())
    }

    /// Deletes all but the `keep_n` newest artifacts. Returns the number
    /// deleted. At least the newest artifact is always kept, so the `latest`
    /// pointer keeps naming an artifact that exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or a deletion fails.
    pub fn cleanup(&self, keep_n: usize) -> Result<usize, CheckpointError> {
        let keep_n = keep_n.max(1);
        let mut years = self.years()?;
        years.sort_unstable_by(|a, b| b.cmp(a));

        let mut deleted = 0;
        for year in years.into_iter().skip(keep_n) {
            let path = self.artifact_path(year);
            fs::remove_file(&path).map_err(|source| CheckpointError::Io {
                path: path.display().to_string(),
                source,
            })?;
            deleted += 1;
        }
        if deleted > 0 {
            info!(deleted, kept = keep_n, "checkpoint retention applied");
        }
        Ok(deleted)
    }

    /// The year named by the `latest` pointer, if the pointer exists and
    /// parses.
    #[must_use]
    pub fn latest_pointer(&self) -> Option<u16> {
        let raw = fs::read_to_string(self.root.join(LATEST_POINTER)).ok()?;
        raw.trim().parse().ok()
    }

    /// Years with an artifact present, in no particular order.
    fn years(&self) -> Result<Vec<u16>, CheckpointError> {
        let entries = fs::read_dir(&self.root).map_err(|source| CheckpointError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut years = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.root.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(year) = name
                .strip_prefix("year-")
                .and_then(|rest| rest.strip_suffix(".ckpt"))
                .and_then(|digits| digits.parse().ok())
            {
                years.push(year);
            }
        }
        Ok(years)
    }
}

/// Splits an artifact into parsed metadata and the compressed payload slice.
fn parse_frame<'a>(
    path: &Path,
    bytes: &'a [u8],
) -> Result<(CheckpointMeta, &'a [u8]), CheckpointError> {
    let corrupt = |detail: &str| CheckpointError::Corrupt {
        path: path.display().to_string(),
        detail: detail.to_owned(),
    };

    if bytes.len() < 8 {
        return Err(corrupt("truncated header"));
    }
    if &bytes[..4] != CHECKPOINT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[4..8]);
    let meta_len = u32::from_le_bytes(len_bytes) as usize;
    if bytes.len() < 8 + meta_len {
        return Err(corrupt("truncated metadata"));
    }

    let meta: CheckpointMeta = serde_json::from_slice(&bytes[8..8 + meta_len])
        .map_err(|e| corrupt(&format!("unparseable metadata: {e}")))?;
    Ok((meta, &bytes[8 + meta_len..]))
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
