//! Crash-safe file writes.
//!
//! Both shared mutable stores (checkpoints, derived-value cache) persist each
//! logical key exactly once via write-temp-then-atomic-rename. A reader either
//! sees the complete previous file or the complete new file, never a partial
//! write, so reads need no locking.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Monotonic suffix so concurrent writers in one process never share a temp
/// file name.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors from atomic file writes.
#[derive(Debug, Error)]
pub enum AtomicWriteError {
    /// The parent directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The temporary file could not be written or synced.
    #[error("failed to write temporary file {path}: {source}")]
    WriteTemp {
        /// Temporary file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The rename into place failed.
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Writes `contents` to `path` atomically.
///
/// The bytes land in a temporary sibling file which is fsynced and then
/// renamed over the destination. On any error the destination is untouched;
/// the temporary file is removed on a best-effort basis.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the temporary file
/// cannot be written and synced, or the rename fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AtomicWriteError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let suffix = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".{}.{}.{suffix}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned()),
        std::process::id(),
    );
    let tmp_path = path.with_file_name(tmp_name);

    let write_result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()
    })();

    if let Err(source) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(AtomicWriteError::WriteTemp {
            path: tmp_path.display().to_string(),
            source,
        });
    }

    fs::rename(&tmp_path, path).map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        AtomicWriteError::Rename {
            from: tmp_path.display().to_string(),
            to: path.display().to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.json");

        write_atomic(&path, b"{\"a\":1}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn replaces_existing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.json");

        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/out.bin");

        write_atomic(&path, &[1, 2, 3]).unwrap();

        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        write_atomic(&path, b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["out.bin".to_owned()]);
    }
}
