//! Blocking filesystem adapter.
//!
//! A thin wrapper over `std::fs` that maps every failure into the
//! [`StoreError`] taxonomy and pins down the edge policies the rest of the
//! engine relies on: a zero-byte file reads as empty text (not `NotFound`),
//! and creating a directory that already exists is success.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::debug;

use chronolithdb_core::error::{Result, StoreError};

/// Metadata snapshot for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: i64,
    pub is_file: bool,
    pub is_dir: bool,
}

/// Synchronous filesystem primitives with typed failures.
///
/// All operations are blocking; the engine's cooperative pipeline slices
/// its own work instead of relying on async I/O, which keeps this adapter
/// portable to hosts that only offer blocking file primitives.
pub struct FsAdapter;

impl FsAdapter {
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Read a whole file as UTF-8 text. A zero-byte file yields an empty
    /// string; an absent path yields [`StoreError::NotFound`].
    pub fn read_text(path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| StoreError::from_io(path, e))
    }

    /// Write `text`, truncating any previous content. The parent directory
    /// must already exist.
    pub fn write_text_truncating(path: &Path, text: &str) -> Result<()> {
        debug!(target: "chronolithdb::fs", path = %path.display(), bytes = text.len(), "write");
        fs::write(path, text).map_err(|e| StoreError::from_io(path, e))
    }

    pub fn remove(path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| StoreError::from_io(path, e))
    }

    /// Create a directory; an already-existing directory is success.
    pub fn mkdir_idempotent(path: &Path) -> Result<()> {
        match fs::create_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::from_io(path, e)),
        }
    }

    /// List the entry names (not full paths) of a directory, sorted for
    /// deterministic iteration.
    pub fn list(path: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(path).map_err(|e| StoreError::from_io(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::from_io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn stat(path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path).map_err(|e| StoreError::from_io(path, e))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(FileStat {
            size: meta.len(),
            mtime_ms,
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn zero_byte_file_reads_as_empty_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.json");
        FsAdapter::write_text_truncating(&path, "").unwrap();
        assert_eq!(FsAdapter::read_text(&path).unwrap(), "");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = FsAdapter::read_text(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn mkdir_twice_is_success() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("data");
        FsAdapter::mkdir_idempotent(&nested).unwrap();
        FsAdapter::mkdir_idempotent(&nested).unwrap();
        assert!(FsAdapter::stat(&nested).unwrap().is_dir);
    }

    #[test]
    fn list_returns_sorted_names() {
        let dir = TempDir::new().unwrap();
        for name in ["b.json", "a.json", "c.json"] {
            FsAdapter::write_text_truncating(&dir.path().join(name), "[]").unwrap();
        }
        assert_eq!(
            FsAdapter::list(dir.path()).unwrap(),
            vec!["a.json", "b.json", "c.json"]
        );
    }

    #[test]
    fn truncating_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard.json");
        FsAdapter::write_text_truncating(&path, "a long first body").unwrap();
        FsAdapter::write_text_truncating(&path, "short").unwrap();
        assert_eq!(FsAdapter::read_text(&path).unwrap(), "short");
    }
}
