use std::io;
use std::path::Path;

use thiserror::Error;

/// Unified result type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure taxonomy for the storage engine.
///
/// The engine distinguishes recoverable filesystem conditions (`NotFound`,
/// `Io`, `Parse`), which the facade downgrades to benign defaults with a
/// log line, from programmer errors (`UnsupportedAggregation`,
/// `InvalidConsent`) which are surfaced to the caller directly.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not exist. Routinely treated as "empty shard" or
    /// "empty index" by callers.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// An underlying read/write/mkdir/remove/list failed.
    #[error("i/o fault on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Invalid JSON, a truncated envelope, or a checksum mismatch.
    #[error("parse failure at {path}: {detail}")]
    Parse { path: String, detail: String },

    /// An aggregation key the query layer does not recognize.
    #[error("unsupported aggregation `{key}`")]
    UnsupportedAggregation { key: String },

    /// A destructive operation was invoked without the literal consent
    /// string `"YES"`.
    #[error("destructive operation refused: consent string mismatch")]
    InvalidConsent,
}

impl StoreError {
    /// Map an `std::io::Error` onto the taxonomy, folding `NotFound` into
    /// its dedicated variant.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.display().to_string();
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound { path }
        } else {
            StoreError::Io { path, source }
        }
    }

    pub fn parse(path: &Path, detail: impl Into<String>) -> Self {
        StoreError::Parse {
            path: path.display().to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn io_not_found_folds_into_not_found() {
        let err = StoreError::from_io(
            &PathBuf::from("/tmp/missing.json"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn other_io_kinds_stay_io() {
        let err = StoreError::from_io(
            &PathBuf::from("/tmp/locked.json"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
