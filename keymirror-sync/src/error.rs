//! Error types for keymirror-sync.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from mirror operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A deletion targeted a file that is not in the mirror.
    #[error("cannot delete {path}: file does not exist")]
    MissingFile { path: PathBuf },

    /// The mirror root exists but is not a directory.
    #[error("mirror root {path} exists and is not a directory")]
    NotADirectory { path: PathBuf },

    /// A key that cannot be mapped to a path under the mirror root.
    #[error("key '{key}' does not map to a path inside the mirror")]
    InvalidKey { key: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
