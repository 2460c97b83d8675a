//! Checkpoint store error types.

use std::path::PathBuf;

/// Errors from loading or saving the positions file.
#[derive(thiserror::Error, Debug)]
pub enum PositionsError {
    /// Positions file could not be read or written.
    #[error("Positions file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Positions file contents are not valid.
    #[error("Invalid positions file {path}: {source}")]
    Corrupted {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Positions could not be serialized.
    #[error("Failed to serialize positions: {0}")]
    Serialize(#[from] serde_json::Error),
}
