//! Tailing error types.

use std::path::PathBuf;

/// Errors that can occur while tailing a file.
#[derive(thiserror::Error, Debug)]
pub enum TailError {
    /// File does not exist.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Tailed file was removed or replaced and re-open is disabled.
    #[error("Tailed file deleted: {0}")]
    FileDeleted(PathBuf),

    /// Permission denied accessing file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// No file is open (waiting for a rotated file to reappear).
    #[error("No file open for {0}")]
    NotOpen(PathBuf),

    /// Line bytes were not valid UTF-8 and were decoded lossily.
    #[error("Invalid UTF-8 in line ending at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    /// Background task panicked or was aborted.
    #[error("Tail task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TailError {
    /// Map an I/O error on `path` to a typed variant where one exists.
    pub(crate) fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_file_deleted_display() {
        let err = TailError::FileDeleted(PathBuf::from("/var/log/app.log"));
        assert_eq!(err.to_string(), "Tailed file deleted: /var/log/app.log");
    }

    #[test]
    fn test_not_open_display() {
        let err = TailError::NotOpen(PathBuf::from("/var/log/app.log"));
        assert_eq!(err.to_string(), "No file open for /var/log/app.log");
    }

    #[test]
    fn test_invalid_utf8_display() {
        let err = TailError::InvalidUtf8 { offset: 12 };
        assert_eq!(err.to_string(), "Invalid UTF-8 in line ending at offset 12");
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = TailError::from_io(Path::new("/var/log/app.log"), io_err);
        assert!(matches!(err, TailError::FileNotFound(p) if p == Path::new("/var/log/app.log")));
    }

    #[test]
    fn test_from_io_maps_permission_denied() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = TailError::from_io(Path::new("/root/secret.log"), io_err);
        assert!(matches!(err, TailError::PermissionDenied(_)));
    }

    #[test]
    fn test_from_io_keeps_other_errors() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = TailError::from_io(Path::new("/var/log/app.log"), io_err);
        assert!(matches!(err, TailError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }
}
