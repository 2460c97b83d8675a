//! Read-offset checkpoint store.
//!
//! Maps each tailed file to the byte offset up to which its lines have been
//! handed downstream, so tailing can resume after a restart.

mod error;
mod file;

use std::path::Path;
use std::time::Duration;

pub use error::PositionsError;
pub use file::{Positions, PositionsFile};

/// Storage for per-file read offsets.
///
/// Implementations must tolerate concurrent calls from many sessions.
pub trait PositionStore: Send + Sync {
    /// Stored offset for `path`, zero if unknown.
    fn get(&self, path: &Path) -> u64;

    /// Record `offset` for `path`.
    fn put(&self, path: &Path, offset: u64);

    /// Forget `path` entirely.
    fn remove(&self, path: &Path);

    /// How often sessions should checkpoint.
    fn sync_period(&self) -> Duration;
}
