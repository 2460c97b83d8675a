//! JSON file-backed checkpoint store.
//!
//! Offsets live in memory and are flushed to disk periodically by
//! [`Positions::spawn_sync`]. Writes are atomic (temp file, then rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::PositionsError;
use super::PositionStore;
use crate::config::PositionsConfig;

/// On-disk layout of the positions file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsFile {
    /// Byte offset per file.
    #[serde(default)]
    pub positions: BTreeMap<PathBuf, u64>,
}

/// Shared checkpoint store persisted as JSON.
#[derive(Debug)]
pub struct Positions {
    /// Backing file, `None` for an in-memory store.
    path: Option<PathBuf>,
    sync_period: Duration,
    positions: RwLock<BTreeMap<PathBuf, u64>>,
}

impl Positions {
    /// Open the store described by `config`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, or if it is
    /// corrupted and `ignore_invalid` is not set.
    pub fn open(config: &PositionsConfig) -> Result<Self, PositionsError> {
        let path = config.filename.clone();
        let positions = read_positions_file(&path, config.ignore_invalid)?;

        tracing::debug!(
            path = %path.display(),
            entries = positions.positions.len(),
            "Loaded positions"
        );

        Ok(Self {
            path: Some(path),
            sync_period: config.sync_period(),
            positions: RwLock::new(positions.positions),
        })
    }

    /// Create a store that never touches disk.
    #[must_use]
    pub fn in_memory(sync_period: Duration) -> Self {
        Self {
            path: None,
            sync_period,
            positions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Backing file path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of all stored offsets.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<PathBuf, u64> {
        self.positions
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Write the current offsets to disk. No-op for an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic write fails.
    pub fn save(&self) -> Result<(), PositionsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = PositionsFile {
            positions: self.snapshot(),
        };
        atomic_write(path, &file)
    }

    /// Spawn the periodic flush task.
    ///
    /// Saves every sync period and once more when `cancel` fires.
    pub fn spawn_sync(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let positions = Arc::clone(self);
        tokio::spawn(async move {
            let period = positions.sync_period.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => positions.save_logged().await,
                }
            }

            positions.save_logged().await;
            tracing::debug!("Positions sync stopped");
        })
    }

    async fn save_logged(self: &Arc<Self>) {
        let positions = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || positions.save()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to save positions"),
            Err(e) => tracing::error!(error = %e, "Positions save task failed"),
        }
    }
}

impl PositionStore for Positions {
    fn get(&self, path: &Path) -> u64 {
        self.positions
            .read()
            .ok()
            .and_then(|p| p.get(path).copied())
            .unwrap_or(0)
    }

    fn put(&self, path: &Path, offset: u64) {
        let mut positions = self
            .positions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        positions.insert(path.to_path_buf(), offset);
    }

    fn remove(&self, path: &Path) {
        let mut positions = self
            .positions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        positions.remove(path);
    }

    fn sync_period(&self) -> Duration {
        self.sync_period
    }
}

fn read_positions_file(path: &Path, ignore_invalid: bool) -> Result<PositionsFile, PositionsError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PositionsFile::default()),
        Err(source) => {
            return Err(PositionsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(PositionsFile::default());
    }

    match serde_json::from_str(&content) {
        Ok(file) => Ok(file),
        Err(e) if ignore_invalid => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Ignoring invalid positions file, starting from scratch"
            );
            Ok(PositionsFile::default())
        }
        Err(source) => Err(PositionsError::Corrupted {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn atomic_write(path: &Path, file: &PositionsFile) -> Result<(), PositionsError> {
    let io_err = |source: std::io::Error| PositionsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let json = serde_json::to_vec_pretty(file)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, json).map_err(io_err)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> PositionsConfig {
        PositionsConfig {
            filename: dir.path().join("positions.json"),
            sync_period_ms: 50,
            ignore_invalid: false,
        }
    }

    #[test]
    fn test_get_unknown_is_zero() {
        let positions = Positions::in_memory(Duration::from_secs(1));
        assert_eq!(positions.get(Path::new("/var/log/app.log")), 0);
    }

    #[test]
    fn test_put_get_remove() {
        let positions = Positions::in_memory(Duration::from_secs(1));
        let path = Path::new("/var/log/app.log");

        positions.put(path, 9);
        assert_eq!(positions.get(path), 9);

        positions.put(path, 27);
        assert_eq!(positions.get(path), 27);

        positions.remove(path);
        assert_eq!(positions.get(path), 0);
        assert!(positions.snapshot().is_empty());
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);

        let positions = Positions::open(&config).unwrap();
        positions.put(Path::new("/var/log/a.log"), 100);
        positions.put(Path::new("/var/log/b.log"), 7);
        positions.save().unwrap();

        let reopened = Positions::open(&config).unwrap();
        assert_eq!(reopened.get(Path::new("/var/log/a.log")), 100);
        assert_eq!(reopened.get(Path::new("/var/log/b.log")), 7);
        assert_eq!(reopened.sync_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let config = PositionsConfig {
            filename: dir.path().join("nested").join("positions.json"),
            ..config_for(&dir)
        };

        let positions = Positions::open(&config).unwrap();
        positions.put(Path::new("/var/log/a.log"), 1);
        positions.save().unwrap();
        assert!(config.filename.exists());
    }

    #[test]
    fn test_empty_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        fs::write(&config.filename, "").unwrap();

        let positions = Positions::open(&config).unwrap();
        assert!(positions.snapshot().is_empty());
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        fs::write(&config.filename, "{not json").unwrap();

        let result = Positions::open(&config);
        assert!(matches!(result, Err(PositionsError::Corrupted { .. })));
    }

    #[test]
    fn test_corrupted_file_ignored_when_configured() {
        let dir = TempDir::new().unwrap();
        let config = PositionsConfig {
            ignore_invalid: true,
            ..config_for(&dir)
        };
        fs::write(&config.filename, "{not json").unwrap();

        let positions = Positions::open(&config).unwrap();
        assert!(positions.snapshot().is_empty());
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let positions = Positions::open(&config).unwrap();
        positions.put(Path::new("/var/log/app.log"), 9);
        positions.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config.filename).unwrap()).unwrap();
        assert_eq!(raw["positions"]["/var/log/app.log"], 9);
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let positions = Positions::in_memory(Duration::from_secs(1));
        positions.put(Path::new("/var/log/a.log"), 1);
        assert!(positions.save().is_ok());
        assert!(positions.path().is_none());
    }

    #[tokio::test]
    async fn test_sync_task_saves_on_cancel() {
        let dir = TempDir::new().unwrap();
        let config = PositionsConfig {
            sync_period_ms: 60_000,
            ..config_for(&dir)
        };
        let positions = Arc::new(Positions::open(&config).unwrap());
        let cancel = CancellationToken::new();
        let task = positions.spawn_sync(cancel.clone());

        positions.put(Path::new("/var/log/a.log"), 42);
        cancel.cancel();
        task.await.unwrap();

        let reopened = Positions::open(&config).unwrap();
        assert_eq!(reopened.get(Path::new("/var/log/a.log")), 42);
    }

    #[tokio::test]
    async fn test_sync_task_saves_periodically() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let positions = Arc::new(Positions::open(&config).unwrap());
        let cancel = CancellationToken::new();
        let task = positions.spawn_sync(cancel.clone());

        positions.put(Path::new("/var/log/a.log"), 5);

        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if Positions::open(&config)
                    .map(|p| p.get(Path::new("/var/log/a.log")) == 5)
                    .unwrap_or(false)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(saved.is_ok(), "positions were never flushed");

        cancel.cancel();
        task.await.unwrap();
    }
}
