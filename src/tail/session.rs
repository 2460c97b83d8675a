//! Single-file tail session.
//!
//! A [`TailSession`] forwards every line appended to one file to an entry
//! handler and periodically records how far it has read in the checkpoint
//! store, so a restarted process resumes exactly where it stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::TailError;
use super::follower::{FileTail, Line, TailConfig};
use crate::api::{AddLabels, EntryHandler, LabelSet, FILENAME_LABEL};
use crate::config::TailSettings;
use crate::metrics::Metrics;
use crate::positions::PositionStore;

/// Shortest checkpoint interval a session will schedule.
const MIN_SYNC_PERIOD: Duration = Duration::from_millis(1);

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Downstream consumer of lines.
    pub handler: Arc<dyn EntryHandler>,
    /// Checkpoint store.
    pub positions: Arc<dyn PositionStore>,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Follower settings.
    pub settings: TailSettings,
}

/// Tails one file until stopped.
pub struct TailSession {
    /// Path the owner asked for; used for labels and metrics.
    path: PathBuf,
    /// File actually read; differs from `path` when it is a symlink.
    filename: PathBuf,
    follow_rotation: bool,
    positions: Arc<dyn PositionStore>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    done: Option<JoinHandle<Result<(), TailError>>>,
}

impl std::fmt::Debug for TailSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailSession")
            .field("path", &self.path)
            .field("filename", &self.filename)
            .field("follow_rotation", &self.follow_rotation)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TailSession {
    /// Start tailing `path`.
    ///
    /// A symlink is resolved once; the session then reads the target and
    /// re-opens it on rotation, since no create event is observable through
    /// the link. Reading resumes at the offset stored for the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be stat'ed, resolved or opened.
    /// No task is left running in that case.
    pub async fn start(ctx: &SessionContext, path: impl Into<PathBuf>) -> Result<Self, TailError> {
        let path = path.into();
        let (filename, follow_rotation) = resolve(&path).await?;

        let tail = FileTail::open(
            &filename,
            TailConfig {
                offset: ctx.positions.get(&filename),
                reopen: follow_rotation,
                poll_interval: ctx.settings.poll_interval(),
            },
        )
        .await?;

        let path_label = path.display().to_string();
        let handler = AddLabels::wrap(
            LabelSet::new().with(FILENAME_LABEL, path_label.clone()),
            Arc::clone(&ctx.handler),
        );
        let cancel = CancellationToken::new();

        let event_loop = EventLoop {
            path_label: path_label.clone(),
            filename: filename.clone(),
            tail,
            handler,
            positions: Arc::clone(&ctx.positions),
            metrics: Arc::clone(&ctx.metrics),
            cancel: cancel.clone(),
        };
        let span = tracing::info_span!("tail", path = %path_label);
        let done = tokio::spawn(event_loop.run().instrument(span));
        ctx.metrics.files_active.inc();

        Ok(Self {
            path,
            filename,
            follow_rotation,
            positions: Arc::clone(&ctx.positions),
            metrics: Arc::clone(&ctx.metrics),
            cancel,
            done: Some(done),
        })
    }

    /// Path the session was asked to tail.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File being read, after symlink resolution.
    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Whether rotation is followed by re-opening the file.
    #[must_use]
    pub fn follow_rotation(&self) -> bool {
        self.follow_rotation
    }

    /// Whether the event loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.done.as_ref().is_some_and(|done| !done.is_finished())
    }

    /// Stop tailing, keeping the checkpoint for a later resume.
    ///
    /// The event loop records a final position before it exits; this
    /// returns once it has. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the line source's terminal error. It is advisory: the
    /// session is fully stopped either way.
    pub async fn stop(&mut self) -> Result<(), TailError> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };
        self.cancel.cancel();
        let result = match done.await {
            Ok(result) => result,
            Err(e) => Err(TailError::Join(e)),
        };
        self.metrics.files_active.dec();
        tracing::info!(path = %self.path.display(), "Stopped tailing file");
        result
    }

    /// Forget the stored position, for files that are gone for good.
    ///
    /// A file later created at the same path is read from the start.
    pub fn cleanup(&self) {
        self.positions.remove(&self.filename);
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        if self.done.take().is_some() {
            self.cancel.cancel();
            self.metrics.files_active.dec();
        }
    }
}

/// Resolve `path` to the file to read and whether to follow rotation.
async fn resolve(path: &Path) -> Result<(PathBuf, bool), TailError> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| TailError::from_io(path, e))?;
    if !metadata.file_type().is_symlink() {
        return Ok((path.to_path_buf(), false));
    }

    let target = tokio::fs::read_link(path)
        .await
        .map_err(|e| TailError::from_io(path, e))?;
    // A relative target is relative to the link's own directory.
    let target = match path.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };
    Ok((target, true))
}

/// State owned by the session's task.
struct EventLoop {
    path_label: String,
    filename: PathBuf,
    tail: FileTail,
    handler: AddLabels,
    positions: Arc<dyn PositionStore>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) -> Result<(), TailError> {
        tracing::info!(filename = %self.filename.display(), "Start tailing file");

        let period = self.positions.sync_period().max(MIN_SYNC_PERIOD);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.on_tick().await,
                line = self.tail.next_line() => {
                    let Some(line) = line else {
                        tracing::debug!("Line source closed");
                        break;
                    };
                    self.on_line(line).await;
                }
            }
        }
        drop(ticker);

        // Final checkpoint, on the same task as the periodic ones.
        if let Err(e) = self.mark_position() {
            tracing::error!(error = %e, "Error getting tail position");
        }
        self.tail.stop().await
    }

    async fn on_tick(&self) {
        match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) => self
                .metrics
                .total_bytes
                .with_label_values(&[self.path_label.as_str()])
                .set(i64::try_from(metadata.len()).unwrap_or(i64::MAX)),
            Err(e) => {
                tracing::error!(
                    filename = %self.filename.display(),
                    error = %e,
                    "Failed to stat log file being tailed, cannot report size or mark position"
                );
                return;
            }
        }
        if let Err(e) = self.mark_position() {
            tracing::error!(error = %e, "Error getting tail position");
        }
    }

    async fn on_line(&self, line: Line) {
        if let Some(e) = &line.err {
            tracing::error!(error = %e, "Error reading line");
        }

        self.metrics
            .read_lines
            .with_label_values(&[self.path_label.as_str()])
            .inc();
        // Raw length, so the counter tracks file growth even for lossy lines.
        self.metrics
            .read_bytes
            .with_label_values(&[self.path_label.as_str()])
            .inc_by(line.len as u64);

        if let Err(e) = self
            .handler
            .handle(LabelSet::new(), line.time, line.text)
            .await
        {
            tracing::error!(error = %e, "Error handling line");
        }
    }

    fn mark_position(&self) -> Result<(), TailError> {
        let position = self.tail.tell()?;
        tracing::debug!(
            filename = %self.filename.display(),
            position,
            "Marking position"
        );
        self.positions.put(&self.filename, position);
        Ok(())
    }
}
