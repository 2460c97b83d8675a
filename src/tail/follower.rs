//! Line-oriented file follower.
//!
//! [`FileTail`] reads newline-terminated lines from a growing file in a
//! background task, starting at a byte offset. It notices truncation and,
//! when asked to, re-opens the path after the file has been rotated away.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::TailError;

/// Lines buffered between the reader task and the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Options for [`FileTail::open`].
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Byte offset to start reading from.
    pub offset: u64,
    /// Re-open the path when the file is removed or replaced.
    pub reopen: bool,
    /// Fallback polling interval while waiting for the file to change.
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            reopen: false,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A line read from the file, without its trailing newline.
#[derive(Debug)]
pub struct Line {
    pub text: String,
    /// Raw bytes consumed from the file, newline included.
    pub len: usize,
    /// When the line was read.
    pub time: DateTime<Utc>,
    /// Problem encountered while reading this line. The text is still usable.
    pub err: Option<TailError>,
}

#[derive(Debug)]
enum TailEvent {
    /// A complete line; `offset` is the position just past its newline.
    Line { line: Line, offset: u64 },
    /// Reading restarted at the beginning of a (possibly new) file.
    Reopened,
    /// The file went away and the reader is waiting for it to come back.
    Detached,
}

/// Follows a single file, yielding lines as they are appended.
pub struct FileTail {
    path: PathBuf,
    events: mpsc::Receiver<TailEvent>,
    /// Offset just past the last line handed out by `next_line`.
    position: Option<u64>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<Result<(), TailError>>>,
    watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for FileTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTail")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

impl FileTail {
    /// Open `path` and start following it from `config.offset`.
    ///
    /// If the file is already shorter than the requested offset it was
    /// truncated in the meantime, and reading starts from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or positioned.
    pub async fn open(path: impl Into<PathBuf>, config: TailConfig) -> Result<Self, TailError> {
        let path = path.into();
        let mut file = File::open(&path)
            .await
            .map_err(|e| TailError::from_io(&path, e))?;
        let metadata = file.metadata().await?;

        let mut offset = config.offset;
        if metadata.len() < offset {
            tracing::warn!(
                path = %path.display(),
                offset,
                len = metadata.len(),
                "File is shorter than stored position, reading from the beginning"
            );
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let watcher = match watch_parent(&path, wake_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "File system notifications unavailable, falling back to polling"
                );
                None
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let reader = Reader {
            path: path.clone(),
            reopen: config.reopen,
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
            file: BufReader::new(file),
            identity: FileIdentity::of(&metadata),
            offset,
            partial: Vec::new(),
            events: events_tx,
            wake: watcher.is_some().then_some(wake_rx),
            cancel: cancel.clone(),
        };
        let reader = tokio::spawn(reader.run());

        Ok(Self {
            path,
            events: events_rx,
            position: Some(offset),
            cancel,
            reader: Some(reader),
            watcher,
        })
    }

    /// Path being followed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next line.
    ///
    /// Returns `None` once the reader has terminated, e.g. because the file
    /// was deleted and re-open is disabled. Cancel safe.
    pub async fn next_line(&mut self) -> Option<Line> {
        loop {
            match self.events.recv().await? {
                TailEvent::Line { line, offset } => {
                    self.position = Some(offset);
                    return Some(line);
                }
                TailEvent::Reopened => self.position = Some(0),
                TailEvent::Detached => self.position = None,
            }
        }
    }

    /// Byte offset just past the last line returned by [`FileTail::next_line`].
    ///
    /// # Errors
    ///
    /// Returns `TailError::NotOpen` while a rotated file has not reappeared.
    pub fn tell(&self) -> Result<u64, TailError> {
        self.position
            .ok_or_else(|| TailError::NotOpen(self.path.clone()))
    }

    /// Stop the reader and return the error it terminated with, if any.
    ///
    /// Calling this more than once is harmless.
    ///
    /// # Errors
    ///
    /// Returns the reader's terminal error, or a join error if it panicked.
    pub async fn stop(&mut self) -> Result<(), TailError> {
        self.cancel.cancel();
        self.watcher = None;
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        match reader.await {
            Ok(result) => result,
            Err(e) => Err(TailError::Join(e)),
        }
    }
}

impl Drop for FileTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn watch_parent(
    path: &Path,
    wake: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = wake.send(());
        }
    })?;
    // The directory, not the file, so a re-created file is seen too.
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Identity of an open file, used to tell rotation from growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(_metadata: &std::fs::Metadata) -> Self {
        Self {}
    }
}

enum FileState {
    Unchanged,
    Truncated,
    Replaced,
    Missing,
}

/// Why the reader loop ended.
enum Halt {
    /// Cancelled, or the consumer went away.
    Stopped,
    Failed(TailError),
}

impl From<TailError> for Halt {
    fn from(err: TailError) -> Self {
        Self::Failed(err)
    }
}

impl From<std::io::Error> for Halt {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(TailError::Io(err))
    }
}

struct Reader {
    path: PathBuf,
    reopen: bool,
    poll_interval: Duration,
    file: BufReader<File>,
    identity: FileIdentity,
    /// Offset just past the last complete line read.
    offset: u64,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
    events: mpsc::Sender<TailEvent>,
    wake: Option<mpsc::UnboundedReceiver<()>>,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(mut self) -> Result<(), TailError> {
        match self.follow().await {
            Err(Halt::Failed(e)) => Err(e),
            Ok(()) | Err(Halt::Stopped) => Ok(()),
        }
    }

    async fn follow(&mut self) -> Result<(), Halt> {
        loop {
            self.read_available().await?;

            match self.check_file().await {
                FileState::Unchanged => self.wait().await?,
                FileState::Truncated => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = self.offset,
                        "File truncated, reading from the beginning"
                    );
                    self.file.seek(SeekFrom::Start(0)).await?;
                    self.offset = 0;
                    self.partial.clear();
                    self.emit(TailEvent::Reopened).await?;
                }
                FileState::Replaced | FileState::Missing => {
                    if !self.reopen {
                        return Err(TailError::FileDeleted(self.path.clone()).into());
                    }
                    tracing::info!(path = %self.path.display(), "File rotated, re-opening");
                    self.emit(TailEvent::Detached).await?;
                    self.reopen_file().await?;
                    self.emit(TailEvent::Reopened).await?;
                }
            }
        }
    }

    /// Emit every complete line up to the current end of file.
    async fn read_available(&mut self) -> Result<(), Halt> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Halt::Stopped);
            }

            let n = self.file.read_until(b'\n', &mut self.partial).await?;
            if n == 0 || self.partial.last() != Some(&b'\n') {
                return Ok(());
            }

            let mut bytes = std::mem::take(&mut self.partial);
            let len = bytes.len();
            self.offset += len as u64;
            bytes.pop();

            let (text, err) = match String::from_utf8(bytes) {
                Ok(text) => (text, None),
                Err(e) => (
                    String::from_utf8_lossy(e.as_bytes()).into_owned(),
                    Some(TailError::InvalidUtf8 {
                        offset: self.offset,
                    }),
                ),
            };

            let line = Line {
                text,
                len,
                time: Utc::now(),
                err,
            };
            self.emit(TailEvent::Line {
                line,
                offset: self.offset,
            })
            .await?;
        }
    }

    async fn check_file(&self) -> FileState {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => {
                let read_position = self.offset + self.partial.len() as u64;
                if FileIdentity::of(&metadata) != self.identity {
                    FileState::Replaced
                } else if metadata.len() < read_position {
                    FileState::Truncated
                } else {
                    FileState::Unchanged
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileState::Missing,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to stat file");
                FileState::Unchanged
            }
        }
    }

    /// Wait until the path can be opened again, then read it from the start.
    async fn reopen_file(&mut self) -> Result<(), Halt> {
        loop {
            match File::open(&self.path).await {
                Ok(file) => {
                    let metadata = file.metadata().await?;
                    self.identity = FileIdentity::of(&metadata);
                    self.file = BufReader::new(file);
                    self.offset = 0;
                    self.partial.clear();
                    tracing::debug!(path = %self.path.display(), "Re-opened file");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to re-open file, retrying"
                    );
                }
            }
            self.wait().await?;
        }
    }

    async fn emit(&self, event: TailEvent) -> Result<(), Halt> {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(Halt::Stopped),
            sent = self.events.send(event) => sent.map_err(|_| Halt::Stopped),
        }
    }

    /// Sleep until a file system event, the poll interval, or cancellation.
    async fn wait(&mut self) -> Result<(), Halt> {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => return Err(Halt::Stopped),
            () = next_wake(&mut self.wake) => {}
            () = tokio::time::sleep(self.poll_interval) => {}
        }

        // One pass over the file covers every notification queued so far.
        if let Some(wake) = &mut self.wake {
            while wake.try_recv().is_ok() {}
        }
        Ok(())
    }
}

async fn next_wake(wake: &mut Option<mpsc::UnboundedReceiver<()>>) {
    if let Some(rx) = wake {
        if rx.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await;
}
