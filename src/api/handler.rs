//! Entry handler trait and the handlers shipped with the crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::labels::LabelSet;

/// Errors returned by an entry handler.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// The downstream receiver has gone away.
    #[error("Entry channel closed")]
    ChannelClosed,
}

/// A single log line with its labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Labels attached to the line.
    pub labels: LabelSet,
    /// When the line was read.
    pub timestamp: DateTime<Utc>,
    /// Line text without the trailing newline.
    pub line: String,
}

/// Downstream consumer of log lines.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Handle one line.
    ///
    /// Failures are not retried by the caller.
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), HandlerError>;
}

/// Middleware that merges a fixed label set into every entry.
#[derive(Clone)]
pub struct AddLabels {
    labels: LabelSet,
    inner: Arc<dyn EntryHandler>,
}

impl AddLabels {
    /// Wrap `inner`, adding `labels` to every entry it receives.
    #[must_use]
    pub fn wrap(labels: LabelSet, inner: Arc<dyn EntryHandler>) -> Self {
        Self { labels, inner }
    }

    /// Labels this middleware adds.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }
}

impl std::fmt::Debug for AddLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddLabels")
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EntryHandler for AddLabels {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), HandlerError> {
        // Entry labels take precedence over the ones added here.
        let labels = self.labels.merge(&labels);
        self.inner.handle(labels, timestamp, line).await
    }
}

/// Handler that forwards entries into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<Entry>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Entry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EntryHandler for ChannelHandler {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), HandlerError> {
        self.tx
            .send(Entry {
                labels,
                timestamp,
                line,
            })
            .await
            .map_err(|_| HandlerError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FILENAME_LABEL;

    #[tokio::test]
    async fn test_channel_handler_forwards_entry() {
        let (handler, mut rx) = ChannelHandler::new(4);
        let now = Utc::now();

        handler
            .handle(LabelSet::new().with("job", "app"), now, "hello".to_string())
            .await
            .unwrap();

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.line, "hello");
        assert_eq!(entry.timestamp, now);
        assert_eq!(entry.labels.get("job"), Some("app"));
    }

    #[tokio::test]
    async fn test_channel_handler_closed_receiver() {
        let (handler, rx) = ChannelHandler::new(1);
        drop(rx);

        let result = handler
            .handle(LabelSet::new(), Utc::now(), "lost".to_string())
            .await;
        assert!(matches!(result, Err(HandlerError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_add_labels_injects_filename() {
        let (inner, mut rx) = ChannelHandler::new(4);
        let handler = AddLabels::wrap(
            LabelSet::new().with(FILENAME_LABEL, "/var/log/app.log"),
            Arc::new(inner),
        );

        handler
            .handle(LabelSet::new(), Utc::now(), "line".to_string())
            .await
            .unwrap();

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.labels.get(FILENAME_LABEL), Some("/var/log/app.log"));
        assert_eq!(entry.labels.len(), 1);
    }

    #[tokio::test]
    async fn test_add_labels_entry_labels_win() {
        let (inner, mut rx) = ChannelHandler::new(4);
        let handler = AddLabels::wrap(LabelSet::new().with("job", "default"), Arc::new(inner));

        handler
            .handle(
                LabelSet::new().with("job", "override"),
                Utc::now(),
                "line".to_string(),
            )
            .await
            .unwrap();

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.labels.get("job"), Some("override"));
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::ChannelClosed.to_string(), "Entry channel closed");
    }
}
