//! Process-wide metrics registry.
//!
//! A single [`Metrics`] value is shared by every tail session. Labeled series
//! are keyed by the path the owner asked to tail, under the `path` label.

use std::collections::BTreeMap;

use prometheus::proto::MetricType;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Label carrying the requested path on every per-file series.
pub const PATH_LABEL: &str = "path";

const READ_LINES: &str = "log_tailer_read_lines_total";
const READ_BYTES: &str = "log_tailer_read_bytes_total";
const TOTAL_BYTES: &str = "log_tailer_file_bytes_total";
const FILES_ACTIVE: &str = "log_tailer_files_active_total";

/// Metrics updated by tail sessions.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Lines read, per file.
    pub read_lines: IntCounterVec,
    /// Bytes read (including stripped newlines), per file.
    pub read_bytes: IntCounterVec,
    /// Last observed file size, per file.
    pub total_bytes: IntGaugeVec,
    /// Number of files currently being tailed.
    pub files_active: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("files_active", &self.files_active.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create the collectors and register them in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be created or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let read_lines = IntCounterVec::new(
            Opts::new(READ_LINES, "Number of lines read."),
            &[PATH_LABEL],
        )?;
        let read_bytes = IntCounterVec::new(
            Opts::new(READ_BYTES, "Number of bytes read."),
            &[PATH_LABEL],
        )?;
        let total_bytes = IntGaugeVec::new(
            Opts::new(TOTAL_BYTES, "Number of bytes total."),
            &[PATH_LABEL],
        )?;
        let files_active = IntGauge::new(FILES_ACTIVE, "Number of active files.")?;

        let registry = Registry::new();
        registry.register(Box::new(read_lines.clone()))?;
        registry.register(Box::new(read_bytes.clone()))?;
        registry.register(Box::new(total_bytes.clone()))?;
        registry.register(Box::new(files_active.clone()))?;

        Ok(Self {
            registry,
            read_lines,
            read_bytes,
            total_bytes,
            files_active,
        })
    }

    /// Registry holding every collector.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Lines read from `path` so far.
    #[must_use]
    pub fn lines_read(&self, path: &str) -> u64 {
        self.read_lines.with_label_values(&[path]).get()
    }

    /// Bytes read from `path` so far.
    #[must_use]
    pub fn bytes_read(&self, path: &str) -> u64 {
        self.read_bytes.with_label_values(&[path]).get()
    }

    /// Last size reported for `path`, if a tick has reported one.
    #[must_use]
    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.snapshot().total_bytes.get(path).copied()
    }

    /// Point-in-time copy of every series.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            files_active: self.files_active.get(),
            ..MetricsSnapshot::default()
        };

        for family in self.registry.gather() {
            let series = match family.get_name() {
                READ_LINES => &mut snapshot.read_lines,
                READ_BYTES => &mut snapshot.read_bytes,
                TOTAL_BYTES => &mut snapshot.total_bytes,
                _ => continue,
            };
            for metric in family.get_metric() {
                let Some(path) = metric
                    .get_label()
                    .iter()
                    .find(|label| label.get_name() == PATH_LABEL)
                else {
                    continue;
                };
                let value = match family.get_field_type() {
                    MetricType::COUNTER => metric.get_counter().get_value(),
                    MetricType::GAUGE => metric.get_gauge().get_value(),
                    _ => continue,
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                series.insert(path.get_value().to_string(), value.max(0.0) as u64);
            }
        }

        snapshot
    }

    /// Every series in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Serializable view of [`Metrics`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub read_lines: BTreeMap<String, u64>,
    pub read_bytes: BTreeMap<String, u64>,
    pub total_bytes: BTreeMap<String, u64>,
    pub files_active: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_per_path() {
        let metrics = Metrics::new().unwrap();
        metrics.read_lines.with_label_values(&["/var/log/a.log"]).inc();
        metrics.read_lines.with_label_values(&["/var/log/a.log"]).inc_by(4);
        metrics.read_lines.with_label_values(&["/var/log/b.log"]).inc();

        assert_eq!(metrics.lines_read("/var/log/a.log"), 5);
        assert_eq!(metrics.lines_read("/var/log/b.log"), 1);
        assert_eq!(metrics.lines_read("/var/log/c.log"), 0);
    }

    #[test]
    fn test_file_size_overwrites() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.file_size("/var/log/a.log"), None);
        metrics.total_bytes.with_label_values(&["/var/log/a.log"]).set(100);
        metrics.total_bytes.with_label_values(&["/var/log/a.log"]).set(42);
        assert_eq!(metrics.file_size("/var/log/a.log"), Some(42));
    }

    #[test]
    fn test_files_active_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.files_active.inc();
        metrics.files_active.inc();
        metrics.files_active.dec();
        assert_eq!(metrics.files_active.get(), 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics
                            .read_lines
                            .with_label_values(&["/var/log/shared.log"])
                            .inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.lines_read("/var/log/shared.log"), 8000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new().unwrap();
        metrics.read_bytes.with_label_values(&["/var/log/a.log"]).inc_by(9);
        metrics.files_active.inc();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["read_bytes"]["/var/log/a.log"], 9);
        assert_eq!(json["files_active"], 1);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.read_lines.with_label_values(&["/var/log/a.log"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"log_tailer_read_lines_total{path="/var/log/a.log"} 1"#));
        assert!(text.contains("log_tailer_files_active_total 0"));
    }
}
