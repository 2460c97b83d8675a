//! Log Tailer - resumable log file tailing with offset checkpoints.

pub mod api;
pub mod config;
pub mod metrics;
pub mod positions;
pub mod tail;
