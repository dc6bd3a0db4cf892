//! # JSON Output Module
//!
//! Streaming notifier: every progress event becomes one JSON object on stdout.
//!
//! ## Responsibilities:
//! - Emits structured JSON lines for progress events
//! - Implements `ProgressSink`, so the orchestrator drives it exactly like the
//!   terminal renderer
//! - Gives a GUI or network bridge a stable, line-delimited event stream
//!
//! ## Message types:
//! - `start`: Run started, with per-kind totals
//! - `file_start`: A file is being processed
//! - `file_progress`: Percent progress for the current file (5% steps)
//! - `file_complete`: A file finished with its byte counts
//! - `file_error`: A file failed, the original was copied instead
//! - `progress`: Settled vs total files
//! - `complete`: Final summary
//! - `error`: Run-level error (e.g. invalid scan root)

use crate::capture_date::CaptureSource;
use crate::encoder::EncoderId;
use crate::file_manager::MediaItem;
use crate::progress::{ItemStats, ProgressSink, SummaryReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Minimum percent change between two `file_progress` messages for one file
const PROGRESS_STEP: u32 = 5;

/// JSON message type
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum JsonMessage {
    #[serde(rename = "start")]
    Start {
        total_files: usize,
        images: usize,
        videos: usize,
    },

    #[serde(rename = "file_start")]
    FileStart { path: PathBuf, size: u64 },

    #[serde(rename = "file_progress")]
    FileProgress { path: PathBuf, percent: f32 },

    #[serde(rename = "file_complete")]
    FileComplete {
        path: PathBuf,
        output: PathBuf,
        original_size: u64,
        compressed_size: u64,
        reduction_percent: f64,
        kept_original: bool,
        capture_source: Option<CaptureSource>,
        encoder: Option<String>,
    },

    #[serde(rename = "file_error")]
    FileError { path: PathBuf, message: String },

    #[serde(rename = "progress")]
    Progress {
        current: usize,
        total: usize,
        percentage: f64,
    },

    #[serde(rename = "complete")]
    Complete {
        total_files: usize,
        files_processed: usize,
        succeeded: usize,
        failed: usize,
        total_original_bytes: u64,
        total_compressed_bytes: u64,
        bytes_saved: u64,
        savings_ratio: f64,
        duration_seconds: f64,
        cancelled: bool,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        details: Option<String>,
    },
}

impl JsonMessage {
    /// Emit the message as one line on stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn progress(current: usize, total: usize) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Self::Progress {
            current,
            total,
            percentage,
        }
    }

    pub fn file_complete(stats: &ItemStats) -> Self {
        Self::FileComplete {
            path: stats.source.clone(),
            output: stats.output.clone(),
            original_size: stats.original_size,
            compressed_size: stats.compressed_size,
            reduction_percent: stats.reduction_percent(),
            kept_original: stats.kept_original,
            capture_source: stats.capture_source,
            encoder: stats.encoder.map(EncoderId::codec_id).map(str::to_string),
        }
    }

    pub fn complete(summary: &SummaryReport) -> Self {
        Self::Complete {
            total_files: summary.total,
            files_processed: summary.processed,
            succeeded: summary.succeeded,
            failed: summary.failed,
            total_original_bytes: summary.total_original_bytes,
            total_compressed_bytes: summary.total_compressed_bytes,
            bytes_saved: summary.bytes_saved(),
            savings_ratio: summary.savings_ratio(),
            duration_seconds: summary.elapsed.as_secs_f64(),
            cancelled: summary.cancelled,
        }
    }

    pub fn error(message: String, details: Option<String>) -> Self {
        Self::Error { message, details }
    }
}

/// `ProgressSink` writing JSON lines to stdout
#[derive(Default)]
pub struct JsonProgress {
    last_percent: Mutex<HashMap<PathBuf, u32>>,
}

impl JsonProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `percent` moved at least one step past the last emitted value
    fn should_emit(&self, path: &Path, percent: f32) -> bool {
        let step = percent.clamp(0.0, 100.0) as u32 / PROGRESS_STEP;
        let Ok(mut last) = self.last_percent.lock() else {
            return true;
        };
        match last.get(path) {
            Some(previous) if *previous >= step => false,
            _ => {
                last.insert(path.to_path_buf(), step);
                true
            }
        }
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut last) = self.last_percent.lock() {
            last.remove(path);
        }
    }
}

impl ProgressSink for JsonProgress {
    fn on_run_start(&self, images: usize, videos: usize) {
        JsonMessage::Start {
            total_files: images + videos,
            images,
            videos,
        }
        .emit();
    }

    fn on_item_start(&self, item: &MediaItem) {
        JsonMessage::FileStart {
            path: item.source_path.clone(),
            size: item.size_bytes,
        }
        .emit();
    }

    fn on_item_progress(&self, item: &MediaItem, percent: f32) {
        if self.should_emit(&item.source_path, percent) {
            JsonMessage::FileProgress {
                path: item.source_path.clone(),
                percent,
            }
            .emit();
        }
    }

    fn on_item_complete(&self, stats: &ItemStats) {
        self.forget(&stats.source);
        JsonMessage::file_complete(stats).emit();
    }

    fn on_item_error(&self, item: &MediaItem, message: &str) {
        self.forget(&item.source_path);
        JsonMessage::FileError {
            path: item.source_path.clone(),
            message: message.to_string(),
        }
        .emit();
    }

    fn on_overall_progress(&self, processed: usize, total: usize) {
        JsonMessage::progress(processed, total).emit();
    }

    fn on_run_complete(&self, summary: &SummaryReport) {
        JsonMessage::complete(summary).emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::MediaKind;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_messages_are_tagged() {
        let value = serde_json::to_value(JsonMessage::progress(3, 4)).unwrap();
        assert_eq!(value, json!({ "type": "progress", "current": 3, "total": 4, "percentage": 75.0 }));

        let summary = SummaryReport {
            total: 2,
            processed: 2,
            succeeded: 1,
            failed: 1,
            total_original_bytes: 200,
            total_compressed_bytes: 150,
            elapsed: Duration::from_millis(1500),
            cancelled: false,
        };
        let value = serde_json::to_value(JsonMessage::complete(&summary)).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["bytes_saved"], 50);
        assert_eq!(value["duration_seconds"], 1.5);
    }

    #[test]
    fn test_file_complete_carries_provenance() {
        let stats = ItemStats {
            source: PathBuf::from("/in/IMG_1.HEIC"),
            output: PathBuf::from("/out/20210313-143211.jpg"),
            kind: MediaKind::Image,
            original_size: 100,
            compressed_size: 40,
            kept_original: false,
            capture_source: Some(CaptureSource::Sidecar),
            encoder: None,
        };
        let message = JsonMessage::file_complete(&stats);
        let line = serde_json::to_string(&message).unwrap();
        let parsed: JsonMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, message);

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "file_complete");
        assert_eq!(value["capture_source"], "sidecar");
        assert_eq!(value["reduction_percent"], 60.0);
    }

    #[test]
    fn test_progress_is_throttled_per_file() {
        let sink = JsonProgress::new();
        let a = PathBuf::from("a.mp4");
        let b = PathBuf::from("b.mp4");

        assert!(sink.should_emit(&a, 0.0));
        assert!(!sink.should_emit(&a, 3.0));
        assert!(sink.should_emit(&a, 5.5));
        assert!(sink.should_emit(&b, 1.0));
        assert!(!sink.should_emit(&a, 9.9));

        sink.forget(&a);
        assert!(sink.should_emit(&a, 0.0));
    }
}
