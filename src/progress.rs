//! # Progress Reporting and Summary Module
//!
//! Progress events and the end-of-run summary.
//!
//! ## Responsibilities:
//! - `ProgressSink`: the event contract the orchestrator reports through
//! - `ProgressManager`: textual renderer with an `indicatif` bar
//! - `SummaryReport`: aggregate counts, byte totals, elapsed time, savings ratio
//!
//! ## Events:
//! - **run start**: item totals per kind
//! - **item start / progress / complete / error**: one item's lifecycle
//! - **overall progress**: settled vs total, after every settled item
//! - **run complete**: the final summary, also emitted for cancelled runs
//!
//! The same events feed the JSON streaming notifier in `json_output`.
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================================] 150/150 (100%) ✅ IMG_0001.HEIC: 45.2% saved
//! ```

use crate::capture_date::CaptureSource;
use crate::encoder::EncoderId;
use crate::file_manager::{FileManager, MediaItem, MediaKind};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Result of one successfully settled item
#[derive(Debug, Clone, Serialize)]
pub struct ItemStats {
    pub source: PathBuf,
    pub output: PathBuf,
    pub kind: MediaKind,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Original bytes were written instead of the transcoded artifact
    pub kept_original: bool,
    pub capture_source: Option<CaptureSource>,
    pub encoder: Option<EncoderId>,
}

impl ItemStats {
    pub fn reduction_percent(&self) -> f64 {
        FileManager::calculate_reduction(self.original_size, self.compressed_size)
    }
}

/// Final report of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryReport {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl SummaryReport {
    pub fn bytes_saved(&self) -> u64 {
        self.total_original_bytes.saturating_sub(self.total_compressed_bytes)
    }

    /// Saved bytes over original bytes (0.0 - 1.0)
    pub fn savings_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            0.0
        } else {
            self.bytes_saved() as f64 / self.total_original_bytes as f64
        }
    }

    pub fn format_summary(&self) -> String {
        let mut summary = format!(
            "Processed: {}/{} files | Succeeded: {} | Failed: {} | {} -> {} | Saved: {} ({:.2}%) in {:.1}s",
            self.processed,
            self.total,
            self.succeeded,
            self.failed,
            FileManager::format_size(self.total_original_bytes),
            FileManager::format_size(self.total_compressed_bytes),
            FileManager::format_size(self.bytes_saved()),
            self.savings_ratio() * 100.0,
            self.elapsed.as_secs_f64()
        );
        if self.cancelled {
            summary.push_str(" | Cancelled");
        }
        summary
    }
}

/// Receiver of pipeline progress events. Every method defaults to a no-op.
pub trait ProgressSink: Send + Sync {
    fn on_run_start(&self, _images: usize, _videos: usize) {}

    fn on_item_start(&self, _item: &MediaItem) {}

    fn on_item_progress(&self, _item: &MediaItem, _percent: f32) {}

    fn on_item_complete(&self, _stats: &ItemStats) {}

    fn on_item_error(&self, _item: &MediaItem, _message: &str) {}

    fn on_overall_progress(&self, _processed: usize, _total: usize) {}

    fn on_run_complete(&self, _summary: &SummaryReport) {}
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {}

/// Manages the terminal progress bar
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Create a spinner for indeterminate work (encoder detection)
    pub fn spinner(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();

        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));

        spinner
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressManager {
    fn on_run_start(&self, images: usize, videos: usize) {
        self.bar.set_length((images + videos) as u64);
        self.bar.set_message(format!("{} images, {} videos", images, videos));
    }

    fn on_item_start(&self, item: &MediaItem) {
        self.bar.set_message(item.file_name());
    }

    fn on_item_progress(&self, item: &MediaItem, percent: f32) {
        self.bar.set_message(format!("{} {:.0}%", item.file_name(), percent));
    }

    fn on_item_complete(&self, stats: &ItemStats) {
        let name = stats.source.file_name().unwrap_or_default().to_string_lossy();
        if stats.kept_original {
            self.bar.set_message(format!("✅ {}: original kept", name));
        } else {
            self.bar.set_message(format!("✅ {}: {:.1}% saved", name, stats.reduction_percent()));
        }
    }

    fn on_item_error(&self, item: &MediaItem, message: &str) {
        self.bar.println(format!("❌ {}: {}", item.file_name(), message));
    }

    fn on_overall_progress(&self, processed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(processed as u64);
    }

    fn on_run_complete(&self, summary: &SummaryReport) {
        self.bar.finish_with_message(summary.format_summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_savings() {
        let summary = SummaryReport {
            total: 7,
            processed: 7,
            succeeded: 6,
            failed: 1,
            total_original_bytes: 1000,
            total_compressed_bytes: 250,
            elapsed: Duration::from_secs(3),
            cancelled: false,
        };
        assert_eq!(summary.bytes_saved(), 750);
        assert!((summary.savings_ratio() - 0.75).abs() < f64::EPSILON);

        let text = summary.format_summary();
        assert!(text.contains("Processed: 7/7"));
        assert!(text.contains("Failed: 1"));
        assert!(!text.contains("Cancelled"));
    }

    #[test]
    fn test_summary_never_reports_negative_savings() {
        let summary = SummaryReport {
            total_original_bytes: 100,
            total_compressed_bytes: 120,
            cancelled: true,
            ..Default::default()
        };
        assert_eq!(summary.bytes_saved(), 0);
        assert_eq!(summary.savings_ratio(), 0.0);
        assert!(summary.format_summary().ends_with("Cancelled"));

        assert_eq!(SummaryReport::default().savings_ratio(), 0.0);
    }
}
