//! # Task Optimizer Module
//!
//! The per-item job run inside a worker pool slot.
//!
//! ## Steps:
//! 1. Report the item start
//! 2. Resolve the capture date
//! 3. Plan the output path and create its parent directory
//! 4. Transcode with the kind's timeout
//! 5. Never worse than the original: when the artifact did not shrink and no
//!    format conversion is mandatory, the original bytes replace it
//! 6. Report completion
//!
//! A transcode failure, timeout or panic never drops the file: a partial video
//! is removed first, then the original is copied to the planned path and the
//! item is reported as failed.

use crate::capture_date::{CaptureDateResolver, CaptureInstant};
use crate::config::Config;
use crate::encoder::{EncoderProfile, QualityParams};
use crate::error::TranscodeFailure;
use crate::file_manager::{FileManager, MediaItem, MediaKind};
use crate::optimizer::path_planner::OutputPathPlanner;
use crate::optimizer::worker_pool::panic_message;
use crate::progress::{ItemStats, ProgressSink};
use crate::transcoder::{ProgressCallback, TranscodeRequest, TranscodeStats, Transcoder};
use anyhow::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, warn};

/// A settled item that did not succeed, with what ended up on disk
#[derive(thiserror::Error, Debug)]
#[error("{}: {reason}", path.display())]
pub struct ItemFailure {
    pub path: PathBuf,
    pub original_size: u64,
    /// Bytes written at the destination (the copied original, or 0)
    pub written_size: u64,
    pub reason: String,
}

/// Per-run settings every job shares
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub image_params: QualityParams,
    pub video_params: QualityParams,
    pub audio_bitrate: String,
    pub image_timeout: Duration,
    pub video_timeout: Duration,
}

impl TaskSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_params: config.image_params(),
            video_params: config.video_params(),
            audio_bitrate: config.audio_bitrate.clone(),
            image_timeout: Duration::from_secs(config.image_timeout_secs),
            video_timeout: Duration::from_secs(config.video_timeout_secs),
        }
    }
}

/// Processes single items; cheap to clone into pool tasks
#[derive(Clone)]
pub struct TaskOptimizer {
    resolver: Arc<CaptureDateResolver>,
    planner: Arc<OutputPathPlanner>,
    transcoder: Arc<dyn Transcoder>,
    sink: Arc<dyn ProgressSink>,
    settings: Arc<TaskSettings>,
}

impl TaskOptimizer {
    pub fn new(
        resolver: Arc<CaptureDateResolver>,
        planner: Arc<OutputPathPlanner>,
        transcoder: Arc<dyn Transcoder>,
        sink: Arc<dyn ProgressSink>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            resolver,
            planner,
            transcoder,
            sink,
            settings: Arc::new(settings),
        }
    }

    /// Process one item. `profile` is the negotiated encoder for videos.
    ///
    /// Errors are always `ItemFailure`s.
    pub async fn process(&self, item: MediaItem, profile: Option<EncoderProfile>) -> Result<ItemStats> {
        self.sink.on_item_start(&item);

        let planned = OnceLock::new();
        match AssertUnwindSafe(self.process_planned(&item, profile, &planned)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = format!("panicked: {}", panic_message(&*panic));
                let failure = TranscodeFailure::new(&item.source_path, reason);
                let output = match planned.get() {
                    Some(output) => output.clone(),
                    None => match self.prepare_output(&item, None).await {
                        Ok(output) => output,
                        Err(e) => return Err(self.unplanned_failure(&item, e)),
                    },
                };
                Err(self.fall_back_to_original(&item, &output, failure).await.into())
            }
        }
    }

    /// Steps after the start event; `planned` records the output path once chosen
    async fn process_planned(
        &self,
        item: &MediaItem,
        profile: Option<EncoderProfile>,
        planned: &OnceLock<PathBuf>,
    ) -> Result<ItemStats> {
        let capture = self.resolver.resolve(item).await;
        let output = match self.prepare_output(item, capture.as_ref()).await {
            Ok(output) => output,
            Err(e) => return Err(self.unplanned_failure(item, e)),
        };
        let _ = planned.set(output.clone());

        let (params, timeout) = match item.kind {
            MediaKind::Image => (self.settings.image_params, self.settings.image_timeout),
            MediaKind::Video => (self.settings.video_params, self.settings.video_timeout),
        };
        let request = TranscodeRequest {
            input: item.source_path.clone(),
            output: output.clone(),
            kind: item.kind,
            profile: profile.filter(|_| item.kind == MediaKind::Video),
            params,
            audio_bitrate: self.settings.audio_bitrate.clone(),
            progress: Some(self.progress_callback(item)),
        };

        let result = match tokio::time::timeout(timeout, self.transcoder.transcode(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TranscodeFailure::new(
                &item.source_path,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        };

        match result {
            Ok(stats) => self.finish(item, &output, capture, request.profile, stats).await,
            Err(failure) => Err(self.fall_back_to_original(item, &output, failure).await.into()),
        }
    }

    /// No destination, so nothing can be copied
    fn unplanned_failure(&self, item: &MediaItem, e: crate::error::PipelineError) -> anyhow::Error {
        let message = format!("Cannot plan output: {}", e);
        error!("{}: {}", item.source_path.display(), message);
        self.sink.on_item_error(item, &message);
        ItemFailure {
            path: item.source_path.clone(),
            original_size: item.size_bytes,
            written_size: 0,
            reason: message,
        }
        .into()
    }

    async fn prepare_output(&self, item: &MediaItem, capture: Option<&CaptureInstant>) -> crate::error::Result<PathBuf> {
        let output = self.planner.plan(item, capture).await?;
        OutputPathPlanner::ensure_parent_dirs(&output).await?;
        Ok(output)
    }

    fn progress_callback(&self, item: &MediaItem) -> ProgressCallback {
        let sink = self.sink.clone();
        let item = item.clone();
        Arc::new(move |percent| sink.on_item_progress(&item, percent))
    }

    async fn finish(
        &self,
        item: &MediaItem,
        output: &Path,
        capture: Option<CaptureInstant>,
        profile: Option<EncoderProfile>,
        stats: TranscodeStats,
    ) -> Result<ItemStats> {
        let target_ext = self.planner.target_extension(item.kind);
        let mandatory = FileManager::requires_conversion(&item.source_path, target_ext);
        let kept_original = stats.compressed_size >= stats.original_size && !mandatory;

        let compressed_size = if kept_original {
            debug!(
                "No reduction for {} ({} -> {}), keeping original bytes",
                item.source_path.display(),
                stats.original_size,
                stats.compressed_size
            );
            if let Err(e) = fs::copy(&item.source_path, output).await {
                let failure = TranscodeFailure::new(&item.source_path, format!("Cannot keep original: {}", e));
                return Err(self.fall_back_to_original(item, output, failure).await.into());
            }
            stats.original_size
        } else {
            stats.compressed_size
        };

        let item_stats = ItemStats {
            source: item.source_path.clone(),
            output: output.to_path_buf(),
            kind: item.kind,
            original_size: stats.original_size,
            compressed_size,
            kept_original,
            capture_source: capture.map(|c| c.source),
            encoder: profile.map(|p| p.id),
        };
        self.sink.on_item_complete(&item_stats);
        Ok(item_stats)
    }

    /// Put the original where the artifact should have been
    async fn fall_back_to_original(&self, item: &MediaItem, output: &Path, failure: TranscodeFailure) -> ItemFailure {
        error!("{}", failure);

        if item.kind == MediaKind::Video && fs::try_exists(output).await.unwrap_or(false) {
            debug!("Removing partial output {}", output.display());
            if let Err(e) = fs::remove_file(output).await {
                warn!("Could not remove partial output {}: {}", output.display(), e);
            }
        }

        let written_size = match fs::copy(&item.source_path, output).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not copy original {} to {}: {}", item.source_path.display(), output.display(), e);
                0
            }
        };

        self.sink.on_item_error(item, &failure.reason);
        ItemFailure {
            path: item.source_path.clone(),
            original_size: item.size_bytes,
            written_size,
            reason: failure.reason,
        }
    }
}
