//! # Compression Orchestrator
//!
//! Composes scanning, capture dates, path planning, encoder negotiation and the
//! transcoder into one run.
//!
//! ## Run phases:
//! 1. Validate configuration and scan the root (setup errors abort here)
//! 2. Skip anything already inside the output root
//! 3. Images through a wide worker pool
//! 4. Negotiate the video encoder once, then videos through a narrow pool
//! 5. Summary: counts, byte totals, elapsed time, savings ratio
//!
//! Images finish before videos start. Video encoders are a shared hardware
//! resource and use far more memory, so the video pool stays small.
//!
//! Every per-item error is isolated inside its task; only setup errors make
//! `run` return `Err`.

use crate::capture_date::{CaptureDateResolver, UtcOffsetSource};
use crate::config::Config;
use crate::encoder::{EncoderId, EncoderNegotiator, EncoderProfile, FfmpegProbe};
use crate::error::Result;
use crate::file_manager::{FileManager, KindFilter, MediaItem, MediaKind};
use crate::metadata::{MetadataReader, ToolMetadataReader};
use crate::optimizer::path_planner::OutputPathPlanner;
use crate::optimizer::run_state::RunState;
use crate::optimizer::task_optimizer::{ItemFailure, TaskOptimizer, TaskSettings};
use crate::optimizer::worker_pool::WorkerPool;
use crate::progress::{ProgressSink, SummaryReport};
use crate::tool_resolver::{ToolResolver, EXIFTOOL, FFMPEG, FFPROBE};
use crate::transcoder::{FfmpegTranscoder, Transcoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives a whole compression run
pub struct CompressionOrchestrator {
    config: Config,
    transcoder: Arc<dyn Transcoder>,
    metadata: Arc<dyn MetadataReader>,
    negotiator: Arc<EncoderNegotiator>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl CompressionOrchestrator {
    pub fn new(
        config: Config,
        transcoder: Arc<dyn Transcoder>,
        metadata: Arc<dyn MetadataReader>,
        negotiator: Arc<EncoderNegotiator>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            transcoder,
            metadata,
            negotiator,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Orchestrator backed by the external tools (`ffmpeg`, `ffprobe`, `exiftool`)
    pub fn with_tools(config: Config, sink: Arc<dyn ProgressSink>) -> Result<Self> {
        let tools = ToolResolver::from_config(&config);
        Self::check_dependencies(&tools)?;

        let metadata: Arc<dyn MetadataReader> = Arc::new(ToolMetadataReader::new(tools.clone()));
        let transcoder = Arc::new(FfmpegTranscoder::new(tools.clone(), metadata.clone()));
        let negotiator = Arc::new(EncoderNegotiator::new(Arc::new(FfmpegProbe::new(tools.command(FFMPEG)))));

        Ok(Self::new(config, transcoder, metadata, negotiator, sink))
    }

    /// `ffmpeg` and `ffprobe` are required; `exiftool` only improves image dates
    fn check_dependencies(tools: &ToolResolver) -> Result<()> {
        tools.require(FFMPEG)?;
        tools.require(FFPROBE)?;
        if tools.resolve(EXIFTOOL).is_none() {
            warn!("exiftool not found, image capture dates fall back to sidecars and file times");
        }
        Ok(())
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C)
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn negotiator(&self) -> &Arc<EncoderNegotiator> {
        &self.negotiator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scan `scan_root` and compress everything found
    pub async fn run(&self, scan_root: &Path) -> Result<SummaryReport> {
        self.config.validate()?;

        let mut items = FileManager::scan(scan_root, self.config.recursive, KindFilter::All)?;
        let output_root = canonical_or_self(&self.config.output.output_root);
        let before = items.len();
        items.retain(|item| !canonical_or_self(&item.source_path).starts_with(&output_root));
        if items.len() < before {
            debug!("Skipped {} files already inside the output root", before - items.len());
        }

        info!("Found {} media files in {}", items.len(), scan_root.display());
        self.run_batch(scan_root, items).await
    }

    /// Compress `items`; paths are mirrored relative to `scan_root`
    pub async fn run_batch(&self, scan_root: &Path, items: Vec<MediaItem>) -> Result<SummaryReport> {
        self.config.validate()?;
        tokio::fs::create_dir_all(&self.config.output.output_root).await?;

        let (images, videos): (Vec<MediaItem>, Vec<MediaItem>) =
            items.into_iter().partition(|item| item.kind == MediaKind::Image);
        self.log_configuration(images.len(), videos.len());
        self.sink.on_run_start(images.len(), videos.len());

        let state = Arc::new(RunState::new(images.len() + videos.len(), self.cancel.clone()));
        let offset = match self.config.utc_offset_minutes {
            Some(minutes) => UtcOffsetSource::Fixed(minutes),
            None => UtcOffsetSource::Local,
        };
        let planner = Arc::new(OutputPathPlanner::new(scan_root, self.config.output.clone()));
        let task = TaskOptimizer::new(
            Arc::new(CaptureDateResolver::new(self.metadata.clone(), offset)),
            planner.clone(),
            self.transcoder.clone(),
            self.sink.clone(),
            TaskSettings::from_config(&self.config),
        );

        if !images.is_empty() {
            self.run_phase(images, None, self.config.image_concurrency(), &task, &state)
                .await;
        }

        if !videos.is_empty() && !state.is_cancel_requested() {
            let profile = self.negotiate_encoder().await;
            info!("Video encoder: {}", profile.display_name);
            self.run_phase(videos, Some(profile), self.config.video_concurrency(), &task, &state)
                .await;
        }

        debug!("Planned {} output paths", planner.reserved_count().await);
        let summary = state.summary();
        if summary.cancelled {
            warn!("Run cancelled after {}/{} files", summary.processed, summary.total);
        }
        info!("{}", summary.format_summary());
        self.sink.on_run_complete(&summary);
        Ok(summary)
    }

    async fn negotiate_encoder(&self) -> EncoderProfile {
        match self.config.video_encoder {
            Some(requested) => self.negotiator.negotiate(requested).await,
            None => self.negotiator.negotiate_best().await,
        }
    }

    async fn run_phase(
        &self,
        items: Vec<MediaItem>,
        profile: Option<EncoderProfile>,
        concurrency: usize,
        task: &TaskOptimizer,
        state: &Arc<RunState>,
    ) {
        let kind = items.first().map(|item| item.kind);
        let sizes: Vec<u64> = items.iter().map(|item| item.size_bytes).collect();
        let jobs: Vec<_> = items
            .into_iter()
            .map(|item| {
                let task = task.clone();
                let profile = profile.clone();
                move || async move { task.process(item, profile).await }
            })
            .collect();

        debug!("Starting {:?} phase: {} files, {} workers", kind, jobs.len(), concurrency);
        let pool = WorkerPool::new(concurrency);
        let report = pool
            .run(jobs, state.cancel_token(), |_, outcome| {
                let processed = match &outcome.result {
                    Ok(stats) => state.record_success(stats.original_size, stats.compressed_size),
                    Err(e) => match e.downcast_ref::<ItemFailure>() {
                        Some(failure) => state.record_failure(failure.original_size, failure.written_size),
                        // Only reachable if the fallback copy itself panicked
                        None => {
                            error!("Task {} failed unexpectedly: {}", outcome.index, e);
                            state.record_failure(sizes.get(outcome.index).copied().unwrap_or(0), 0)
                        }
                    },
                };
                self.sink.on_overall_progress(processed, state.total());
            })
            .await;

        debug!(
            "{:?} phase finished: {} launched, {} failed{}",
            kind,
            report.launched,
            report.failures(),
            if report.cancelled { ", cancelled" } else { "" }
        );
    }

    fn log_configuration(&self, images: usize, videos: usize) {
        if self.config.json_output {
            return;
        }
        let output = &self.config.output;
        info!("Output root: {} ({:?} layout)", output.output_root.display(), output.layout);
        info!(
            "Images: {} files -> .{} (quality {}, {} workers)",
            images,
            output.target_image_ext,
            self.config.image_quality,
            self.config.image_concurrency()
        );
        info!(
            "Videos: {} files -> .{} (quality {}, {} workers, encoder {})",
            videos,
            output.target_video_ext,
            self.config.video_quality,
            self.config.video_concurrency(),
            self.config
                .video_encoder
                .map(EncoderId::display_name)
                .unwrap_or("best available")
        );
        if output.rename_by_date {
            info!("Renaming files by capture date");
        }
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
