//! # Media Compressor Library
//!
//! Batch compression of photo and video collections: files are renamed by
//! capture time, normalized to one image format and one video container, and
//! handed to `ffmpeg` with bounded concurrency.
//!
//! ## Module layout:
//! - `config`: Run configuration and validation
//! - `error`: Pipeline error types
//! - `file_manager`: Media discovery and classification
//! - `metadata`: Embedded/container metadata collaborators
//! - `capture_date`: Capture-date resolution chain
//! - `encoder`: Hardware encoder detection and fallback
//! - `transcoder`: Codec invocation collaborator
//! - `optimizer`: Worker pool, path planning and orchestration
//! - `progress` / `json_output`: Progress sinks and the final summary
//! - `tool_resolver`: Locating external tools
//!
//! ## Usage:
//! ```ignore
//! use media_compressor::{CompressionOrchestrator, Config, ProgressManager};
//!
//! let orchestrator = CompressionOrchestrator::with_tools(Config::default(), Arc::new(ProgressManager::new()))?;
//! let summary = orchestrator.run(&path).await?;
//! println!("{}", summary.format_summary());
//! ```

pub mod capture_date;
pub mod config;
pub mod encoder;
pub mod error;
pub mod file_manager;
pub mod json_output;
pub mod metadata;
pub mod optimizer;
pub mod progress;
pub mod tool_resolver;
pub mod transcoder;

pub use capture_date::{CaptureDateResolver, CaptureInstant, CaptureSource, LocalDateTime};
pub use config::{Config, Layout, OutputOptions, Period};
pub use encoder::{EncoderId, EncoderNegotiator, EncoderProfile};
pub use error::{PipelineError, TranscodeFailure};
pub use file_manager::{FileManager, MediaItem, MediaKind};
pub use json_output::JsonProgress;
pub use optimizer::{CompressionOrchestrator, OutputPathPlanner, WorkerPool};
pub use progress::{ProgressManager, ProgressSink, SummaryReport};
