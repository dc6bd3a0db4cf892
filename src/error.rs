//! # Error Types Module
//!
//! Defines every error the compression pipeline can surface.
//!
//! ## Propagation policy:
//! - `Scan`, `Validation` and `MissingDependency` are setup errors and abort the run
//! - `Metadata` never leaves the capture-date chain, the next source is tried instead
//! - `EncoderUnavailable` only drives the fallback chain, it is logged and never returned by a run
//! - `Transcode` is per item: the original is copied to the planned path and the item counts as failed
//! - `CollisionExhausted` is per item like `Transcode`, with nothing to copy
//!
//! Cancellation is not an error: a cancelled run still returns its summary.
//!
//! ## Example:
//! ```ignore
//! if !root.is_dir() {
//!     return Err(PipelineError::Scan(format!("not a directory: {}", root.display())));
//! }
//! ```

use std::path::PathBuf;

/// Custom error types for the compression pipeline
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error(transparent)]
    Transcode(#[from] TranscodeFailure),

    #[error("No free output name left for {}", .0.display())]
    CollisionExhausted(PathBuf),

    #[error("Dependency missing: {0}")]
    MissingDependency(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failure reported by a transcode collaborator for a single item.
#[derive(thiserror::Error, Debug, Clone)]
#[error("Transcode failed for {}: {reason}", input.display())]
pub struct TranscodeFailure {
    pub input: PathBuf,
    pub reason: String,
}

impl TranscodeFailure {
    pub fn new(input: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
