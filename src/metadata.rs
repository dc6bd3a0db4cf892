//! # Metadata Extraction Module
//!
//! Boundary to the metadata-extraction collaborators used by the capture-date
//! chain. The pipeline only needs a handful of fields, so readers return a small
//! `MetadataFields` record instead of the tools' full output.
//!
//! ## Default implementation:
//! - Embedded image metadata via `exiftool -json`
//! - Container metadata via `ffprobe -print_format json -show_format -show_streams`
//!
//! Both return `Ok(None)` when the file carries no usable block and
//! `Err(PipelineError::Metadata)` when the tool cannot be run or its output
//! cannot be parsed. Callers treat both the same way: fall through to the next
//! source.

use crate::error::{PipelineError, Result};
use crate::tool_resolver::{ToolResolver, EXIFTOOL, FFPROBE};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// The metadata fields the pipeline consumes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFields {
    /// EXIF `DateTimeOriginal`, e.g. `2021:03:13 14:32:11`
    pub date_time_original: Option<String>,
    /// EXIF `OffsetTimeOriginal`, e.g. `+01:00`
    pub offset_time_original: Option<String>,
    /// Container `creation_time`, e.g. `2021-01-13T13:12:11.000000Z`
    pub creation_time: Option<String>,
    /// Container duration in seconds
    pub duration_secs: Option<f64>,
}

/// Metadata-extraction collaborator
#[async_trait]
pub trait MetadataReader: Send + Sync {
    /// Embedded metadata of an image file
    async fn read_embedded(&self, path: &Path) -> Result<Option<MetadataFields>>;

    /// Container/stream metadata of a video file
    async fn read_container(&self, path: &Path) -> Result<Option<MetadataFields>>;
}

/// Reads metadata with `exiftool` and `ffprobe`
pub struct ToolMetadataReader {
    tools: ToolResolver,
}

impl ToolMetadataReader {
    pub fn new(tools: ToolResolver) -> Self {
        Self { tools }
    }

    async fn run_json(&self, tool: &str, args: &[&str], path: &Path) -> Result<serde_json::Value> {
        let command = self.tools.command(tool);
        let output = Command::new(&command)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Metadata(format!("Failed to execute {}: {}", tool, e)))?;

        if !output.status.success() {
            return Err(PipelineError::Metadata(format!(
                "{} failed for {}: {}",
                tool,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Metadata(format!("Invalid {} output: {}", tool, e)))
    }
}

#[async_trait]
impl MetadataReader for ToolMetadataReader {
    async fn read_embedded(&self, path: &Path) -> Result<Option<MetadataFields>> {
        let value = self
            .run_json(
                EXIFTOOL,
                &["-json", "-DateTimeOriginal", "-OffsetTimeOriginal", "-CreateDate"],
                path,
            )
            .await?;
        debug!("exiftool output for {}: {}", path.display(), value);
        Ok(parse_exiftool_json(&value))
    }

    async fn read_container(&self, path: &Path) -> Result<Option<MetadataFields>> {
        let value = self
            .run_json(
                FFPROBE,
                &["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"],
                path,
            )
            .await?;
        Ok(parse_ffprobe_json(&value))
    }
}

/// Extract the capture fields from `exiftool -json` output (an array with one object)
pub fn parse_exiftool_json(value: &serde_json::Value) -> Option<MetadataFields> {
    let entry = value.as_array()?.first()?;
    let date_time_original = entry["DateTimeOriginal"]
        .as_str()
        .or_else(|| entry["CreateDate"].as_str())
        .map(str::to_string);
    let offset_time_original = entry["OffsetTimeOriginal"].as_str().map(str::to_string);

    if date_time_original.is_none() {
        return None;
    }
    Some(MetadataFields {
        date_time_original,
        offset_time_original,
        ..Default::default()
    })
}

/// Extract the capture fields from `ffprobe` JSON output
pub fn parse_ffprobe_json(value: &serde_json::Value) -> Option<MetadataFields> {
    let format = &value["format"];
    let duration_secs = format["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok());

    let creation_time = format["tags"]["creation_time"]
        .as_str()
        .map(str::to_string)
        .or_else(|| {
            value["streams"]
                .as_array()?
                .iter()
                .find_map(|s| s["tags"]["creation_time"].as_str().map(str::to_string))
        });

    if creation_time.is_none() && duration_secs.is_none() {
        return None;
    }

    Some(MetadataFields {
        creation_time,
        duration_secs,
        ..Default::default()
    })
}
