//! # Configuration Management Module
//!
//! Holds every run-level setting of the compressor.
//!
//! ## Responsibilities:
//! - Defines `Config` and the per-run `OutputOptions`
//! - Validates parameters before a run starts
//! - Loads/saves the configuration as JSON (default: `~/.media-compressor/config.json`)
//! - Derives the per-kind worker pool sizes from the available CPUs
//!
//! ## Configuration parameters:
//! - `output`: output root, layout, date renaming, target extensions
//! - `image_quality` / `video_quality`: 1-100, mapped per encoder by `EncoderProfile`
//! - `preset`: speed/size trade-off shared by every encoder
//! - `image_concurrency` / `video_concurrency`: pool sizes (None = derived from CPUs)
//! - `video_encoder`: preferred encoder (None = best available)
//! - `ffmpeg_path` / `ffprobe_path` / `exiftool_path`: tool overrides
//!
//! ## Example:
//! ```ignore
//! let config = Config {
//!     image_quality: 85,
//!     video_encoder: Some(EncoderId::Nvenc),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::encoder::{EncoderId, Preset, QualityParams};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Video containers the transcoder knows how to mux into.
const VIDEO_CONTAINERS: &[&str] = &["mp4", "mov", "mkv", "webm"];

/// How output directories are derived from the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Replicate the source directory tree under the output root
    Mirror,
    /// Everything directly in the output root
    Flatten,
    /// One subfolder per capture period
    OrganizeByPeriod,
}

/// Folder granularity for `Layout::OrganizeByPeriod`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Year,
    Month,
}

/// Output layout and naming, fixed for the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputOptions {
    pub output_root: PathBuf,
    pub layout: Layout,
    pub period: Period,
    pub rename_by_date: bool,
    /// Extension every image is normalized to (e.g. "jpg", "webp")
    pub target_image_ext: String,
    /// Container every video is normalized to (e.g. "mp4")
    pub target_video_ext: String,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("compressed"),
            layout: Layout::Mirror,
            period: Period::Month,
            rename_by_date: true,
            target_image_ext: "jpg".to_string(),
            target_video_ext: "mp4".to_string(),
        }
    }
}

/// Configuration for a compression run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputOptions,
    /// Descend into subdirectories of the scan root
    pub recursive: bool,
    /// Image quality (1-100)
    pub image_quality: u8,
    /// Video quality (1-100)
    pub video_quality: u8,
    pub preset: Preset,
    /// Encoder threads (0 = let the encoder decide)
    pub threads: usize,
    pub image_concurrency: Option<usize>,
    pub video_concurrency: Option<usize>,
    /// Preferred video encoder (None = best available)
    pub video_encoder: Option<EncoderId>,
    /// Video audio bitrate
    pub audio_bitrate: String,
    pub image_timeout_secs: u64,
    pub video_timeout_secs: u64,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub exiftool_path: Option<PathBuf>,
    /// Fixed UTC offset for local capture dates (None = host timezone)
    pub utc_offset_minutes: Option<i32>,
    /// Output progress and status as JSON lines for programmatic use
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: OutputOptions::default(),
            recursive: true,
            image_quality: 80,
            video_quality: 70,
            preset: Preset::Balanced,
            threads: 0,
            image_concurrency: None,
            video_concurrency: None,
            video_encoder: None,
            audio_bitrate: "128k".to_string(),
            image_timeout_secs: 120,
            video_timeout_secs: 1800,
            ffmpeg_path: None,
            ffprobe_path: None,
            exiftool_path: None,
            utc_offset_minutes: None,
            json_output: false,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.image_quality == 0 || self.image_quality > 100 {
            return Err(PipelineError::Validation("Image quality must be between 1 and 100".into()));
        }

        if self.video_quality == 0 || self.video_quality > 100 {
            return Err(PipelineError::Validation("Video quality must be between 1 and 100".into()));
        }

        if self.image_concurrency == Some(0) || self.video_concurrency == Some(0) {
            return Err(PipelineError::Validation("Concurrency must be greater than 0".into()));
        }

        if self.image_timeout_secs == 0 || self.video_timeout_secs == 0 {
            return Err(PipelineError::Validation("Timeouts must be greater than 0".into()));
        }

        if let Some(offset) = self.utc_offset_minutes {
            if offset.abs() > 18 * 60 {
                return Err(PipelineError::Validation(format!("UTC offset out of range: {} minutes", offset)));
            }
        }

        if self.output.output_root.as_os_str().is_empty() {
            return Err(PipelineError::Validation("Output root must not be empty".into()));
        }

        let image_ext = self.output.target_image_ext.to_lowercase();
        if image::ImageFormat::from_extension(&image_ext).is_none() {
            return Err(PipelineError::Validation(format!(
                "Unsupported target image format: {}",
                self.output.target_image_ext
            )));
        }

        let video_ext = self.output.target_video_ext.to_lowercase();
        if !VIDEO_CONTAINERS.contains(&video_ext.as_str()) {
            return Err(PipelineError::Validation(format!(
                "Unsupported target video container: {}",
                self.output.target_video_ext
            )));
        }

        Ok(())
    }

    /// Image pool size: all CPUs, clamped to 2..=8
    pub fn image_concurrency(&self) -> usize {
        self.image_concurrency
            .unwrap_or_else(|| num_cpus::get().clamp(2, 8))
    }

    /// Video pool size: a quarter of the CPUs, clamped to 1..=2.
    /// Hardware encoders are a shared resource, so this stays narrow.
    pub fn video_concurrency(&self) -> usize {
        self.video_concurrency
            .unwrap_or_else(|| (num_cpus::get() / 4).clamp(1, 2))
    }

    pub fn image_params(&self) -> QualityParams {
        QualityParams {
            quality: self.image_quality,
            preset: self.preset,
            threads: self.threads,
        }
    }

    pub fn video_params(&self) -> QualityParams {
        QualityParams {
            quality: self.video_quality,
            preset: self.preset,
            threads: self.threads,
        }
    }

    /// Default configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".media-compressor").join("config.json"))
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.image_quality = 0;
        assert!(config.validate().is_err());

        config.image_quality = 80;
        config.video_concurrency = Some(0);
        assert!(config.validate().is_err());

        config.video_concurrency = Some(1);
        config.output.target_image_ext = "xyz".to_string();
        assert!(config.validate().is_err());

        config.output.target_image_ext = "webp".to_string();
        config.output.target_video_ext = "avi".to_string();
        assert!(config.validate().is_err());

        config.output.target_video_ext = "mkv".to_string();
        config.utc_offset_minutes = Some(-20 * 60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.image_quality, 80);
        assert_eq!(config.video_quality, 70);
        assert_eq!(config.audio_bitrate, "128k");
        assert_eq!(config.output.layout, Layout::Mirror);
        assert_eq!(config.output.target_image_ext, "jpg");
        assert_eq!(config.output.target_video_ext, "mp4");
        assert!(config.output.rename_by_date);
        assert!(config.video_encoder.is_none());
    }

    #[test]
    fn test_derived_concurrency_bounds() {
        let config = Config::default();
        assert!((2..=8).contains(&config.image_concurrency()));
        assert!((1..=2).contains(&config.video_concurrency()));

        let config = Config {
            image_concurrency: Some(3),
            video_concurrency: Some(1),
            ..Default::default()
        };
        assert_eq!(config.image_concurrency(), 3);
        assert_eq!(config.video_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let original_config = Config {
            image_quality: 85,
            video_quality: 60,
            audio_bitrate: "192k".to_string(),
            video_encoder: Some(EncoderId::Qsv),
            output: OutputOptions {
                layout: Layout::OrganizeByPeriod,
                period: Period::Year,
                ..Default::default()
            },
            ..Default::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.image_quality, 85);
        assert_eq!(loaded_config.video_quality, 60);
        assert_eq!(loaded_config.audio_bitrate, "192k");
        assert_eq!(loaded_config.video_encoder, Some(EncoderId::Qsv));
        assert_eq!(loaded_config.output.layout, Layout::OrganizeByPeriod);
        assert_eq!(loaded_config.output.period, Period::Year);
    }

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_file(&temp_dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config.image_quality, 80);
    }
}
