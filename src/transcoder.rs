//! # Transcoding Module
//!
//! Boundary to the codec that actually shrinks files.
//!
//! ## Responsibilities:
//! - Defines the `Transcoder` collaborator contract used by the orchestrator
//! - Default implementation drives an `ffmpeg` child process
//! - Reports per-item percent progress parsed from `-progress pipe:1`
//!
//! ## Image pipeline:
//! The target extension picks the codec:
//! - **jpg/jpeg**: MJPEG, `-q:v` 2 (best) - 31
//! - **webp**: libwebp, `-quality` 1-100
//! - **avif**: libaom still picture, CRF 0-63
//! - **png**: maximum zlib compression (lossless, quality ignored)
//!
//! ## Video pipeline:
//! - Video: the negotiated encoder profile plus its tuning flags
//! - Audio: AAC at the configured bitrate
//! - Metadata copied with `-map_metadata 0`
//! - MP4/MOV outputs get `+faststart` so they stream before fully downloaded
//!
//! The transcoder never decides whether its result is kept; the never-worse
//! policy lives in the orchestrator.

use crate::encoder::{EncoderId, EncoderProfile, QualityParams};
use crate::error::TranscodeFailure;
use crate::file_manager::MediaKind;
use crate::metadata::MetadataReader;
use crate::tool_resolver::{ToolResolver, FFMPEG};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Percent (0-100) callback for a single item
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// One transcode invocation
#[derive(Clone)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub kind: MediaKind,
    /// Negotiated video encoder; ignored for images
    pub profile: Option<EncoderProfile>,
    pub params: QualityParams,
    pub audio_bitrate: String,
    pub progress: Option<ProgressCallback>,
}

impl TranscodeRequest {
    fn report(&self, percent: f32) {
        if let Some(progress) = &self.progress {
            progress(percent);
        }
    }
}

/// Sizes before and after a successful transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeStats {
    pub original_size: u64,
    pub compressed_size: u64,
}

/// Codec invocation collaborator
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write a transcoded version of `request.input` to `request.output`
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeStats, TranscodeFailure>;
}

/// Transcodes with an `ffmpeg` child process
pub struct FfmpegTranscoder {
    tools: ToolResolver,
    metadata: Arc<dyn MetadataReader>,
}

impl FfmpegTranscoder {
    /// `metadata` supplies the container duration used to turn ffmpeg's
    /// elapsed output time into a percentage
    pub fn new(tools: ToolResolver, metadata: Arc<dyn MetadataReader>) -> Self {
        Self { tools, metadata }
    }

    async fn duration_secs(&self, path: &Path) -> Option<f64> {
        match self.metadata.read_container(path).await {
            Ok(Some(fields)) => fields.duration_secs.filter(|d| *d > 0.0),
            Ok(None) => None,
            Err(e) => {
                debug!("No duration for {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn run_ffmpeg(
        &self,
        request: &TranscodeRequest,
        args: Vec<OsString>,
        duration: Option<f64>,
    ) -> Result<(), TranscodeFailure> {
        let ffmpeg = self.tools.command(FFMPEG);
        debug!("Running {} {:?}", ffmpeg.display(), args);

        let mut child = Command::new(&ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeFailure::new(&request.input, format!("Failed to execute {}: {}", ffmpeg.display(), e)))?;

        // Drained concurrently so a chatty ffmpeg never blocks on a full pipe
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = duration.and_then(|total| parse_progress_line(&line, total)) {
                    request.report(percent);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| TranscodeFailure::new(&request.input, format!("ffmpeg did not finish: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let reason = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
            return Err(TranscodeFailure::new(
                &request.input,
                format!("ffmpeg exited with {}: {}", status, reason),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeStats, TranscodeFailure> {
        let original_size = fs::metadata(&request.input)
            .await
            .map_err(|e| TranscodeFailure::new(&request.input, format!("Cannot read source: {}", e)))?
            .len();

        let (args, duration) = match request.kind {
            MediaKind::Image => (build_image_args(request), None),
            MediaKind::Video => (build_video_args(request), self.duration_secs(&request.input).await),
        };

        self.run_ffmpeg(request, args, duration).await?;

        let compressed_size = match fs::metadata(&request.output).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!("ffmpeg reported success but produced no output for {}", request.input.display());
                return Err(TranscodeFailure::new(&request.input, format!("No output written: {}", e)));
            }
        };
        request.report(100.0);

        Ok(TranscodeStats {
            original_size,
            compressed_size,
        })
    }
}

fn common_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());
    args.extend(["-map_metadata", "0"].iter().map(OsString::from));
    args
}

fn output_ext(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Codec flags for an image written with extension `ext`
pub fn image_codec_flags(ext: &str, quality: u8) -> Vec<String> {
    let quality = u32::from(quality.clamp(1, 100));
    match ext {
        "jpg" | "jpeg" => {
            let qscale = 2 + (100 - quality) * 29 / 100;
            vec!["-q:v".into(), qscale.to_string()]
        }
        "webp" => vec!["-c:v".into(), "libwebp".into(), "-quality".into(), quality.to_string()],
        "avif" => {
            let crf = (100 - quality) * 63 / 100;
            vec!["-c:v".into(), "libaom-av1".into(), "-crf".into(), crf.to_string(), "-still-picture".into(), "1".into()]
        }
        "png" => vec!["-compression_level".into(), "9".into()],
        _ => Vec::new(),
    }
}

/// Full ffmpeg argument list for an image request
pub fn build_image_args(request: &TranscodeRequest) -> Vec<OsString> {
    let mut args = common_args(&request.input);
    let ext = output_ext(&request.output);
    args.extend(image_codec_flags(&ext, request.params.quality).into_iter().map(OsString::from));
    args.extend(["-frames:v", "1"].iter().map(OsString::from));
    args.push(request.output.as_os_str().to_owned());
    args
}

/// Full ffmpeg argument list for a video request
pub fn build_video_args(request: &TranscodeRequest) -> Vec<OsString> {
    let profile = request
        .profile
        .clone()
        .unwrap_or_else(|| EncoderProfile::new(EncoderId::Software, true));

    let mut args: Vec<OsString> = ["-nostats", "-progress", "pipe:1"]
        .iter()
        .map(OsString::from)
        .collect();
    args.extend(common_args(&request.input));
    args.extend(["-c:v", profile.codec_id].iter().map(OsString::from));
    args.extend(profile.tuning_flags(&request.params).into_iter().map(OsString::from));
    args.extend(
        ["-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", request.audio_bitrate.as_str()]
            .iter()
            .map(OsString::from),
    );
    if matches!(output_ext(&request.output).as_str(), "mp4" | "mov" | "m4v") {
        args.extend(["-movflags", "+faststart+use_metadata_tags"].iter().map(OsString::from));
    }
    args.push(request.output.as_os_str().to_owned());
    args
}

/// Percent from one `-progress` line, given the input duration in seconds
pub fn parse_progress_line(line: &str, total_secs: f64) -> Option<f32> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        // ffmpeg reports both keys in microseconds
        "out_time_us" | "out_time_ms" => {
            let micros = value.trim().parse::<i64>().ok().filter(|v| *v >= 0)?;
            let percent = (micros as f64 / 1_000_000.0) / total_secs * 100.0;
            Some(percent.clamp(0.0, 100.0) as f32)
        }
        "progress" if value.trim() == "end" => Some(100.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Preset;

    fn request(kind: MediaKind, output: &str) -> TranscodeRequest {
        TranscodeRequest {
            input: PathBuf::from("/in/clip.mov"),
            output: PathBuf::from(output),
            kind,
            profile: None,
            params: QualityParams { quality: 70, preset: Preset::Balanced, threads: 0 },
            audio_bitrate: "128k".to_string(),
            progress: None,
        }
    }

    fn contains_pair(args: &[OsString], key: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == key && w[1] == value)
    }

    #[test]
    fn test_image_flags_follow_target_extension() {
        assert_eq!(image_codec_flags("jpg", 100), vec!["-q:v", "2"]);
        assert_eq!(image_codec_flags("jpeg", 1), vec!["-q:v", "30"]);
        assert_eq!(image_codec_flags("webp", 80), vec!["-c:v", "libwebp", "-quality", "80"]);
        assert_eq!(image_codec_flags("png", 10), vec!["-compression_level", "9"]);
        assert!(image_codec_flags("gif", 80).is_empty());
    }

    #[test]
    fn test_image_args_write_single_frame() {
        let args = build_image_args(&request(MediaKind::Image, "/out/20210313-143211.jpg"));
        assert!(contains_pair(&args, "-frames:v", "1"));
        assert!(contains_pair(&args, "-map_metadata", "0"));
        assert_eq!(args.last().unwrap(), "/out/20210313-143211.jpg");
    }

    #[test]
    fn test_video_args_use_negotiated_profile() {
        let mut req = request(MediaKind::Video, "/out/clip.mp4");
        req.profile = Some(EncoderProfile::new(EncoderId::Nvenc, true));
        let args = build_video_args(&req);

        assert!(contains_pair(&args, "-c:v", "h264_nvenc"));
        assert!(contains_pair(&args, "-cq", "24"));
        assert!(contains_pair(&args, "-b:a", "128k"));
        assert!(contains_pair(&args, "-progress", "pipe:1"));
        assert!(contains_pair(&args, "-movflags", "+faststart+use_metadata_tags"));
    }

    #[test]
    fn test_video_args_default_to_software() {
        let args = build_video_args(&request(MediaKind::Video, "/out/clip.mkv"));
        assert!(contains_pair(&args, "-c:v", "libx264"));
        assert!(!args.iter().any(|a| a == "-movflags"));
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("out_time_us=5000000", 10.0), Some(50.0));
        assert_eq!(parse_progress_line("out_time_ms=20000000", 10.0), Some(100.0));
        assert_eq!(parse_progress_line("out_time_us=N/A", 10.0), None);
        assert_eq!(parse_progress_line("progress=continue", 10.0), None);
        assert_eq!(parse_progress_line("progress=end", 10.0), Some(100.0));
        assert_eq!(parse_progress_line("frame=12", 10.0), None);
    }
}
