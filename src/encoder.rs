//! # Encoder Negotiation Module
//!
//! Decides which video encoder a run uses.
//!
//! ## Responsibilities:
//! - Detects which hardware encoders actually work on this machine
//! - Caches detection results until explicitly invalidated
//! - Walks one fixed preference list to pick the first available encoder
//! - Translates a quality/preset/threads triple into encoder-specific flags
//!
//! ## Detection (per hardware candidate):
//! 1. The encoder must appear in `ffmpeg -encoders`
//! 2. A one-frame smoke test must succeed within a timeout
//!
//! Only candidates passing both are available. Listed encoders often fail at
//! runtime (no GPU, missing driver), which is why the smoke test exists.
//! The software encoder is always available.
//!
//! ## Preference order:
//! NVENC → Quick Sync → AMF → VideoToolbox → libx264
//!
//! ## Quality mapping:
//! - **NVENC**: constant-quality VBR (`-cq`)
//! - **Quick Sync**: `-global_quality`
//! - **AMF**: constant QP per frame type (`-qp_i` / `-qp_p`)
//! - **VideoToolbox**: `-q:v` on a 1-100 scale
//! - **libx264**: CRF

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default timeout for a single smoke test
pub const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderId {
    Nvenc,
    Qsv,
    Amf,
    VideoToolbox,
    Software,
}

impl EncoderId {
    /// Fixed preference order, best first. Software is always last.
    pub const PRIORITY: [EncoderId; 5] = [
        EncoderId::Nvenc,
        EncoderId::Qsv,
        EncoderId::Amf,
        EncoderId::VideoToolbox,
        EncoderId::Software,
    ];

    pub fn codec_id(self) -> &'static str {
        match self {
            Self::Nvenc => "h264_nvenc",
            Self::Qsv => "h264_qsv",
            Self::Amf => "h264_amf",
            Self::VideoToolbox => "h264_videotoolbox",
            Self::Software => "libx264",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Nvenc => "NVIDIA NVENC",
            Self::Qsv => "Intel Quick Sync",
            Self::Amf => "AMD AMF",
            Self::VideoToolbox => "Apple VideoToolbox",
            Self::Software => "libx264 (software)",
        }
    }

    pub fn is_hardware(self) -> bool {
        self != Self::Software
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Speed/size trade-off, mapped onto each vendor's own preset names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Fast,
    Balanced,
    Quality,
}

/// Vendor-neutral quality request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    /// 1 (smallest) - 100 (best)
    pub quality: u8,
    pub preset: Preset,
    /// 0 = encoder default
    pub threads: usize,
}

impl QualityParams {
    /// Quality on the 18 (best) - 39 (smallest) quantizer scale shared by CRF/CQ/QP encoders
    pub fn quantizer(&self) -> u32 {
        let quality = u32::from(self.quality.clamp(1, 100));
        18 + (100 - quality) * 22 / 100
    }
}

/// A named encoder configuration plus its quality mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    pub id: EncoderId,
    pub display_name: &'static str,
    pub codec_id: &'static str,
    pub available: bool,
}

impl EncoderProfile {
    pub fn new(id: EncoderId, available: bool) -> Self {
        Self {
            id,
            display_name: id.display_name(),
            codec_id: id.codec_id(),
            available,
        }
    }

    /// Codec flags (after `-c:v <codec_id>`) for a quality request.
    ///
    /// Pure: the same params always yield the same flags.
    pub fn tuning_flags(&self, params: &QualityParams) -> Vec<String> {
        let q = params.quantizer().to_string();
        let mut flags: Vec<String> = match self.id {
            EncoderId::Nvenc => {
                let preset = match params.preset {
                    Preset::Fast => "p2",
                    Preset::Balanced => "p4",
                    Preset::Quality => "p6",
                };
                vec!["-rc".into(), "vbr".into(), "-cq".into(), q, "-b:v".into(), "0".into(), "-preset".into(), preset.into()]
            }
            EncoderId::Qsv => {
                let preset = match params.preset {
                    Preset::Fast => "veryfast",
                    Preset::Balanced => "medium",
                    Preset::Quality => "veryslow",
                };
                vec!["-global_quality".into(), q, "-preset".into(), preset.into()]
            }
            EncoderId::Amf => {
                let quality = match params.preset {
                    Preset::Fast => "speed",
                    Preset::Balanced => "balanced",
                    Preset::Quality => "quality",
                };
                let qp_p = (params.quantizer() + 2).to_string();
                vec!["-rc".into(), "cqp".into(), "-qp_i".into(), q, "-qp_p".into(), qp_p, "-quality".into(), quality.into()]
            }
            EncoderId::VideoToolbox => {
                let mut flags = vec!["-q:v".to_string(), params.quality.clamp(1, 100).to_string()];
                if params.preset == Preset::Fast {
                    flags.extend(["-realtime".to_string(), "1".to_string()]);
                }
                flags
            }
            EncoderId::Software => {
                let preset = match params.preset {
                    Preset::Fast => "veryfast",
                    Preset::Balanced => "medium",
                    Preset::Quality => "slow",
                };
                vec!["-crf".into(), q, "-preset".into(), preset.into()]
            }
        };

        if self.id == EncoderId::Software && params.threads > 0 {
            flags.extend(["-threads".to_string(), params.threads.to_string()]);
        }
        flags
    }
}

/// Codec-tool collaborator used for detection
#[async_trait]
pub trait EncoderProbe: Send + Sync {
    /// Raw encoder listing (`ffmpeg -encoders`)
    async fn list_encoders(&self) -> Result<String>;

    /// Encode one synthetic frame with `codec_id`
    async fn smoke_test(&self, codec_id: &str) -> bool;
}

/// Probes encoders through the `ffmpeg` binary
pub struct FfmpegProbe {
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegProbe {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self {
            ffmpeg,
            timeout: SMOKE_TEST_TIMEOUT,
        }
    }
}

#[async_trait]
impl EncoderProbe for FfmpegProbe {
    async fn list_encoders(&self) -> Result<String> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn smoke_test(&self, codec_id: &str) -> bool {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args([
            "-hide_banner",
            "-loglevel", "error",
            "-f", "lavfi",
            "-i", "color=c=black:s=256x256:r=1",
            "-frames:v", "1",
            "-c:v", codec_id,
            "-f", "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                debug!(
                    "Smoke test for {} failed: {}",
                    codec_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Ok(Err(e)) => {
                debug!("Smoke test for {} could not run: {}", codec_id, e);
                false
            }
            Err(_) => {
                debug!("Smoke test for {} timed out after {:?}", codec_id, self.timeout);
                false
            }
        }
    }
}

/// Whole-word match of `codec_id` in an encoder listing
pub fn listing_contains(listing: &str, codec_id: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().any(|token| token == codec_id))
}

/// First available encoder from `start` onward in the preference list,
/// plus every candidate skipped on the way.
pub fn select_encoder(start: EncoderId, available: &HashMap<EncoderId, bool>) -> (EncoderId, Vec<EncoderId>) {
    let from = EncoderId::PRIORITY
        .iter()
        .position(|id| *id == start)
        .unwrap_or(0);

    let mut skipped = Vec::new();
    for id in &EncoderId::PRIORITY[from..] {
        if *id == EncoderId::Software || available.get(id).copied().unwrap_or(false) {
            return (*id, skipped);
        }
        skipped.push(*id);
    }
    (EncoderId::Software, skipped)
}

/// Detection results owned by one negotiator
#[derive(Debug, Default)]
pub struct DetectionCache {
    results: Option<HashMap<EncoderId, bool>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&HashMap<EncoderId, bool>> {
        self.results.as_ref()
    }

    pub fn store(&mut self, results: HashMap<EncoderId, bool>) {
        self.results = Some(results);
    }

    pub fn invalidate(&mut self) {
        self.results = None;
    }
}

/// Detects usable encoders and builds the fallback chain
pub struct EncoderNegotiator {
    probe: RwLock<Arc<dyn EncoderProbe>>,
    cache: Mutex<DetectionCache>,
}

impl EncoderNegotiator {
    pub fn new(probe: Arc<dyn EncoderProbe>) -> Self {
        Self {
            probe: RwLock::new(probe),
            cache: Mutex::new(DetectionCache::new()),
        }
    }

    /// Swap the codec tool (e.g. a new ffmpeg path). Cached results are dropped.
    pub async fn set_probe(&self, probe: Arc<dyn EncoderProbe>) {
        *self.probe.write().await = probe;
        self.invalidate().await;
    }

    pub async fn invalidate(&self) {
        debug!("Encoder detection cache invalidated");
        self.cache.lock().await.invalidate();
    }

    /// Availability of every known encoder; cached unless `force_refresh`
    pub async fn detect(&self, force_refresh: bool) -> HashMap<EncoderId, bool> {
        let mut cache = self.cache.lock().await;
        if !force_refresh {
            if let Some(results) = cache.get() {
                return results.clone();
            }
        }

        let probe = self.probe.read().await.clone();
        let listing = match probe.list_encoders().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Could not list encoders, using software encoding only: {}", e);
                String::new()
            }
        };

        let listed: Vec<EncoderId> = EncoderId::PRIORITY
            .iter()
            .copied()
            .filter(|id| id.is_hardware())
            .filter(|id| {
                let present = listing_contains(&listing, id.codec_id());
                if !present {
                    debug!("{} not listed by the codec tool", id);
                }
                present
            })
            .collect();

        let smoke_results = join_all(listed.iter().map(|id| probe.smoke_test(id.codec_id()))).await;

        let mut results: HashMap<EncoderId, bool> = EncoderId::PRIORITY
            .iter()
            .map(|id| (*id, !id.is_hardware()))
            .collect();
        for (id, passed) in listed.into_iter().zip(smoke_results) {
            if !passed {
                warn!("{} is listed but failed its smoke test", id);
            }
            results.insert(id, passed);
        }

        let usable: Vec<String> = EncoderId::PRIORITY
            .iter()
            .filter(|id| results.get(id).copied().unwrap_or(false))
            .map(|id| id.to_string())
            .collect();
        info!("Available video encoders: {}", usable.join(", "));

        cache.store(results.clone());
        results
    }

    /// Profile for `requested`, falling back down the preference list
    pub async fn negotiate(&self, requested: EncoderId) -> EncoderProfile {
        let available = self.detect(false).await;
        let (chosen, skipped) = select_encoder(requested, &available);
        for id in skipped {
            let unavailable = PipelineError::EncoderUnavailable(id.display_name().to_string());
            warn!("{}, falling back to the next encoder", unavailable);
        }
        if chosen != requested {
            info!("Using {} instead of requested {}", chosen, requested);
        }
        EncoderProfile::new(chosen, true)
    }

    /// Best available profile
    pub async fn negotiate_best(&self) -> EncoderProfile {
        self.negotiate(EncoderId::PRIORITY[0]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LISTING: &str = " V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)\n \
                           V....D h264_qsv             H.264 (Intel Quick Sync Video acceleration) (codec h264)\n \
                           V....D libx264              libx264 H.264 / AVC (codec h264)\n";

    struct FakeProbe {
        listing: String,
        passing: HashSet<&'static str>,
        list_calls: AtomicUsize,
        smoke_calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(listing: &str, passing: &[&'static str]) -> Self {
            Self {
                listing: listing.to_string(),
                passing: passing.iter().copied().collect(),
                list_calls: AtomicUsize::new(0),
                smoke_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EncoderProbe for FakeProbe {
        async fn list_encoders(&self) -> Result<String> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.listing.clone())
        }

        async fn smoke_test(&self, codec_id: &str) -> bool {
            self.smoke_calls.fetch_add(1, Ordering::SeqCst);
            self.passing.contains(codec_id)
        }
    }

    #[tokio::test]
    async fn test_listed_but_failing_smoke_test_is_unavailable() {
        let probe = Arc::new(FakeProbe::new(LISTING, &["h264_qsv"]));
        let negotiator = EncoderNegotiator::new(probe.clone());

        let detected = negotiator.detect(false).await;
        assert_eq!(detected[&EncoderId::Nvenc], false);
        assert_eq!(detected[&EncoderId::Qsv], true);
        assert_eq!(detected[&EncoderId::Amf], false);
        assert_eq!(detected[&EncoderId::Software], true);
        // Only listed encoders are smoke tested
        assert_eq!(probe.smoke_calls.load(Ordering::SeqCst), 2);

        let profile = negotiator.negotiate(EncoderId::Nvenc).await;
        assert_eq!(profile.id, EncoderId::Qsv);
        assert_eq!(profile.codec_id, "h264_qsv");
        assert!(profile.available);
    }

    #[tokio::test]
    async fn test_falls_back_to_software() {
        let probe = Arc::new(FakeProbe::new(LISTING, &[]));
        let negotiator = EncoderNegotiator::new(probe);
        assert_eq!(negotiator.negotiate_best().await.id, EncoderId::Software);
        assert_eq!(negotiator.negotiate(EncoderId::VideoToolbox).await.id, EncoderId::Software);
    }

    #[tokio::test]
    async fn test_detection_is_cached_until_invalidated() {
        let probe = Arc::new(FakeProbe::new(LISTING, &["h264_nvenc"]));
        let negotiator = EncoderNegotiator::new(probe.clone());

        negotiator.detect(false).await;
        negotiator.negotiate(EncoderId::Nvenc).await;
        negotiator.negotiate_best().await;
        assert_eq!(probe.list_calls.load(Ordering::SeqCst), 1);

        negotiator.detect(true).await;
        assert_eq!(probe.list_calls.load(Ordering::SeqCst), 2);

        negotiator.invalidate().await;
        negotiator.detect(false).await;
        assert_eq!(probe.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_set_probe_invalidates_cache() {
        let negotiator = EncoderNegotiator::new(Arc::new(FakeProbe::new(LISTING, &["h264_nvenc"])));
        assert_eq!(negotiator.negotiate_best().await.id, EncoderId::Nvenc);

        negotiator.set_probe(Arc::new(FakeProbe::new("", &[]))).await;
        assert_eq!(negotiator.negotiate_best().await.id, EncoderId::Software);
    }

    #[test]
    fn test_select_encoder_starts_at_requested_position() {
        let available: HashMap<EncoderId, bool> = [
            (EncoderId::Nvenc, true),
            (EncoderId::Qsv, false),
            (EncoderId::Amf, true),
        ]
        .into_iter()
        .collect();

        assert_eq!(select_encoder(EncoderId::Nvenc, &available), (EncoderId::Nvenc, vec![]));
        assert_eq!(select_encoder(EncoderId::Qsv, &available), (EncoderId::Amf, vec![EncoderId::Qsv]));
        assert_eq!(
            select_encoder(EncoderId::VideoToolbox, &available),
            (EncoderId::Software, vec![EncoderId::VideoToolbox])
        );
        assert_eq!(select_encoder(EncoderId::Software, &available), (EncoderId::Software, vec![]));
    }

    #[test]
    fn test_listing_contains_whole_words_only() {
        assert!(listing_contains(LISTING, "h264_nvenc"));
        assert!(!listing_contains(LISTING, "h264_nv"));
        assert!(!listing_contains(LISTING, "h264_amf"));
    }

    #[test]
    fn test_tuning_flags_per_vendor() {
        let params = QualityParams { quality: 70, preset: Preset::Balanced, threads: 4 };
        assert_eq!(params.quantizer(), 24);

        let software = EncoderProfile::new(EncoderId::Software, true).tuning_flags(&params);
        assert_eq!(software, vec!["-crf", "24", "-preset", "medium", "-threads", "4"]);

        let nvenc = EncoderProfile::new(EncoderId::Nvenc, true).tuning_flags(&params);
        assert!(nvenc.windows(2).any(|w| w == ["-cq", "24"]));
        assert!(!nvenc.contains(&"-threads".to_string()));

        let qsv = EncoderProfile::new(EncoderId::Qsv, true).tuning_flags(&params);
        assert_eq!(&qsv[..2], &["-global_quality", "24"]);

        let amf = EncoderProfile::new(EncoderId::Amf, true).tuning_flags(&params);
        assert!(amf.windows(2).any(|w| w == ["-qp_p", "26"]));

        let vt = EncoderProfile::new(EncoderId::VideoToolbox, true).tuning_flags(&params);
        assert_eq!(vt, vec!["-q:v", "70"]);
    }

    #[test]
    fn test_quantizer_bounds() {
        let best = QualityParams { quality: 100, preset: Preset::Fast, threads: 0 };
        let worst = QualityParams { quality: 1, ..best };
        assert_eq!(best.quantizer(), 18);
        assert_eq!(worst.quantizer(), 39);
    }
}
