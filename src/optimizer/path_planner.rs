//! # Output Path Planning Module
//!
//! Computes a collision-free destination for every item of a run.
//!
//! ## Steps:
//! 1. Extension: every image gets the target image extension, every video the
//!    target container extension, whatever the source was
//! 2. Directory: output root (`flatten`), a `YYYY` / `YYYY-MM` period folder
//!    (`organize_by_period`), or the source tree replicated (`mirror`)
//! 3. Name: `YYYYMMDD-HHMMSS` from the capture date when renaming by date
//!    (`unknown-date` when no date resolved), else the original stem
//! 4. Collision: `<name>_1.<ext>`, `<name>_2.<ext>`, ... until the path is neither
//!    on disk nor reserved earlier in this run
//!
//! Reservations live behind one async mutex, so concurrent workers never receive
//! the same path. They are keyed case-insensitively: `IMG_1.jpg` and `img_1.jpg`
//! are the same file on case-insensitive filesystems.

use crate::capture_date::CaptureInstant;
use crate::config::{Layout, OutputOptions, Period};
use crate::error::{PipelineError, Result};
use crate::file_manager::{MediaItem, MediaKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const UNKNOWN_DATE: &str = "unknown-date";
const UNKNOWN_PERIOD: &str = "unknown";

/// Plans output paths for one run
pub struct OutputPathPlanner {
    scan_root: PathBuf,
    options: OutputOptions,
    reserved: Mutex<HashSet<PathBuf>>,
}

impl OutputPathPlanner {
    pub fn new(scan_root: impl Into<PathBuf>, options: OutputOptions) -> Self {
        Self {
            scan_root: scan_root.into(),
            options,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn target_extension(&self, kind: MediaKind) -> &str {
        match kind {
            MediaKind::Image => &self.options.target_image_ext,
            MediaKind::Video => &self.options.target_video_ext,
        }
    }

    /// Directory the item lands in, before collision handling
    pub fn target_dir(&self, item: &MediaItem, capture: Option<&CaptureInstant>) -> PathBuf {
        let root = &self.options.output_root;
        match self.options.layout {
            Layout::Flatten => root.clone(),
            Layout::OrganizeByPeriod => {
                let folder = match (capture, self.options.period) {
                    (Some(capture), Period::Year) => capture.local.year_folder(),
                    (Some(capture), Period::Month) => capture.local.month_folder(),
                    (None, _) => UNKNOWN_PERIOD.to_string(),
                };
                root.join(folder)
            }
            Layout::Mirror => root.join(self.relative_parent(&item.source_path)),
        }
    }

    /// Source directory relative to the scan root
    fn relative_parent(&self, source: &Path) -> PathBuf {
        let parent = source.parent().unwrap_or(Path::new(""));
        if let Ok(relative) = parent.strip_prefix(&self.scan_root) {
            return relative.to_path_buf();
        }

        // Mixed relative/absolute inputs
        let canonical_parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
        let canonical_root = self
            .scan_root
            .canonicalize()
            .unwrap_or_else(|_| self.scan_root.clone());
        match canonical_parent.strip_prefix(&canonical_root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => {
                debug!("{} is outside the scan root, placing it at the output root", source.display());
                PathBuf::new()
            }
        }
    }

    /// File name without extension, before collision handling
    pub fn base_name(&self, item: &MediaItem, capture: Option<&CaptureInstant>) -> String {
        if self.options.rename_by_date {
            return match capture {
                Some(capture) => capture.local.date_token(),
                None => UNKNOWN_DATE.to_string(),
            };
        }
        item.source_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "unnamed".to_string())
    }

    /// Reserve and return a destination path no earlier item of this run received
    /// and no existing file occupies
    pub async fn plan(&self, item: &MediaItem, capture: Option<&CaptureInstant>) -> Result<PathBuf> {
        let dir = self.target_dir(item, capture);
        let base = self.base_name(item, capture);
        let ext = self.target_extension(item.kind).to_string();

        let mut reserved = self.reserved.lock().await;
        for counter in 0..=u32::MAX {
            let file_name = if counter == 0 {
                format!("{}.{}", base, ext)
            } else {
                format!("{}_{}.{}", base, counter, ext)
            };
            let candidate = dir.join(file_name);

            let key = reservation_key(&candidate);
            if reserved.contains(&key) || fs::try_exists(&candidate).await? {
                continue;
            }

            debug!("Planned {} -> {}", item.source_path.display(), candidate.display());
            reserved.insert(key);
            return Ok(candidate);
        }

        Err(PipelineError::CollisionExhausted(dir.join(format!("{}.{}", base, ext))))
    }

    /// Paths handed out so far in this run
    pub async fn reserved_count(&self) -> usize {
        self.reserved.lock().await.len()
    }

    /// Create the parent directories of `path` if needed
    pub async fn ensure_parent_dirs(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn reservation_key(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_date::{CaptureSource, LocalDateTime};
    use chrono::{TimeZone, Utc};
    use futures::future::join_all;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn capture() -> CaptureInstant {
        CaptureInstant {
            instant: Utc.with_ymd_and_hms(2021, 3, 13, 13, 32, 11).unwrap(),
            local: LocalDateTime {
                year: 2021,
                month: 3,
                day: 13,
                hour: 14,
                minute: 32,
                second: 11,
            },
            source: CaptureSource::EmbeddedMetadata,
        }
    }

    fn image(path: impl Into<PathBuf>) -> MediaItem {
        MediaItem {
            source_path: path.into(),
            kind: MediaKind::Image,
            size_bytes: 10,
        }
    }

    fn options(output_root: &Path, layout: Layout) -> OutputOptions {
        OutputOptions {
            output_root: output_root.to_path_buf(),
            layout,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_date_gets_disambiguated() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let planner = OutputPathPlanner::new("/photos", options(&out, Layout::Flatten));
        let date = capture();

        let first = planner.plan(&image("/photos/a.jpg"), Some(&date)).await.unwrap();
        let second = planner.plan(&image("/photos/b.heic"), Some(&date)).await.unwrap();

        assert_eq!(first, out.join("20210313-143211.jpg"));
        assert_eq!(second, out.join("20210313-143211_1.jpg"));
        assert_eq!(planner.reserved_count().await, 2);
    }

    #[tokio::test]
    async fn test_existing_file_is_never_overwritten() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().to_path_buf();
        std::fs::write(out.join("20210313-143211.jpg"), b"already here").unwrap();
        std::fs::write(out.join("20210313-143211_1.jpg"), b"and here").unwrap();

        let planner = OutputPathPlanner::new("/photos", options(&out, Layout::Flatten));
        let planned = planner.plan(&image("/photos/a.jpg"), Some(&capture())).await.unwrap();
        assert_eq!(planned, out.join("20210313-143211_2.jpg"));
    }

    #[tokio::test]
    async fn test_concurrent_plans_are_unique() {
        let temp = TempDir::new().unwrap();
        let planner = Arc::new(OutputPathPlanner::new(
            "/photos",
            options(temp.path(), Layout::Flatten),
        ));
        let date = capture();

        let plans = join_all((0..10).map(|i| {
            let planner = planner.clone();
            async move { planner.plan(&image(format!("/photos/{}.jpg", i)), Some(&date)).await }
        }))
        .await;

        let unique: HashSet<PathBuf> = plans.into_iter().map(|p| p.unwrap()).collect();
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn test_layouts() {
        let out = PathBuf::from("/out");
        let item = image("/photos/2021/trip/IMG_1.HEIC");
        let date = capture();

        let mirror = OutputPathPlanner::new("/photos", options(&out, Layout::Mirror));
        assert_eq!(mirror.target_dir(&item, Some(&date)), out.join("2021").join("trip"));

        let flatten = OutputPathPlanner::new("/photos", options(&out, Layout::Flatten));
        assert_eq!(flatten.target_dir(&item, Some(&date)), out);

        let by_month = OutputPathPlanner::new("/photos", options(&out, Layout::OrganizeByPeriod));
        assert_eq!(by_month.target_dir(&item, Some(&date)), out.join("2021-03"));
        assert_eq!(by_month.target_dir(&item, None), out.join("unknown"));

        let by_year = OutputPathPlanner::new(
            "/photos",
            OutputOptions {
                period: Period::Year,
                ..options(&out, Layout::OrganizeByPeriod)
            },
        );
        assert_eq!(by_year.target_dir(&item, Some(&date)), out.join("2021"));
    }

    #[tokio::test]
    async fn test_names_and_extensions() {
        let temp = TempDir::new().unwrap();
        let keep_names = OutputPathPlanner::new(
            "/photos",
            OutputOptions {
                rename_by_date: false,
                target_image_ext: "webp".to_string(),
                ..options(temp.path(), Layout::Flatten)
            },
        );
        let planned = keep_names.plan(&image("/photos/IMG_1.HEIC"), Some(&capture())).await.unwrap();
        assert_eq!(planned, temp.path().join("IMG_1.webp"));

        let by_date = OutputPathPlanner::new("/photos", options(temp.path(), Layout::Flatten));
        let video = MediaItem {
            source_path: PathBuf::from("/photos/clip.MOV"),
            kind: MediaKind::Video,
            size_bytes: 10,
        };
        let planned = by_date.plan(&video, None).await.unwrap();
        assert_eq!(planned, temp.path().join("unknown-date.mp4"));
    }

    #[tokio::test]
    async fn test_names_differing_only_in_case_do_not_share_a_path() {
        let temp = TempDir::new().unwrap();
        let planner = OutputPathPlanner::new(
            "/photos",
            OutputOptions {
                rename_by_date: false,
                ..options(temp.path(), Layout::Flatten)
            },
        );

        let upper = planner.plan(&image("/photos/a/IMG_1.HEIC"), None).await.unwrap();
        let lower = planner.plan(&image("/photos/b/img_1.heic"), None).await.unwrap();

        assert_eq!(upper, temp.path().join("IMG_1.jpg"));
        assert_eq!(lower, temp.path().join("img_1_1.jpg"));
    }

    #[tokio::test]
    async fn test_ensure_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("a").join("b").join("file.jpg");
        OutputPathPlanner::ensure_parent_dirs(&target).await.unwrap();
        assert!(temp.path().join("a").join("b").is_dir());
    }
}
