//! # File Management Module
//!
//! Directory scanning and the small file utilities shared by the pipeline.
//!
//! ## Responsibilities:
//! - Recursive (or shallow) discovery of media files under a scan root
//! - Classification of files as image or video
//! - Detection of source formats that must be converted for compatibility
//! - Human-readable sizes and reduction percentages
//!
//! ## Supported formats:
//! - **Images**: JPG, JPEG, PNG, WebP, GIF, AVIF, HEIC/HEIF, TIFF, BMP
//! - **Videos**: MP4, MOV, M4V, AVI, MKV, WebM, WMV, FLV, 3GP, MTS/M2TS
//!
//! ## Example:
//! ```ignore
//! let items = FileManager::scan(Path::new("/photos"), true, KindFilter::All)?;
//! for item in items.iter().filter(|i| i.kind == MediaKind::Image) {
//!     // process image
//! }
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Image formats the `image` crate does not know about but external tools decode
const EXTRA_IMAGE_EXTENSIONS: &[&str] = &["heic", "heif"];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "avi", "mkv", "webm", "wmv", "flv", "3gp", "mts", "m2ts",
];

/// Sources that are not broadly playable/viewable and are always converted
const MANDATORY_CONVERSION: &[&str] = &[
    "heic", "heif", "tif", "tiff", "bmp", "avi", "wmv", "flv", "mkv", "3gp", "mts", "m2ts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// Which kinds a scan keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    All,
    Images,
    Videos,
}

impl KindFilter {
    fn accepts(self, kind: MediaKind) -> bool {
        match self {
            Self::All => true,
            Self::Images => kind == MediaKind::Image,
            Self::Videos => kind == MediaKind::Video,
        }
    }
}

/// A scanned media file. Immutable once produced by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub source_path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
}

impl MediaItem {
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Scan `root` for media files, sorted by path so runs are deterministic.
    ///
    /// An invalid root is a `PipelineError::Scan`; unreadable entries below the
    /// root are skipped, as are hidden files and directories (`.DS_Store`,
    /// AppleDouble `._*` companions).
    pub fn scan(root: &Path, recursive: bool, filter: KindFilter) -> Result<Vec<MediaItem>> {
        if !root.exists() {
            return Err(PipelineError::Scan(format!("Scan root does not exist: {}", root.display())));
        }
        if !root.is_dir() {
            return Err(PipelineError::Scan(format!("Scan root is not a directory: {}", root.display())));
        }

        let mut walker = WalkDir::new(root).sort_by_file_name();
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut items = Vec::new();
        for entry in walker
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Some(kind) = Self::classify(path) else {
                continue;
            };
            if !filter.accepts(kind) {
                continue;
            }
            let size_bytes = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    debug!("Skipping unreadable entry {}: {}", path.display(), e);
                    continue;
                }
            };
            items.push(MediaItem {
                source_path: path.to_path_buf(),
                kind,
                size_bytes,
            });
        }

        debug!("Scanned {} media files under {}", items.len(), root.display());
        Ok(items)
    }

    /// Classify a path by extension
    pub fn classify(path: &Path) -> Option<MediaKind> {
        if Self::is_image(path) {
            Some(MediaKind::Image)
        } else if Self::is_video(path) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    /// Check if a file is an image
    pub fn is_image(path: &Path) -> bool {
        let Some(ext) = Self::extension(path) else {
            return false;
        };
        image::ImageFormat::from_extension(&ext).is_some()
            || EXTRA_IMAGE_EXTENSIONS.contains(&ext.as_str())
    }

    /// Check if a file is a video
    pub fn is_video(path: &Path) -> bool {
        Self::extension(path)
            .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Whether the source must be converted even if the result is larger
    pub fn requires_conversion(source: &Path, target_ext: &str) -> bool {
        match Self::extension(source) {
            Some(ext) => {
                !Self::same_format(&ext, &target_ext.to_lowercase())
                    && MANDATORY_CONVERSION.contains(&ext.as_str())
            }
            None => false,
        }
    }

    fn same_format(a: &str, b: &str) -> bool {
        let canonical = |ext: &str| match ext {
            "jpeg" => "jpg",
            "tif" => "tiff",
            "heif" => "heic",
            other => other,
        }
        .to_string();
        canonical(a) == canonical(b)
    }

    fn extension(path: &Path) -> Option<String> {
        path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classification() {
        assert_eq!(FileManager::classify(Path::new("a/IMG_1.JPG")), Some(MediaKind::Image));
        assert_eq!(FileManager::classify(Path::new("a/IMG_1.heic")), Some(MediaKind::Image));
        assert_eq!(FileManager::classify(Path::new("a/clip.MOV")), Some(MediaKind::Video));
        assert_eq!(FileManager::classify(Path::new("a/IMG_1.jpg.json")), None);
        assert_eq!(FileManager::classify(Path::new("a/README")), None);
    }

    #[test]
    fn test_requires_conversion() {
        assert!(FileManager::requires_conversion(Path::new("x.HEIC"), "jpg"));
        assert!(FileManager::requires_conversion(Path::new("x.avi"), "mp4"));
        assert!(!FileManager::requires_conversion(Path::new("x.png"), "jpg"));
        assert!(!FileManager::requires_conversion(Path::new("x.mkv"), "mkv"));
        assert!(!FileManager::requires_conversion(Path::new("x.tif"), "tiff"));
    }

    #[test]
    fn test_scan_respects_recursion_and_filter() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("b.jpg"), b"img").unwrap();
        std::fs::write(root.join("a.mp4"), b"video!").unwrap();
        std::fs::write(root.join("a.mp4.json"), b"{}").unwrap();
        std::fs::write(root.join("sub").join("c.png"), b"png").unwrap();

        let all = FileManager::scan(root, true, KindFilter::All).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].source_path, root.join("a.mp4"));
        assert_eq!(all[0].size_bytes, 6);

        let shallow = FileManager::scan(root, false, KindFilter::All).unwrap();
        assert_eq!(shallow.len(), 2);

        let videos = FileManager::scan(root, true, KindFilter::Videos).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].kind, MediaKind::Video);
    }

    #[test]
    fn test_scan_skips_hidden_entries() {
        let temp = TempDir::new().unwrap();
        // A hidden scan root itself is still walked
        let root = temp.path().join(".takeout");
        std::fs::create_dir_all(root.join(".thumbnails")).unwrap();
        std::fs::write(root.join("IMG_0001.jpg"), b"img").unwrap();
        std::fs::write(root.join("._IMG_0001.jpg"), b"appledouble").unwrap();
        std::fs::write(root.join(".hidden.mp4"), b"video").unwrap();
        std::fs::write(root.join(".thumbnails").join("thumb.jpg"), b"thumb").unwrap();

        let items = FileManager::scan(&root, true, KindFilter::All).unwrap();
        let names: Vec<String> = items.iter().map(MediaItem::file_name).collect();
        assert_eq!(names, vec!["IMG_0001.jpg".to_string()]);
    }

    #[test]
    fn test_scan_invalid_root() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");
        assert!(matches!(
            FileManager::scan(&missing, true, KindFilter::All),
            Err(PipelineError::Scan(_))
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(2048), "2.00 KB");
        assert_eq!(FileManager::calculate_reduction(200, 50), 75.0);
        assert_eq!(FileManager::calculate_reduction(0, 50), 0.0);
    }
}
