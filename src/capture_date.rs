//! # Capture Date Resolution Module
//!
//! Resolves the instant a media file was captured, trying sources in priority order:
//!
//! 1. **Sidecar JSON** next to the file (takeout/export style `photoTakenTime`)
//! 2. **Embedded image metadata** (`DateTimeOriginal`)
//! 3. **Video container metadata** (`creation_time`)
//! 4. **Filesystem modification time**
//!
//! The first source that yields a valid date wins. A failure at one level is
//! logged and swallowed; only an unreadable file yields `None`.
//!
//! Every resolved instant carries explicit local calendar fields
//! (`LocalDateTime`), computed once from the instant and the UTC offset in
//! effect at that instant. Formatting code downstream reads those fields and
//! never touches timezones again.

use crate::error::{PipelineError, Result};
use crate::file_manager::{MediaItem, MediaKind};
use crate::metadata::MetadataReader;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Known sidecar suffixes appended to the full media file name
const SIDECAR_SUFFIXES: &[&str] = &[".json", ".supplemental-metadata.json"];

/// Shortest sidecar base name accepted as a truncated prefix match
const MIN_PREFIX_MATCH: usize = 8;

/// Timestamp objects looked up in a sidecar, in order
const SIDECAR_TIMESTAMP_KEYS: &[&str] = &["photoTakenTime", "creationTime"];

/// Years a capture date may fall in; outside it the date token is not fixed-width
const SUPPORTED_YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

/// Where a capture instant came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Sidecar,
    EmbeddedMetadata,
    ContainerMetadata,
    FilesystemMtime,
}

/// Wall-clock calendar fields in the capture's local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl LocalDateTime {
    /// Local fields of `instant` for a UTC offset given in minutes.
    ///
    /// The offset is applied as-is. Around a DST transition the caller's
    /// offset decides which wall clock is reported; no correction is made.
    ///
    /// `None` when the shifted wall clock leaves the supported year range.
    pub fn from_instant(instant: DateTime<Utc>, offset_minutes: i32) -> Option<Self> {
        let shifted = instant
            .naive_utc()
            .checked_add_signed(chrono::Duration::minutes(i64::from(offset_minutes)))?;
        SUPPORTED_YEARS.contains(&shifted.year()).then(|| Self::from_naive(&shifted))
    }

    pub fn from_naive(naive: &NaiveDateTime) -> Self {
        Self {
            year: naive.year(),
            month: naive.month(),
            day: naive.day(),
            hour: naive.hour(),
            minute: naive.minute(),
            second: naive.second(),
        }
    }

    /// Fixed-width `YYYYMMDD-HHMMSS` token used for date renaming
    pub fn date_token(&self) -> String {
        format!(
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }

    pub fn year_folder(&self) -> String {
        format!("{:04}", self.year)
    }

    pub fn month_folder(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

/// A resolved capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInstant {
    pub instant: DateTime<Utc>,
    pub local: LocalDateTime,
    pub source: CaptureSource,
}

/// Where the UTC offset for local fields comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtcOffsetSource {
    /// Host timezone, sampled at the instant being converted
    Local,
    /// Fixed offset in minutes east of UTC
    Fixed(i32),
}

impl UtcOffsetSource {
    pub fn offset_minutes_at(&self, instant: DateTime<Utc>) -> i32 {
        match self {
            Self::Local => Local.offset_from_utc_datetime(&instant.naive_utc()).local_minus_utc() / 60,
            Self::Fixed(minutes) => *minutes,
        }
    }

    /// Interpret a local wall clock as an absolute instant
    fn wall_clock_to_utc(&self, naive: &NaiveDateTime) -> DateTime<Utc> {
        match self {
            Self::Local => match Local.from_local_datetime(naive).earliest() {
                Some(local) => local.with_timezone(&Utc),
                // Wall clock inside a DST gap
                None => Utc.from_utc_datetime(naive),
            },
            Self::Fixed(minutes) => naive
                .checked_sub_signed(chrono::Duration::minutes(i64::from(*minutes)))
                .map_or_else(|| Utc.from_utc_datetime(naive), |shifted| Utc.from_utc_datetime(&shifted)),
        }
    }
}

/// JSON file names per directory, listed once per run
#[derive(Default)]
pub struct SidecarIndex {
    listings: Mutex<HashMap<PathBuf, Arc<Vec<String>>>>,
}

impl SidecarIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON names in `dir`, read from disk on first use
    pub async fn json_names(&self, dir: &Path) -> Result<Arc<Vec<String>>> {
        let mut listings = self.listings.lock().await;
        if let Some(names) = listings.get(dir) {
            return Ok(names.clone());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_json_name(&name) {
                names.push(name);
            }
        }
        debug!("Indexed {} sidecar candidates in {}", names.len(), dir.display());

        let names = Arc::new(names);
        listings.insert(dir.to_path_buf(), names.clone());
        Ok(names)
    }
}

/// Resolves capture instants through the sidecar → embedded → container → mtime chain
pub struct CaptureDateResolver {
    metadata: Arc<dyn MetadataReader>,
    offset: UtcOffsetSource,
    sidecars: SidecarIndex,
}

impl CaptureDateResolver {
    pub fn new(metadata: Arc<dyn MetadataReader>, offset: UtcOffsetSource) -> Self {
        Self {
            metadata,
            offset,
            sidecars: SidecarIndex::new(),
        }
    }

    /// Resolve the capture instant of `item`; `None` only if the file cannot be stat'ed
    pub async fn resolve(&self, item: &MediaItem) -> Option<CaptureInstant> {
        let path = &item.source_path;

        match self.from_sidecar(path).await {
            Ok(Some(found)) => return Some(found),
            Ok(None) => {}
            Err(e) => debug!("Sidecar lookup failed for {}: {}", path.display(), e),
        }

        let from_metadata = match item.kind {
            MediaKind::Image => self.from_embedded(path).await,
            MediaKind::Video => self.from_container(path).await,
        };
        match from_metadata {
            Ok(Some(found)) => return Some(found),
            Ok(None) => {}
            Err(e) => debug!("Metadata read failed for {}: {}", path.display(), e),
        }

        match self.from_mtime(path).await {
            Ok(found) => Some(found),
            Err(e) => {
                debug!("No capture date for {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Absolute instant → capture instant with local fields; `None` when the
    /// local wall clock is out of range
    pub fn localize(&self, instant: DateTime<Utc>, source: CaptureSource) -> Option<CaptureInstant> {
        let offset = self.offset.offset_minutes_at(instant);
        Some(CaptureInstant {
            instant,
            local: LocalDateTime::from_instant(instant, offset)?,
            source,
        })
    }

    fn localize_or_reject(&self, instant: DateTime<Utc>, source: CaptureSource) -> Result<CaptureInstant> {
        self.localize(instant, source)
            .ok_or_else(|| PipelineError::Metadata(format!("Capture date out of range: {}", instant)))
    }

    async fn from_sidecar(&self, path: &Path) -> Result<Option<CaptureInstant>> {
        let Some(sidecar) = find_sidecar(path, &self.sidecars).await? else {
            return Ok(None);
        };
        debug!("Using sidecar {} for {}", sidecar.display(), path.display());

        let content = tokio::fs::read_to_string(&sidecar).await?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        match parse_sidecar_timestamp(&value) {
            Some(instant) => self.localize_or_reject(instant, CaptureSource::Sidecar).map(Some),
            None => Ok(None),
        }
    }

    async fn from_embedded(&self, path: &Path) -> Result<Option<CaptureInstant>> {
        let Some(fields) = self.metadata.read_embedded(path).await? else {
            return Ok(None);
        };
        let Some(raw) = fields.date_time_original else {
            return Ok(None);
        };

        let wall_clock = parse_exif_datetime(&raw)
            .ok_or_else(|| PipelineError::Metadata(format!("Invalid DateTimeOriginal: {}", raw)))?;

        let instant = match fields.offset_time_original.as_deref().and_then(|o| parse_exif_offset(&raw, o)) {
            Some(instant) => instant,
            None => self.offset.wall_clock_to_utc(&wall_clock),
        };

        Ok(Some(CaptureInstant {
            instant,
            local: LocalDateTime::from_naive(&wall_clock),
            source: CaptureSource::EmbeddedMetadata,
        }))
    }

    async fn from_container(&self, path: &Path) -> Result<Option<CaptureInstant>> {
        let Some(fields) = self.metadata.read_container(path).await? else {
            return Ok(None);
        };
        let Some(raw) = fields.creation_time else {
            return Ok(None);
        };

        let instant = parse_container_time(&raw)
            .ok_or_else(|| PipelineError::Metadata(format!("Invalid creation_time: {}", raw)))?;
        self.localize_or_reject(instant, CaptureSource::ContainerMetadata).map(Some)
    }

    async fn from_mtime(&self, path: &Path) -> Result<CaptureInstant> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        self.localize_or_reject(DateTime::<Utc>::from(modified), CaptureSource::FilesystemMtime)
    }
}

/// Locate the sidecar JSON of `path`: exact names first, then the best fuzzy
/// match among the directory's JSON names in `index`
pub async fn find_sidecar(path: &Path, index: &SidecarIndex) -> Result<Option<PathBuf>> {
    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return Ok(None);
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut exact: Vec<String> = SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| format!("{}{}", file_name, suffix))
        .collect();
    if let Some(stem) = path.file_stem() {
        exact.push(format!("{}.json", stem.to_string_lossy()));
    }
    for candidate in exact {
        let candidate = dir.join(candidate);
        if tokio::fs::metadata(&candidate).await.map(|m| m.is_file()).unwrap_or(false) {
            return Ok(Some(candidate));
        }
    }

    let names = index.json_names(dir).await?;
    Ok(best_sidecar_match(&file_name, &names).map(|name| dir.join(name)))
}

fn is_json_name(name: &str) -> bool {
    name.to_lowercase().ends_with(".json")
}

fn strip_json_suffix(name: &str) -> &str {
    name.get(..name.len().saturating_sub(".json".len())).unwrap_or(name)
}

/// Pick the sidecar for `media_name` among directory JSON names.
///
/// Names starting with the full media name win (longest first); otherwise a
/// name whose JSON-less base is a prefix of the media name and at least
/// `MIN_PREFIX_MATCH` characters long (longest first). Truncated exports
/// produce the second form.
pub fn best_sidecar_match<'a>(media_name: &str, candidates: &'a [String]) -> Option<&'a str> {
    let full_match = candidates
        .iter()
        .filter(|name| is_json_name(name) && name.starts_with(media_name))
        .max_by_key(|name| name.len());
    if let Some(name) = full_match {
        return Some(name.as_str());
    }

    candidates
        .iter()
        .filter(|name| is_json_name(name))
        .filter(|name| {
            let base = strip_json_suffix(name);
            base.len() >= MIN_PREFIX_MATCH && media_name.starts_with(base)
        })
        .max_by_key(|name| name.len())
        .map(String::as_str)
}

/// Read `photoTakenTime.timestamp` (or `creationTime.timestamp`) as epoch seconds
pub fn parse_sidecar_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    SIDECAR_TIMESTAMP_KEYS.iter().find_map(|key| {
        let raw = &value[*key]["timestamp"];
        let secs = raw
            .as_i64()
            .or_else(|| raw.as_str().and_then(|s| s.trim().parse::<i64>().ok()))?;
        if secs <= 0 {
            return None;
        }
        Utc.timestamp_opt(secs, 0)
            .single()
            .filter(|instant| SUPPORTED_YEARS.contains(&instant.year()))
    })
}

/// `YYYY:MM:DD HH:MM:SS`, ignoring sub-seconds or a trailing zone
pub fn parse_exif_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let head = trimmed.get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y:%m:%d %H:%M:%S").ok()
}

fn parse_exif_offset(raw: &str, offset: &str) -> Option<DateTime<Utc>> {
    let head = raw.trim().get(..19)?;
    DateTime::parse_from_str(&format!("{} {}", head, offset.trim()), "%Y:%m:%d %H:%M:%S %:z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC 3339 (`2021-01-13T13:12:11.000000Z`) or a bare `YYYY-MM-DD HH:MM:SS` taken as UTC.
///
/// Epoch-zero placeholders written by some muxers (1904/1970) count as absent.
pub fn parse_container_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let instant = DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })?;

    if instant.year() <= 1970 || !SUPPORTED_YEARS.contains(&instant.year()) {
        return None;
    }
    Some(instant)
}
