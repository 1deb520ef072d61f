//! Core data models for the segmented download engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Download lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Probing,
    Downloading,
    Paused,
    Merging,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Probing => "probing",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether the status allows moving to `next`. Writing the same status
    /// again is always allowed.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Queued, Probing) => true,
            (Probing, Downloading) | (Probing, Paused) => true,
            (Downloading, Paused) | (Downloading, Merging) => true,
            (Paused, Downloading) | (Paused, Probing) => true,
            (Merging, Completed) => true,
            // 失败与取消可以从任何非终态进入
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            // 重新排队
            (Failed, Queued) | (Cancelled, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chunk status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Error,
}

/// Broad file category derived from the URL extension and content type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Video,
    Audio,
    Document,
    Image,
    Archive,
    Application,
    Other,
}

/// Origin of a download, derived from the URL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSource {
    Youtube,
    Tiktok,
    Moviebox,
    Book,
    App,
    Other,
}

/// A download record.
///
/// `size` is 0 until the probe reports a length. Once non-zero it never
/// changes for the lifetime of the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub url: String,
    pub name: String,
    pub size: u64,
    pub progress: f64,
    pub speed: f64,
    pub status: DownloadStatus,
    pub content_type: Option<String>,
    pub file_type: Option<FileType>,
    pub source: Option<DownloadSource>,
    pub file_path: Option<PathBuf>,
    pub encrypted: bool,
    pub encryption_method: Option<String>,
    pub cloud_synced: bool,
    pub cloud_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Download {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            name: name.into(),
            size: 0,
            progress: 0.0,
            speed: 0.0,
            status: DownloadStatus::Queued,
            content_type: None,
            file_type: None,
            source: None,
            file_path: None,
            encrypted: false,
            encryption_method: None,
            cloud_synced: false,
            cloud_path: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Inclusive byte range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// One byte range of a download and its transfer state.
///
/// `end` is `None` only for the single open-ended chunk of a resource whose
/// length the probe could not determine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub download_id: String,
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
    pub downloaded: u64,
    pub progress: f64,
    pub speed: f64,
    pub status: ChunkStatus,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn new(download_id: impl Into<String>, index: usize, range: ByteRange) -> Self {
        Self {
            download_id: download_id.into(),
            index,
            start: range.start,
            end: Some(range.end),
            downloaded: 0,
            progress: 0.0,
            speed: 0.0,
            status: ChunkStatus::Active,
            updated_at: Utc::now(),
        }
    }

    pub fn open_ended(download_id: impl Into<String>) -> Self {
        Self {
            end: None,
            ..Self::new(download_id, 0, ByteRange::new(0, 0))
        }
    }

    /// Expected byte count, unknown for an open-ended chunk
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

/// Resource metadata reported by the prober
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// 0 when the server does not report a length
    pub total_size: u64,
    pub content_type: Option<String>,
    pub supports_ranges: bool,
}

impl ProbeResult {
    /// Range requests are only usable when the length is known too
    pub fn allows_segmentation(&self) -> bool {
        self.total_size > 0 && self.supports_ranges
    }
}
