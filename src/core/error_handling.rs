//! Error taxonomy and retry policy for the download engine
//!
//! Every pipeline stage has its own error type so the coordinator can tell
//! an intentional cancellation apart from a real failure:
//! - `ProbeError` - metadata probe failed, fatal for the download
//! - `ChunkError` - one byte range failed or was cancelled
//! - `MergeError` - chunk files could not be reassembled
//! - `EncryptionError` / `UploadError` - post-processing only, never fatal
//! - `StoreError` - persisted record access
//!
//! `EngineError` wraps all of them for the external request layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::core::models::DownloadStatus;

/// Default base delay for exponential backoff (500ms)
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP_MS: u64 = 30_000;

/// Maximum retry attempts allowed per chunk
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Resource unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("Probe rejected with HTTP status {0}")]
    Status(u16),

    #[error("Unusable content length: {0}")]
    InvalidLength(String),

    #[error("Resource size changed from {expected} to {actual} bytes")]
    SizeChanged { expected: u64, actual: u64 },
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Chunk transfer cancelled")]
    Cancelled,

    #[error("Chunk {index} transfer failed: {message}")]
    Transfer {
        index: usize,
        message: String,
        is_retryable: bool,
    },

    #[error("Chunk {index} I/O error: {source}")]
    Io {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk worker aborted: {0}")]
    Aborted(String),
}

impl ChunkError {
    pub fn transfer(index: usize, message: impl Into<String>, is_retryable: bool) -> Self {
        Self::Transfer {
            index,
            message: message.into(),
            is_retryable,
        }
    }

    pub fn io(index: usize, source: std::io::Error) -> Self {
        Self::Io { index, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Disk errors and cancellation are never retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { is_retryable, .. } => *is_retryable,
            Self::Cancelled | Self::Io { .. } | Self::Aborted(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("No chunks to merge")]
    NoChunks,

    #[error("Chunk {index} file missing: {path:?}")]
    MissingChunk { index: usize, path: PathBuf },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Chunk {index} starts at {start}, expected {expected}")]
    Gap {
        index: usize,
        start: u64,
        expected: u64,
    },

    #[error("Only {completed} of {expected} chunks completed")]
    Incomplete { completed: usize, expected: usize },

    #[error("Merge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Unsupported encryption method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Cipher failure: {0}")]
    Cipher(String),

    #[error("Integrity check failed: wrong key or corrupted file")]
    Authentication,

    #[error("File is not encrypted: {0:?}")]
    NotEncrypted(PathBuf),

    #[error("Encryption I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No credentials for provider {0}")]
    MissingCredentials(String),

    #[error("Upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upload rejected with HTTP status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected upload response: {0}")]
    InvalidResponse(String),

    #[error("Upload I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Download not found: {0}")]
    DownloadNotFound(String),

    #[error("Download already exists: {0}")]
    DuplicateDownload(String),

    #[error("Chunk {index} of download {download_id} not found")]
    ChunkNotFound { download_id: String, index: usize },

    #[error("Download {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Download {id} cannot do that from status {status}")]
    InvalidState { id: String, status: DownloadStatus },

    #[error("Download not active: {0}")]
    NotActive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(StoreError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DownloadNotFound(id) => Self::NotFound(id),
            StoreError::InvalidTransition { id, from, .. } => Self::InvalidState { id, status: from },
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Chunk(ChunkError::Cancelled))
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Per-chunk retry policy.
///
/// `max_attempts = 0` means fail-fast: the first transfer error fails the
/// chunk and with it the whole download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay cap
    pub max_delay_ms: u64,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_CAP_MS,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguishable() {
        let cancelled = ChunkError::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retryable());

        let engine_error = EngineError::from(cancelled);
        assert!(engine_error.is_cancelled());

        let failed = EngineError::from(ChunkError::transfer(2, "connection reset", true));
        assert!(!failed.is_cancelled());
    }

    #[test]
    fn test_io_errors_are_not_retryable() {
        let error = ChunkError::io(0, std::io::Error::other("disk full"));
        assert!(!error.is_retryable());
        assert!(ChunkError::transfer(0, "timeout", true).is_retryable());
        assert!(!ChunkError::transfer(0, "range ignored", false).is_retryable());
    }

    #[test]
    fn test_store_not_found_maps_to_engine_not_found() {
        let error = EngineError::from(StoreError::DownloadNotFound("dl-1".to_string()));
        assert!(matches!(error, EngineError::NotFound(id) if id == "dl-1"));
    }

    #[test]
    fn test_rejected_transition_maps_to_invalid_state() {
        let error = EngineError::from(StoreError::InvalidTransition {
            id: "dl-1".to_string(),
            from: DownloadStatus::Completed,
            to: DownloadStatus::Cancelled,
        });
        assert!(matches!(
            error,
            EngineError::InvalidState { status: DownloadStatus::Completed, .. }
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_policy_is_fail_fast() {
        assert_eq!(RetryPolicy::default().max_attempts, 0);
    }
}
