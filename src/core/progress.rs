//! Per-chunk speed sampling and download-level aggregation

use std::time::{Duration, Instant};

use crate::core::models::ChunkRecord;

/// Throttled instantaneous speed measurement for one chunk
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    last_instant: Instant,
    last_bytes: u64,
    interval: Duration,
}

impl SpeedSampler {
    pub fn new(bytes: u64, interval: Duration) -> Self {
        Self {
            last_instant: Instant::now(),
            last_bytes: bytes,
            interval,
        }
    }

    /// Speed in bytes/sec since the previous sample, or `None` if less than
    /// one interval has passed
    pub fn sample(&mut self, bytes: u64) -> Option<f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_instant);
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            bytes.saturating_sub(self.last_bytes) as f64 / secs
        } else {
            0.0
        };

        self.last_instant = now;
        self.last_bytes = bytes;
        Some(speed)
    }

    /// Restart the measurement window, e.g. after a pause
    pub fn reset(&mut self, bytes: u64) {
        self.last_instant = Instant::now();
        self.last_bytes = bytes;
    }
}

/// Chunk progress in percent. Unknown length reports 0 until completion.
pub fn chunk_progress(downloaded: u64, len: Option<u64>) -> f64 {
    match len {
        Some(0) => 100.0,
        Some(len) => (downloaded as f64 / len as f64 * 100.0).min(100.0),
        None => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateProgress {
    /// Unweighted mean of chunk progress
    pub progress: f64,
    /// Sum of chunk speeds
    pub speed: f64,
    pub downloaded: u64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

pub fn aggregate(chunks: &[ChunkRecord]) -> AggregateProgress {
    if chunks.is_empty() {
        return AggregateProgress {
            progress: 0.0,
            speed: 0.0,
            downloaded: 0,
            completed_chunks: 0,
            total_chunks: 0,
        };
    }

    let progress_sum: f64 = chunks.iter().map(|chunk| chunk.progress).sum();

    AggregateProgress {
        progress: progress_sum / chunks.len() as f64,
        speed: chunks.iter().map(|chunk| chunk.speed).sum(),
        downloaded: chunks.iter().map(|chunk| chunk.downloaded).sum(),
        completed_chunks: chunks.iter().filter(|chunk| chunk.is_completed()).count(),
        total_chunks: chunks.len(),
    }
}

/// Remaining seconds at the current speed
pub fn eta_seconds(total_size: u64, downloaded: u64, speed: f64) -> Option<u64> {
    if total_size == 0 || speed <= 0.0 || downloaded >= total_size {
        return None;
    }
    Some(((total_size - downloaded) as f64 / speed) as u64)
}
