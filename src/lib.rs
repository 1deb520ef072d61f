//! segment-dl - Segmented HTTP download engine
//!
//! Splits a remote resource into byte ranges, downloads them in parallel
//! into per-chunk temp files, and merges them into the final file. Downloads
//! can be paused, resumed (also across restarts, from persisted chunk rows)
//! and cancelled. Completed files can optionally be encrypted and uploaded to
//! a cloud drive.

pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::EngineConfig,
    engine::{DownloadEngine, DownloadEvent, ResumeOutcome},
    error_handling::{EngineError, EngineResult},
    models::{ChunkRecord, Download, DownloadStatus},
    store::{DownloadStore, JsonFileStore, MemoryStore},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    utils::init_tracing();
    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
        // 重复初始化不会报错
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "segment-dl");
    }
}
