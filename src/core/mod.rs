//! Core engine modules
//!
//! Domain models, the chunk planner and workers, the per-download
//! coordinator and the engine that fronts them.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error_handling;
pub mod merger;
pub mod models;
pub mod planner;
pub mod post_process;
pub mod prober;
pub mod progress;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(test)]
pub mod test_support;


// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{DownloadEngine, DownloadEvent, EventSender, ResumeOutcome};
pub use error_handling::{EngineError, EngineResult, RetryPolicy};
pub use models::{ChunkRecord, ChunkStatus, Download, DownloadStatus};
pub use store::{DownloadPatch, DownloadStore, JsonFileStore, MemoryStore};
