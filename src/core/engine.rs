//! Download engine - request layer over coordinators, registry and store
//!
//! `DownloadEngine` is the entry point for callers: it creates downloads,
//! launches a coordinator per download and forwards pause/resume/cancel
//! requests to the running coordinator through its control handle. When no
//! coordinator is running the request acts on the persisted record instead.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::coordinator::{CoordinatorContext, DownloadCoordinator, LaunchMode};
use crate::core::error_handling::{EngineError, EngineResult};
use crate::core::merger::staging_path;
use crate::core::models::{ChunkRecord, ChunkStatus, Download, DownloadStatus};
use crate::core::post_process::PostProcessor;
use crate::core::registry::{ControlHandle, DownloadRegistry};
use crate::core::store::{DownloadPatch, DownloadStore};
use crate::utils::{filename_from_url, sanitize_filename, validate_url};

/// Events emitted while downloads run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    StatusChanged {
        download_id: String,
        status: DownloadStatus,
    },
    Progress {
        download_id: String,
        progress: f64,
        speed: f64,
        downloaded: u64,
        total: u64,
    },
    Completed {
        download_id: String,
        file_path: PathBuf,
    },
    Failed {
        download_id: String,
        error: String,
    },
    /// Download stays completed; only the post-processing step failed
    PostProcessFailed {
        download_id: String,
        error: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;

/// What `resume_download` did
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The running coordinator was woken up
    InPlace,
    /// No coordinator was running; a new one was launched from persisted state
    Restarted(JoinHandle<DownloadStatus>),
}

pub struct DownloadEngine {
    ctx: CoordinatorContext,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn DownloadStore>) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let client = build_client(&config)?;
        let post_processor = PostProcessor::with_defaults(config.post_process.clone(), client.clone());

        info!(
            "🔧 Download engine ready (threads per download: {}, directory: {:?})",
            config.effective_threads(),
            config.download_dir()
        );

        Ok(Self {
            ctx: CoordinatorContext {
                config: Arc::new(config),
                client,
                store,
                registry: Arc::new(DownloadRegistry::new()),
                post_processor: Arc::new(post_processor),
                events: None,
            },
        })
    }

    pub fn with_registry(mut self, registry: Arc<DownloadRegistry>) -> Self {
        self.ctx.registry = registry;
        self
    }

    pub fn with_post_processor(mut self, post_processor: PostProcessor) -> Self {
        self.ctx.post_processor = Arc::new(post_processor);
        self
    }

    pub fn with_event_sender(mut self, sender: EventSender) -> Self {
        self.ctx.events = Some(sender);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> Arc<DownloadRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn store(&self) -> Arc<dyn DownloadStore> {
        Arc::clone(&self.ctx.store)
    }

    /// Register a new queued download. Without a name the last URL path
    /// segment is used.
    pub async fn create_download(&self, url: &str, name: Option<&str>) -> EngineResult<Download> {
        validate_url(url)?;

        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| "download".to_string());

        let download = Download::new(url, sanitize_filename(&name));
        self.ctx.store.insert_download(download.clone()).await?;

        info!("📋 Created download {} ({})", download.id, download.name);
        Ok(download)
    }

    /// Launch a coordinator for a queued download
    pub async fn start_download(&self, id: &str) -> EngineResult<JoinHandle<DownloadStatus>> {
        let download = self.ctx.store.get_download(id).await?;
        if download.status != DownloadStatus::Queued {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: download.status,
            });
        }

        self.launch(download, LaunchMode::Fresh).await
    }

    async fn launch(
        &self,
        download: Download,
        mode: LaunchMode,
    ) -> EngineResult<JoinHandle<DownloadStatus>> {
        let control = Arc::new(ControlHandle::new());
        if !self
            .ctx
            .registry
            .try_register(&download.id, Arc::clone(&control))
        {
            return Err(EngineError::InvalidState {
                id: download.id,
                status: download.status,
            });
        }

        let mut patch = DownloadPatch::new()
            .status(DownloadStatus::Probing)
            .speed(0.0)
            .error_message(None);
        if mode == LaunchMode::Fresh {
            patch = patch
                .progress(0.0)
                .started_at(Some(Utc::now()))
                .completed_at(None);
        }

        if let Err(e) = self.ctx.store.update_download(&download.id, patch).await {
            self.ctx.registry.unregister_if(&download.id, &control);
            return Err(e.into());
        }

        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: download.id.clone(),
            status: DownloadStatus::Probing,
        });
        info!("🔄 Started download: {}", download.id);

        let coordinator = DownloadCoordinator::new(download.id, mode, control, self.ctx.clone());
        Ok(tokio::spawn(coordinator.run()))
    }

    pub async fn pause_download(&self, id: &str) -> EngineResult<()> {
        let download = self.ctx.store.get_download(id).await?;

        if let Some(control) = self.ctx.registry.get(id) {
            if control.is_cancelled() {
                return Err(EngineError::NotActive(id.to_string()));
            }
            if control.is_merging() {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    status: DownloadStatus::Merging,
                });
            }
            if !matches!(
                download.status,
                DownloadStatus::Probing | DownloadStatus::Downloading | DownloadStatus::Paused
            ) {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    status: download.status,
                });
            }

            control.pause();
            if let Err(e) = self.mark_paused(id).await {
                // 协调器已进入合并或终态，撤销暂停标志
                control.resume();
                return Err(e);
            }
            info!("⏸️ Paused download: {}", id);
            return Ok(());
        }

        match download.status {
            DownloadStatus::Probing | DownloadStatus::Downloading => {
                warn!("No running coordinator for {}, marking it paused", id);
                self.mark_paused(id).await
            }
            _ => Err(EngineError::NotActive(id.to_string())),
        }
    }

    async fn mark_paused(&self, id: &str) -> EngineResult<()> {
        let download = self
            .ctx
            .store
            .update_download(
                id,
                DownloadPatch::new().status(DownloadStatus::Paused).speed(0.0),
            )
            .await?;
        self.ctx
            .store
            .set_chunk_status(id, &[ChunkStatus::Active], ChunkStatus::Paused)
            .await?;
        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: id.to_string(),
            status: download.status,
        });
        Ok(())
    }

    /// Wake a paused coordinator, or relaunch from persisted chunk state when
    /// none is running (e.g. after a process restart)
    pub async fn resume_download(&self, id: &str) -> EngineResult<ResumeOutcome> {
        if let Some(control) = self.ctx.registry.get(id) {
            if control.is_cancelled() {
                return Err(EngineError::NotActive(id.to_string()));
            }

            if !control.is_paused() {
                return Ok(ResumeOutcome::InPlace);
            }

            // 先写状态再唤醒，协调器醒来时记录已是 downloading
            let download = self
                .ctx
                .store
                .update_download(id, DownloadPatch::new().status(DownloadStatus::Downloading))
                .await?;
            self.ctx
                .store
                .set_chunk_status(id, &[ChunkStatus::Paused], ChunkStatus::Active)
                .await?;
            control.resume();

            self.ctx.emit(DownloadEvent::StatusChanged {
                download_id: id.to_string(),
                status: download.status,
            });
            info!("▶️ Resumed download: {}", id);
            return Ok(ResumeOutcome::InPlace);
        }

        let download = self.ctx.store.get_download(id).await?;
        if download.status != DownloadStatus::Paused {
            return Err(EngineError::NotActive(id.to_string()));
        }

        info!("♻️ Restarting paused download: {}", id);
        let handle = self.launch(download, LaunchMode::Resume).await?;
        Ok(ResumeOutcome::Restarted(handle))
    }

    pub async fn cancel_download(&self, id: &str) -> EngineResult<()> {
        if let Some(control) = self.ctx.registry.get(id) {
            control.cancel();
            match self.mark_cancelled(id).await {
                Ok(()) => {}
                // 协调器先一步写入了 completed
                Err(EngineError::InvalidState { status, .. }) if status.is_terminal() => {
                    return Err(EngineError::NotActive(id.to_string()));
                }
                Err(e) => return Err(e),
            }
            info!("🚫 Cancelled download: {}", id);
            return Ok(());
        }

        let download = self.ctx.store.get_download(id).await?;
        if download.status.is_terminal() {
            return Err(EngineError::NotActive(id.to_string()));
        }

        self.mark_cancelled(id).await?;
        self.remove_artifacts(&download).await;
        info!("🚫 Cancelled inactive download: {}", id);
        Ok(())
    }

    async fn mark_cancelled(&self, id: &str) -> EngineResult<()> {
        let download = self
            .ctx
            .store
            .update_download(
                id,
                DownloadPatch::new()
                    .status(DownloadStatus::Cancelled)
                    .speed(0.0),
            )
            .await?;
        self.ctx
            .store
            .set_chunk_status(
                id,
                &[ChunkStatus::Active, ChunkStatus::Paused],
                ChunkStatus::Cancelled,
            )
            .await?;
        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: id.to_string(),
            status: download.status,
        });
        Ok(())
    }

    /// Put a failed or cancelled download back into the queue with a clean
    /// slate
    pub async fn requeue_download(&self, id: &str) -> EngineResult<Download> {
        let download = self.ctx.store.get_download(id).await?;
        if self.ctx.registry.contains(id)
            || !matches!(
                download.status,
                DownloadStatus::Failed | DownloadStatus::Cancelled
            )
        {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: download.status,
            });
        }

        self.ctx.store.delete_chunks(id).await?;
        self.remove_artifacts(&download).await;

        let download = self
            .ctx
            .store
            .update_download(
                id,
                DownloadPatch::new()
                    .status(DownloadStatus::Queued)
                    .progress(0.0)
                    .speed(0.0)
                    .error_message(None)
                    .file_path(None)
                    .started_at(None)
                    .completed_at(None),
            )
            .await?;

        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: id.to_string(),
            status: download.status,
        });
        info!("🔁 Requeued download: {}", id);
        Ok(download)
    }

    pub async fn get_download(&self, id: &str) -> EngineResult<Download> {
        Ok(self.ctx.store.get_download(id).await?)
    }

    pub async fn list_downloads(&self) -> EngineResult<Vec<Download>> {
        Ok(self.ctx.store.list_downloads().await?)
    }

    pub async fn list_chunks(&self, id: &str) -> EngineResult<Vec<ChunkRecord>> {
        Ok(self.ctx.store.list_chunks(id).await?)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.ctx.registry.contains(id)
    }

    /// Temp directory and staging file left behind by an interrupted run
    async fn remove_artifacts(&self, download: &Download) {
        let temp_dir = self.ctx.config.temp_dir_for(&download.id);
        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp directory {:?}: {}", temp_dir, e);
            }
        }

        let staging = staging_path(&self.ctx.config.destination_for(&download.name));
        remove_if_exists(&staging).await;
    }
}

fn build_client(config: &EngineConfig) -> EngineResult<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_str(name)
            .map_err(|e| EngineError::Config(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| EngineError::Config(format!("invalid value for header {}: {}", name, e)))?;
        headers.insert(name, value);
    }

    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .default_headers(headers);
    if config.timeout_seconds > 0 {
        builder = builder.timeout(Duration::from_secs(config.timeout_seconds));
    }

    debug!("Building HTTP client with user agent {}", config.user_agent);
    Ok(builder.build()?)
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
