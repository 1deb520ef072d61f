//! Per-download coordinator
//!
//! Owns one download from probing to its terminal state: plans chunks, runs
//! the chunk workers, folds their reports into download-level progress,
//! merges the chunk files and hands the result to post-processing.

use chrono::Utc;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::engine::{DownloadEvent, EventSender};
use crate::core::error_handling::{ChunkError, EngineError, EngineResult, MergeError, ProbeError};
use crate::core::merger::{chunk_file_path, merge_chunks, staging_path};
use crate::core::models::{ChunkRecord, ChunkStatus, Download, DownloadStatus, ProbeResult};
use crate::core::planner::plan_for_probe;
use crate::core::post_process::PostProcessor;
use crate::core::progress::aggregate;
use crate::core::prober::ResourceProber;
use crate::core::registry::{ControlHandle, DownloadRegistry};
use crate::core::store::{DownloadPatch, DownloadStore};
use crate::core::worker::{ChunkJob, ChunkReport, ChunkWorker, WorkerSettings};
use crate::utils::{classify_file_type, classify_source};

/// Everything a coordinator shares with the engine that spawned it
#[derive(Clone)]
pub struct CoordinatorContext {
    pub config: Arc<EngineConfig>,
    pub client: Client,
    pub store: Arc<dyn DownloadStore>,
    pub registry: Arc<DownloadRegistry>,
    pub post_processor: Arc<PostProcessor>,
    pub events: Option<EventSender>,
}

impl CoordinatorContext {
    pub(crate) fn emit(&self, event: DownloadEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Plan chunks from scratch
    Fresh,
    /// Reuse persisted chunk rows and partial chunk files where possible
    Resume,
}

/// Removes the temp directory on drop once armed, or whenever the download
/// was cancelled
struct TempDirGuard {
    dir: PathBuf,
    control: Arc<ControlHandle>,
    armed: bool,
    cleaned: bool,
}

impl TempDirGuard {
    fn new(dir: PathBuf, control: Arc<ControlHandle>) -> Self {
        Self {
            dir,
            control,
            armed: false,
            cleaned: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn should_clean(&self) -> bool {
        !self.cleaned && (self.armed || self.control.is_cancelled())
    }

    async fn clean(&mut self) {
        if !self.should_clean() {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp directory {:?}: {}", self.dir, e);
            }
        }
        self.cleaned = true;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.should_clean() {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

pub struct DownloadCoordinator {
    download_id: String,
    mode: LaunchMode,
    control: Arc<ControlHandle>,
    ctx: CoordinatorContext,
}

impl DownloadCoordinator {
    pub fn new(
        download_id: impl Into<String>,
        mode: LaunchMode,
        control: Arc<ControlHandle>,
        ctx: CoordinatorContext,
    ) -> Self {
        Self {
            download_id: download_id.into(),
            mode,
            control,
            ctx,
        }
    }

    /// Drive the download to a terminal (or paused) state and return it.
    /// The registry entry is always removed before this returns.
    pub async fn run(self) -> DownloadStatus {
        let temp_dir = self.ctx.config.temp_dir_for(&self.download_id);
        let mut guard = TempDirGuard::new(temp_dir.clone(), Arc::clone(&self.control));

        let status = match self.execute(&temp_dir).await {
            Ok(status) => status,
            Err(e) if e.is_cancelled() || self.control.is_cancelled() => {
                self.finish_cancelled(&mut guard).await
            }
            Err(e) => {
                guard.arm();
                self.finish_failed(e, &mut guard).await
            }
        };

        self.ctx
            .registry
            .unregister_if(&self.download_id, &self.control);
        status
    }

    async fn execute(&self, temp_dir: &Path) -> EngineResult<DownloadStatus> {
        let download = self.ctx.store.get_download(&self.download_id).await?;
        let probe = self.probe(&download).await?;

        let content_type = probe.content_type.clone();
        let file_type = classify_file_type(&download.url, content_type.as_deref());
        self.ctx
            .store
            .update_download(
                &self.download_id,
                DownloadPatch::new()
                    .size(probe.total_size)
                    .content_type(content_type)
                    .file_type(file_type)
                    .source(classify_source(&download.url)),
            )
            .await?;

        tokio::fs::create_dir_all(temp_dir).await?;
        let chunks = self.prepare_chunks(&probe, temp_dir).await?;
        let ranged = probe.allows_segmentation();

        info!(
            "📥 Downloading {} with {} chunk(s), size {} bytes",
            self.download_id,
            chunks.len(),
            probe.total_size
        );

        self.set_status(DownloadStatus::Downloading).await?;
        // 探测期间收到的暂停请求在这里补上
        if self.control.is_paused() {
            self.set_status(DownloadStatus::Paused).await?;
            if !self.control.is_paused() {
                self.set_status(DownloadStatus::Downloading).await?;
            }
        }

        self.run_workers(&download.url, chunks, ranged, temp_dir)
            .await?;

        let chunks = self.ctx.store.list_chunks(&self.download_id).await?;
        let completed = self.control.completed_chunks();
        if completed < chunks.len() || chunks.iter().any(|chunk| !chunk.is_completed()) {
            return Err(MergeError::Incomplete {
                completed,
                expected: chunks.len(),
            }
            .into());
        }

        self.enter_merging().await?;
        let destination = self.ctx.config.destination_for(&download.name);
        let total = merge_chunks(&chunks, temp_dir, &destination).await?;

        if self.control.is_cancelled() {
            remove_file_if_exists(&destination).await;
            return Err(ChunkError::Cancelled.into());
        }

        let completed = self
            .ctx
            .store
            .update_download(
                &self.download_id,
                DownloadPatch::new()
                    .status(DownloadStatus::Completed)
                    .size(total)
                    .progress(100.0)
                    .speed(0.0)
                    .file_path(Some(destination.clone()))
                    .completed_at(Some(Utc::now())),
            )
            .await;
        if let Err(e) = completed {
            // 合并后才落地的取消：不留下目标文件
            remove_file_if_exists(&destination).await;
            return Err(e.into());
        }
        self.ctx
            .registry
            .unregister_if(&self.download_id, &self.control);

        info!(
            "✅ Download completed: {} -> {:?}",
            self.download_id, destination
        );
        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: self.download_id.clone(),
            status: DownloadStatus::Completed,
        });
        self.ctx.emit(DownloadEvent::Completed {
            download_id: self.download_id.clone(),
            file_path: destination.clone(),
        });

        self.post_process(&destination).await;
        Ok(DownloadStatus::Completed)
    }

    /// Move to `merging`. A pause that was recorded after the last chunk
    /// finished holds the merge until the download is resumed or cancelled.
    async fn enter_merging(&self) -> EngineResult<()> {
        self.control.begin_merge();
        loop {
            match self.set_status(DownloadStatus::Merging).await {
                Ok(_) => return Ok(()),
                Err(EngineError::InvalidState {
                    status: DownloadStatus::Paused,
                    ..
                }) => {
                    debug!("{} paused before merging, waiting for resume", self.download_id);
                    self.control.wait_while_paused().await?;
                    tokio::time::sleep(self.ctx.config.progress_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn probe(&self, download: &Download) -> EngineResult<ProbeResult> {
        let prober = ResourceProber::new(self.ctx.client.clone());
        let probe = tokio::select! {
            biased;
            _ = self.control.cancelled() => return Err(ChunkError::Cancelled.into()),
            result = prober.probe(&download.url) => result?,
        };

        if download.size > 0 && probe.total_size != download.size {
            return Err(ProbeError::SizeChanged {
                expected: download.size,
                actual: probe.total_size,
            }
            .into());
        }

        debug!(
            "Probed {}: size={}, ranges={}",
            download.url, probe.total_size, probe.supports_ranges
        );
        Ok(probe)
    }

    /// Reuse persisted chunks on resume when they still describe the
    /// resource; otherwise plan fresh ones and drop any stale chunk files.
    async fn prepare_chunks(
        &self,
        probe: &ProbeResult,
        temp_dir: &Path,
    ) -> EngineResult<Vec<ChunkRecord>> {
        let existing = self.ctx.store.list_chunks(&self.download_id).await?;

        if self.mode == LaunchMode::Resume
            && probe.allows_segmentation()
            && covers_resource(&existing, probe.total_size)
        {
            let mut chunks = existing;
            for chunk in &mut chunks {
                if chunk.is_completed() {
                    let on_disk = file_len(&chunk_file_path(temp_dir, chunk.index)).await;
                    if on_disk == chunk.len() {
                        continue;
                    }
                    warn!(
                        "Chunk {} of {} is marked completed but its file is missing or short",
                        chunk.index, self.download_id
                    );
                }
                chunk.status = ChunkStatus::Active;
                chunk.speed = 0.0;
            }

            let done = chunks.iter().filter(|chunk| chunk.is_completed()).count();
            info!(
                "♻️ Resuming {} with {}/{} chunks already done",
                self.download_id,
                done,
                chunks.len()
            );
            self.ctx
                .store
                .replace_chunks(&self.download_id, chunks.clone())
                .await?;
            return Ok(chunks);
        }

        if !existing.is_empty() {
            debug!("Discarding {} stale chunk(s) of {}", existing.len(), self.download_id);
            if let Err(e) = tokio::fs::remove_dir_all(temp_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            tokio::fs::create_dir_all(temp_dir).await?;
        }

        let chunks = plan_for_probe(
            &self.download_id,
            probe,
            self.ctx.config.effective_threads(),
            self.ctx.config.min_chunk_size,
        );
        self.ctx
            .store
            .replace_chunks(&self.download_id, chunks.clone())
            .await?;
        Ok(chunks)
    }

    async fn run_workers(
        &self,
        url: &str,
        chunks: Vec<ChunkRecord>,
        ranged: bool,
        temp_dir: &Path,
    ) -> EngineResult<()> {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let worker = ChunkWorker::new(
            self.ctx.client.clone(),
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.control),
            report_tx,
            WorkerSettings::from_config(&self.ctx.config),
        );

        let mut view = chunks.clone();
        let mut workers = JoinSet::new();
        for chunk in chunks {
            if chunk.is_completed() {
                self.control.mark_chunk_completed();
                continue;
            }
            let job = ChunkJob {
                url: url.to_string(),
                path: chunk_file_path(temp_dir, chunk.index),
                chunk,
                ranged,
            };
            workers.spawn(worker.clone().run(job));
        }
        // 所有 worker 结束后报告通道随之关闭
        drop(worker);

        let mut failure: Option<ChunkError> = None;
        loop {
            tokio::select! {
                Some(report) = report_rx.recv() => {
                    apply_report(&mut view, &report);
                    self.refresh_progress(&view).await;
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(chunk))) => {
                        debug!("Chunk {} of {} finished", chunk.index, self.download_id);
                    }
                    Some(Ok(Err(e))) if e.is_cancelled() => {}
                    Some(Ok(Err(e))) => {
                        if failure.is_none() {
                            error!("Chunk failure in {}: {}", self.download_id, e);
                            failure = Some(e);
                            workers.abort_all();
                        }
                    }
                    Some(Err(join_error)) if join_error.is_cancelled() => {}
                    Some(Err(join_error)) => {
                        if failure.is_none() {
                            failure = Some(ChunkError::Aborted(join_error.to_string()));
                            workers.abort_all();
                        }
                    }
                }
            }
        }

        while let Ok(report) = report_rx.try_recv() {
            apply_report(&mut view, &report);
        }
        self.refresh_progress(&view).await;

        if let Some(e) = failure {
            return Err(e.into());
        }
        if self.control.is_cancelled() {
            return Err(ChunkError::Cancelled.into());
        }
        Ok(())
    }

    /// Recompute download progress and speed from the latest chunk states
    async fn refresh_progress(&self, chunks: &[ChunkRecord]) {
        let stats = aggregate(chunks);
        let speed = if self.control.is_paused() { 0.0 } else { stats.speed };
        let patch = DownloadPatch::new().progress(stats.progress).speed(speed);

        match self.ctx.store.update_download(&self.download_id, patch).await {
            Ok(download) => self.ctx.emit(DownloadEvent::Progress {
                download_id: self.download_id.clone(),
                progress: download.progress,
                speed: download.speed,
                downloaded: stats.downloaded,
                total: download.size,
            }),
            Err(e) => warn!("Failed to update progress of {}: {}", self.download_id, e),
        }
    }

    async fn set_status(&self, status: DownloadStatus) -> EngineResult<Download> {
        let download = self
            .ctx
            .store
            .update_download(&self.download_id, DownloadPatch::new().status(status))
            .await?;
        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: self.download_id.clone(),
            status: download.status,
        });
        Ok(download)
    }

    async fn post_process(&self, file_path: &Path) {
        if !self.ctx.post_processor.is_enabled() {
            return;
        }

        let outcome = self.ctx.post_processor.run(&self.download_id, file_path).await;

        let mut patch = DownloadPatch::new();
        if let Some(path) = outcome.file_path.clone() {
            patch = patch.file_path(Some(path));
        }
        if let Some(method) = outcome.encryption_method {
            patch = patch
                .encrypted(true)
                .encryption_method(Some(method.to_string()));
        }
        if let Some(cloud_path) = outcome.cloud_path.clone() {
            patch = patch.cloud_synced(true).cloud_path(Some(cloud_path));
        }

        if let Err(e) = self.ctx.store.update_download(&self.download_id, patch).await {
            warn!(
                "Failed to record post-processing result of {}: {}",
                self.download_id, e
            );
        }

        for failure in outcome.failures {
            self.ctx.emit(DownloadEvent::PostProcessFailed {
                download_id: self.download_id.clone(),
                error: failure,
            });
        }
    }

    async fn finish_cancelled(&self, guard: &mut TempDirGuard) -> DownloadStatus {
        info!("🚫 Download cancelled: {}", self.download_id);
        guard.clean().await;
        self.remove_staging_file().await;

        match self
            .ctx
            .store
            .update_download(
                &self.download_id,
                DownloadPatch::new()
                    .status(DownloadStatus::Cancelled)
                    .speed(0.0),
            )
            .await
        {
            Ok(download) => self.ctx.emit(DownloadEvent::StatusChanged {
                download_id: self.download_id.clone(),
                status: download.status,
            }),
            Err(e) => warn!("Failed to record cancellation of {}: {}", self.download_id, e),
        }

        if let Err(e) = self
            .ctx
            .store
            .set_chunk_status(
                &self.download_id,
                &[ChunkStatus::Active, ChunkStatus::Paused],
                ChunkStatus::Cancelled,
            )
            .await
        {
            warn!("Failed to cancel chunks of {}: {}", self.download_id, e);
        }

        DownloadStatus::Cancelled
    }

    async fn finish_failed(&self, error: EngineError, guard: &mut TempDirGuard) -> DownloadStatus {
        error!("❌ Download failed: {} - {}", self.download_id, error);
        guard.clean().await;
        self.remove_staging_file().await;

        let message = error.to_string();
        if let Err(e) = self
            .ctx
            .store
            .update_download(
                &self.download_id,
                DownloadPatch::new()
                    .status(DownloadStatus::Failed)
                    .speed(0.0)
                    .error_message(Some(message.clone())),
            )
            .await
        {
            warn!("Failed to record failure of {}: {}", self.download_id, e);
        }

        if let Err(e) = self
            .ctx
            .store
            .set_chunk_status(
                &self.download_id,
                &[ChunkStatus::Active, ChunkStatus::Paused],
                ChunkStatus::Cancelled,
            )
            .await
        {
            warn!("Failed to update chunks of {}: {}", self.download_id, e);
        }

        self.ctx.emit(DownloadEvent::StatusChanged {
            download_id: self.download_id.clone(),
            status: DownloadStatus::Failed,
        });
        self.ctx.emit(DownloadEvent::Failed {
            download_id: self.download_id.clone(),
            error: message,
        });

        DownloadStatus::Failed
    }

    async fn remove_staging_file(&self) {
        if let Ok(download) = self.ctx.store.get_download(&self.download_id).await {
            let destination = self.ctx.config.destination_for(&download.name);
            remove_file_if_exists(&staging_path(&destination)).await;
        }
    }
}

/// Fold a worker report into the coordinator's view of its chunks
fn apply_report(view: &mut [ChunkRecord], report: &ChunkReport) {
    if let Some(chunk) = view.iter_mut().find(|chunk| chunk.index == report.index) {
        chunk.status = report.status;
        chunk.progress = report.progress;
        chunk.speed = report.speed;
        chunk.downloaded = report.downloaded;
    }
}

/// Persisted chunks still partition `[0, total_size)` with known bounds
fn covers_resource(chunks: &[ChunkRecord], total_size: u64) -> bool {
    if chunks.is_empty() || total_size == 0 {
        return false;
    }

    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.start);

    let mut next = 0u64;
    for chunk in ordered {
        match chunk.end {
            Some(end) if chunk.start == next && end >= chunk.start => next = end + 1,
            _ => return false,
        }
    }
    next == total_size
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|metadata| metadata.len())
}

async fn remove_file_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ByteRange;

    fn chunks(bounds: &[(u64, u64)]) -> Vec<ChunkRecord> {
        bounds
            .iter()
            .enumerate()
            .map(|(index, &(start, end))| ChunkRecord::new("dl", index, ByteRange::new(start, end)))
            .collect()
    }

    #[test]
    fn test_covers_resource() {
        assert!(covers_resource(&chunks(&[(0, 499), (500, 999)]), 1000));
        assert!(covers_resource(&chunks(&[(500, 999), (0, 499)]), 1000));
        assert!(!covers_resource(&chunks(&[(0, 499), (600, 999)]), 1000));
        assert!(!covers_resource(&chunks(&[(0, 499), (500, 999)]), 2000));
        assert!(!covers_resource(&[], 1000));
        assert!(!covers_resource(&[ChunkRecord::open_ended("dl")], 1000));
    }

    #[test]
    fn test_apply_report_updates_matching_chunk() {
        let mut view = chunks(&[(0, 499), (500, 999)]);
        apply_report(
            &mut view,
            &ChunkReport {
                index: 1,
                status: ChunkStatus::Active,
                progress: 40.0,
                speed: 2048.0,
                downloaded: 200,
            },
        );

        assert_eq!(view[0].downloaded, 0);
        assert_eq!(view[1].downloaded, 200);
        assert_eq!(view[1].progress, 40.0);
        assert_eq!(aggregate(&view).speed, 2048.0);
        assert_eq!(aggregate(&view).downloaded, 200);
    }

    #[test]
    fn test_guard_cleans_only_when_armed_or_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("work");

        std::fs::create_dir_all(&temp).unwrap();
        drop(TempDirGuard::new(temp.clone(), Arc::new(ControlHandle::new())));
        assert!(temp.exists());

        let mut guard = TempDirGuard::new(temp.clone(), Arc::new(ControlHandle::new()));
        guard.arm();
        drop(guard);
        assert!(!temp.exists());

        std::fs::create_dir_all(&temp).unwrap();
        let control = Arc::new(ControlHandle::new());
        control.cancel();
        drop(TempDirGuard::new(temp.clone(), control));
        assert!(!temp.exists());
    }
}
