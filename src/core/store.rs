//! Persistence for download and chunk records
//!
//! Download rows are updated through [`DownloadPatch`] so concurrent writers
//! touching different fields never overwrite each other. Chunk rows are
//! written one at a time by their owning worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::error_handling::StoreError;
use crate::core::models::{
    ChunkRecord, ChunkStatus, Download, DownloadSource, DownloadStatus, FileType,
};

#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn insert_download(&self, download: Download) -> Result<(), StoreError>;

    async fn get_download(&self, id: &str) -> Result<Download, StoreError>;

    async fn list_downloads(&self) -> Result<Vec<Download>, StoreError>;

    /// Apply `patch` atomically and return the updated row
    async fn update_download(&self, id: &str, patch: DownloadPatch)
        -> Result<Download, StoreError>;

    /// Remove a download together with its chunks
    async fn delete_download(&self, id: &str) -> Result<(), StoreError>;

    async fn replace_chunks(
        &self,
        download_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), StoreError>;

    /// Chunks ordered by index
    async fn list_chunks(&self, download_id: &str) -> Result<Vec<ChunkRecord>, StoreError>;

    /// Overwrite the row identified by `(download_id, index)`
    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError>;

    /// Move every chunk whose status is in `from` to `to`, returning the count
    async fn set_chunk_status(
        &self,
        download_id: &str,
        from: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<usize, StoreError>;

    async fn delete_chunks(&self, download_id: &str) -> Result<(), StoreError>;
}

/// Field-level update of a download row.
///
/// A status change the current status does not allow rejects the whole
/// patch, so writers can tell they lost a race. Size is only written while
/// still 0. Progress never goes backwards while the download is
/// `downloading`.
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub status: Option<DownloadStatus>,
    pub size: Option<u64>,
    pub progress: Option<f64>,
    pub speed: Option<f64>,
    pub content_type: Option<Option<String>>,
    pub file_type: Option<FileType>,
    pub source: Option<DownloadSource>,
    pub file_path: Option<Option<PathBuf>>,
    pub encrypted: Option<bool>,
    pub encryption_method: Option<Option<String>>,
    pub cloud_synced: Option<bool>,
    pub cloud_path: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl DownloadPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: DownloadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn file_type(mut self, file_type: FileType) -> Self {
        self.file_type = Some(file_type);
        self
    }

    pub fn source(mut self, source: DownloadSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn file_path(mut self, file_path: Option<PathBuf>) -> Self {
        self.file_path = Some(file_path);
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = Some(encrypted);
        self
    }

    pub fn encryption_method(mut self, method: Option<String>) -> Self {
        self.encryption_method = Some(method);
        self
    }

    pub fn cloud_synced(mut self, cloud_synced: bool) -> Self {
        self.cloud_synced = Some(cloud_synced);
        self
    }

    pub fn cloud_path(mut self, cloud_path: Option<String>) -> Self {
        self.cloud_path = Some(cloud_path);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn apply(self, download: &mut Download) -> Result<(), StoreError> {
        if let Some(status) = self.status {
            if !download.status.can_transition_to(status) {
                debug!(
                    "Rejecting status change {} -> {} for {}",
                    download.status, status, download.id
                );
                return Err(StoreError::InvalidTransition {
                    id: download.id.clone(),
                    from: download.status,
                    to: status,
                });
            }
            download.status = status;
        }

        if let Some(size) = self.size {
            if download.size == 0 {
                download.size = size;
            } else if download.size != size {
                warn!(
                    "Ignoring size change {} -> {} for {}",
                    download.size, size, download.id
                );
            }
        }

        if let Some(progress) = self.progress {
            let progress = progress.clamp(0.0, 100.0);
            let regresses = progress < download.progress;
            if !(regresses && download.status == DownloadStatus::Downloading) {
                download.progress = progress;
            }
        }

        if let Some(speed) = self.speed {
            download.speed = speed.max(0.0);
        }
        if let Some(content_type) = self.content_type {
            download.content_type = content_type;
        }
        if let Some(file_type) = self.file_type {
            download.file_type = Some(file_type);
        }
        if let Some(source) = self.source {
            download.source = Some(source);
        }
        if let Some(file_path) = self.file_path {
            download.file_path = file_path;
        }
        if let Some(encrypted) = self.encrypted {
            download.encrypted = encrypted;
        }
        if let Some(method) = self.encryption_method {
            download.encryption_method = method;
        }
        if let Some(cloud_synced) = self.cloud_synced {
            download.cloud_synced = cloud_synced;
        }
        if let Some(cloud_path) = self.cloud_path {
            download.cloud_path = cloud_path;
        }
        if let Some(message) = self.error_message {
            download.error_message = message;
        }
        if let Some(at) = self.started_at {
            download.started_at = at;
        }
        if let Some(at) = self.completed_at {
            download.completed_at = at;
        }

        download.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDownload {
    download: Download,
    chunks: Vec<ChunkRecord>,
}

/// Synchronous core shared by both store implementations
#[derive(Debug, Default)]
struct RecordTable {
    records: HashMap<String, StoredDownload>,
}

impl RecordTable {
    fn entry(&self, id: &str) -> Result<&StoredDownload, StoreError> {
        self.records
            .get(id)
            .ok_or_else(|| StoreError::DownloadNotFound(id.to_string()))
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut StoredDownload, StoreError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| StoreError::DownloadNotFound(id.to_string()))
    }

    fn insert(&mut self, download: Download) -> Result<(), StoreError> {
        if self.records.contains_key(&download.id) {
            return Err(StoreError::DuplicateDownload(download.id));
        }
        self.records.insert(
            download.id.clone(),
            StoredDownload {
                download,
                chunks: Vec::new(),
            },
        );
        Ok(())
    }

    fn list(&self) -> Vec<Download> {
        let mut downloads: Vec<Download> = self
            .records
            .values()
            .map(|stored| stored.download.clone())
            .collect();
        downloads.sort_by_key(|download| download.created_at);
        downloads
    }

    fn update(&mut self, id: &str, patch: DownloadPatch) -> Result<Download, StoreError> {
        let stored = self.entry_mut(id)?;
        patch.apply(&mut stored.download)?;
        Ok(stored.download.clone())
    }

    fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::DownloadNotFound(id.to_string()))
    }

    fn replace_chunks(&mut self, id: &str, mut chunks: Vec<ChunkRecord>) -> Result<(), StoreError> {
        chunks.sort_by_key(|chunk| chunk.index);
        self.entry_mut(id)?.chunks = chunks;
        Ok(())
    }

    fn chunks(&self, id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        Ok(self.entry(id)?.chunks.clone())
    }

    fn update_chunk(&mut self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        let stored = self.entry_mut(&chunk.download_id)?;
        let row = stored
            .chunks
            .iter_mut()
            .find(|row| row.index == chunk.index)
            .ok_or_else(|| StoreError::ChunkNotFound {
                download_id: chunk.download_id.clone(),
                index: chunk.index,
            })?;

        *row = chunk.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    fn set_chunk_status(
        &mut self,
        id: &str,
        from: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<usize, StoreError> {
        let stored = self.entry_mut(id)?;
        let now = Utc::now();
        let mut changed = 0;

        for chunk in stored
            .chunks
            .iter_mut()
            .filter(|chunk| from.contains(&chunk.status))
        {
            chunk.status = to;
            if to != ChunkStatus::Active {
                chunk.speed = 0.0;
            }
            chunk.updated_at = now;
            changed += 1;
        }

        Ok(changed)
    }
}

/// Process-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<RecordTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn insert_download(&self, download: Download) -> Result<(), StoreError> {
        self.table.write().insert(download)
    }

    async fn get_download(&self, id: &str) -> Result<Download, StoreError> {
        Ok(self.table.read().entry(id)?.download.clone())
    }

    async fn list_downloads(&self) -> Result<Vec<Download>, StoreError> {
        Ok(self.table.read().list())
    }

    async fn update_download(
        &self,
        id: &str,
        patch: DownloadPatch,
    ) -> Result<Download, StoreError> {
        self.table.write().update(id, patch)
    }

    async fn delete_download(&self, id: &str) -> Result<(), StoreError> {
        self.table.write().remove(id)
    }

    async fn replace_chunks(
        &self,
        download_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), StoreError> {
        self.table.write().replace_chunks(download_id, chunks)
    }

    async fn list_chunks(&self, download_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        self.table.read().chunks(download_id)
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        self.table.write().update_chunk(chunk)
    }

    async fn set_chunk_status(
        &self,
        download_id: &str,
        from: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<usize, StoreError> {
        self.table.write().set_chunk_status(download_id, from, to)
    }

    async fn delete_chunks(&self, download_id: &str) -> Result<(), StoreError> {
        self.table.write().replace_chunks(download_id, Vec::new())
    }
}

/// Store that keeps one `<id>.json` file per download, so records survive
/// a restart
pub struct JsonFileStore {
    dir: PathBuf,
    table: RwLock<RecordTable>,
    // 串行化落盘，保证文件内容与内存顺序一致
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open `dir`, loading every record already in it
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut table = RecordTable::default();
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<StoredDownload>(&content) {
                Ok(stored) => {
                    table.records.insert(stored.download.id.clone(), stored);
                }
                Err(e) => warn!("Skipping unreadable record {:?}: {}", path, e),
            }
        }

        debug!("Loaded {} download records from {:?}", table.records.len(), dir);

        Ok(Self {
            dir,
            table: RwLock::new(table),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Run `mutate` on the table, then write the affected record to disk
    async fn persist_with<T, F>(&self, id: &str, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RecordTable) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;

        let (value, snapshot) = {
            let mut table = self.table.write();
            let value = mutate(&mut table)?;
            (value, table.records.get(id).cloned())
        };

        let path = self.record_path(id);
        match snapshot {
            Some(stored) => {
                let content = serde_json::to_vec_pretty(&stored)?;
                let staging = self.dir.join(format!("{}.json.tmp", id));
                tokio::fs::write(&staging, content).await?;
                tokio::fs::rename(&staging, &path).await?;
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }

        Ok(value)
    }
}

#[async_trait]
impl DownloadStore for JsonFileStore {
    async fn insert_download(&self, download: Download) -> Result<(), StoreError> {
        let id = download.id.clone();
        self.persist_with(&id, move |table| table.insert(download))
            .await
    }

    async fn get_download(&self, id: &str) -> Result<Download, StoreError> {
        Ok(self.table.read().entry(id)?.download.clone())
    }

    async fn list_downloads(&self) -> Result<Vec<Download>, StoreError> {
        Ok(self.table.read().list())
    }

    async fn update_download(
        &self,
        id: &str,
        patch: DownloadPatch,
    ) -> Result<Download, StoreError> {
        self.persist_with(id, move |table| table.update(id, patch))
            .await
    }

    async fn delete_download(&self, id: &str) -> Result<(), StoreError> {
        self.persist_with(id, |table| table.remove(id)).await
    }

    async fn replace_chunks(
        &self,
        download_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), StoreError> {
        self.persist_with(download_id, move |table| {
            table.replace_chunks(download_id, chunks)
        })
        .await
    }

    async fn list_chunks(&self, download_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        self.table.read().chunks(download_id)
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        self.persist_with(&chunk.download_id, |table| table.update_chunk(chunk))
            .await
    }

    async fn set_chunk_status(
        &self,
        download_id: &str,
        from: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<usize, StoreError> {
        self.persist_with(download_id, |table| {
            table.set_chunk_status(download_id, from, to)
        })
        .await
    }

    async fn delete_chunks(&self, download_id: &str) -> Result<(), StoreError> {
        self.persist_with(download_id, |table| {
            table.replace_chunks(download_id, Vec::new())
        })
        .await
    }
}
