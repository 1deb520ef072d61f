//! Chunk worker: streams one byte range into its own temp file

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::config::EngineConfig;
use crate::core::error_handling::{ChunkError, RetryPolicy};
use crate::core::models::{ChunkRecord, ChunkStatus};
use crate::core::progress::{chunk_progress, SpeedSampler};
use crate::core::registry::ControlHandle;
use crate::core::store::DownloadStore;

/// Progress notification sent to the coordinator after each chunk row write
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub index: usize,
    pub status: ChunkStatus,
    pub progress: f64,
    pub speed: f64,
    pub downloaded: u64,
}

/// One unit of work for a worker
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub url: String,
    pub chunk: ChunkRecord,
    pub path: PathBuf,
    /// Send a Range header and insist on 206
    pub ranged: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub buffer_size: usize,
    pub progress_interval: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            progress_interval: config.progress_interval(),
            retry: config.retry.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ChunkWorker {
    client: Client,
    store: Arc<dyn DownloadStore>,
    control: Arc<ControlHandle>,
    reports: mpsc::UnboundedSender<ChunkReport>,
    settings: WorkerSettings,
}

impl ChunkWorker {
    pub fn new(
        client: Client,
        store: Arc<dyn DownloadStore>,
        control: Arc<ControlHandle>,
        reports: mpsc::UnboundedSender<ChunkReport>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            client,
            store,
            control,
            reports,
            settings,
        }
    }

    /// Download the chunk, retrying transient failures per the retry policy.
    /// The final chunk row is written before returning.
    pub async fn run(self, job: ChunkJob) -> Result<ChunkRecord, ChunkError> {
        let ChunkJob {
            url,
            mut chunk,
            path,
            ranged,
        } = job;
        let mut attempt = 0u32;

        let result = loop {
            match self.transfer(&url, &mut chunk, &path, ranged).await {
                Ok(()) => break Ok(()),
                Err(e)
                    if e.is_retryable()
                        && attempt < self.settings.retry.max_attempts
                        && !self.control.is_cancelled() =>
                {
                    attempt += 1;
                    let delay = self.settings.retry.delay_for(attempt);
                    warn!(
                        "Chunk {} of {} failed ({}), retry {}/{} in {:?}",
                        chunk.index,
                        chunk.download_id,
                        e,
                        attempt,
                        self.settings.retry.max_attempts,
                        delay
                    );

                    chunk.speed = 0.0;
                    tokio::select! {
                        _ = self.control.cancelled() => break Err(ChunkError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        chunk.speed = 0.0;
        match result {
            Ok(()) => {
                chunk.status = ChunkStatus::Completed;
                chunk.progress = 100.0;
                self.publish(&chunk).await;
                let completed = self.control.mark_chunk_completed();
                debug!(
                    "Chunk {} of {} completed ({} done)",
                    chunk.index, chunk.download_id, completed
                );
                Ok(chunk)
            }
            Err(e) => {
                chunk.status = if e.is_cancelled() {
                    ChunkStatus::Cancelled
                } else {
                    ChunkStatus::Error
                };
                self.publish(&chunk).await;
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        url: &str,
        chunk: &mut ChunkRecord,
        path: &Path,
        ranged: bool,
    ) -> Result<(), ChunkError> {
        let index = chunk.index;
        let io_err = |e| ChunkError::io(index, e);

        // 暂停期间不建立新连接
        self.suspend_if_paused(chunk).await?;

        let expected = chunk.len();
        let mut existing = existing_len(path).await.map_err(io_err)?;

        // 不支持区间续传，或旧文件比区间还大时从头开始
        if !ranged || expected.is_some_and(|len| existing > len) {
            existing = 0;
        }

        chunk.downloaded = existing;
        chunk.progress = chunk_progress(existing, expected);

        if ranged && expected == Some(existing) {
            return Ok(());
        }

        let mut request = self.client.get(url);
        if ranged {
            let start = chunk.start + existing;
            let range = match chunk.end {
                Some(end) => format!("bytes={}-{}", start, end),
                None => format!("bytes={}-", start),
            };
            debug!("Chunk {} requesting {}", index, range);
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            biased;
            _ = self.control.cancelled() => return Err(ChunkError::Cancelled),
            response = request.send() => {
                response.map_err(|e| ChunkError::transfer(index, e.to_string(), true))?
            }
        };

        let status = response.status();
        if ranged && status != StatusCode::PARTIAL_CONTENT {
            return Err(ChunkError::transfer(
                index,
                format!("expected 206 for ranged request, got {}", status),
                status.is_server_error(),
            ));
        }
        if !status.is_success() {
            return Err(ChunkError::transfer(
                index,
                format!("HTTP error: {}", status),
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            ));
        }

        let progress_len = expected.or_else(|| response.content_length().filter(|len| *len > 0));

        let file = if existing > 0 {
            OpenOptions::new().append(true).open(path).await
        } else {
            File::create(path).await
        }
        .map_err(io_err)?;

        let mut writer = BufWriter::with_capacity(self.settings.buffer_size, file);
        let mut stream = response.bytes_stream();
        let mut sampler = SpeedSampler::new(chunk.downloaded, self.settings.progress_interval);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.control.cancelled() => return Err(ChunkError::Cancelled),
                next = stream.next() => next,
            };

            let Some(item) = next else {
                break;
            };
            let bytes = item.map_err(|e| ChunkError::transfer(index, e.to_string(), true))?;

            if let Some(len) = expected {
                if chunk.downloaded + bytes.len() as u64 > len {
                    return Err(ChunkError::transfer(
                        index,
                        format!("server sent more than the {} requested bytes", len),
                        false,
                    ));
                }
            }

            writer.write_all(&bytes).await.map_err(io_err)?;
            chunk.downloaded += bytes.len() as u64;

            if let Some(speed) = sampler.sample(chunk.downloaded) {
                chunk.progress = chunk_progress(chunk.downloaded, progress_len);
                chunk.speed = speed;
                self.publish(chunk).await;
            }

            if self.control.is_paused() {
                writer.flush().await.map_err(io_err)?;
                chunk.progress = chunk_progress(chunk.downloaded, progress_len);
                self.suspend_if_paused(chunk).await?;
                sampler.reset(chunk.downloaded);
            }
        }

        writer.flush().await.map_err(io_err)?;
        writer.get_ref().sync_all().await.map_err(io_err)?;

        if let Some(len) = expected {
            if chunk.downloaded != len {
                return Err(ChunkError::transfer(
                    index,
                    format!("received {} of {} bytes", chunk.downloaded, len),
                    true,
                ));
            }
        }

        Ok(())
    }

    /// Park the worker until resumed. The connection, if any, stays open.
    async fn suspend_if_paused(&self, chunk: &mut ChunkRecord) -> Result<(), ChunkError> {
        if self.control.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        if !self.control.is_paused() {
            return Ok(());
        }

        chunk.status = ChunkStatus::Paused;
        chunk.speed = 0.0;
        self.publish(chunk).await;
        debug!(
            "Chunk {} of {} paused at {} bytes",
            chunk.index, chunk.download_id, chunk.downloaded
        );

        self.control.wait_while_paused().await?;

        chunk.status = ChunkStatus::Active;
        self.publish(chunk).await;
        Ok(())
    }

    /// Persist the chunk row, then notify the coordinator
    async fn publish(&self, chunk: &ChunkRecord) {
        if let Err(e) = self.store.update_chunk(chunk).await {
            warn!(
                "Failed to persist chunk {} of {}: {}",
                chunk.index, chunk.download_id, e
            );
        }

        let _ = self.reports.send(ChunkReport {
            index: chunk.index,
            status: chunk.status,
            progress: chunk.progress,
            speed: chunk.speed,
            downloaded: chunk.downloaded,
        });
    }
}

async fn existing_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ByteRange, Download};
    use crate::core::store::MemoryStore;
    use crate::core::test_support::{received_ranges, test_body, RangeResponder};
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer};

    struct Fixture {
        server: MockServer,
        store: Arc<MemoryStore>,
        control: Arc<ControlHandle>,
        dir: TempDir,
        download_id: String,
        body: Vec<u8>,
    }

    async fn fixture(responder: impl Fn(Vec<u8>) -> RangeResponder) -> Fixture {
        let body = test_body(1000);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(responder(body.clone()))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let download = Download::new(format!("{}/file.bin", server.uri()), "file.bin");
        let download_id = download.id.clone();
        store.insert_download(download).await.unwrap();

        Fixture {
            server,
            store,
            control: Arc::new(ControlHandle::new()),
            dir: tempdir().unwrap(),
            download_id,
            body,
        }
    }

    impl Fixture {
        async fn job(&self, range: ByteRange) -> ChunkJob {
            let chunk = ChunkRecord::new(&self.download_id, 1, range);
            self.store
                .replace_chunks(&self.download_id, vec![chunk.clone()])
                .await
                .unwrap();

            ChunkJob {
                url: format!("{}/file.bin", self.server.uri()),
                chunk,
                path: self.dir.path().join("chunk-1"),
                ranged: true,
            }
        }

        fn worker(&self, retry: RetryPolicy) -> (ChunkWorker, mpsc::UnboundedReceiver<ChunkReport>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let store: Arc<dyn DownloadStore> = self.store.clone();
            let worker = ChunkWorker::new(
                Client::new(),
                store,
                Arc::clone(&self.control),
                tx,
                WorkerSettings {
                    buffer_size: 64 * 1024,
                    progress_interval: Duration::ZERO,
                    retry,
                },
            );
            (worker, rx)
        }
    }

    #[tokio::test]
    async fn test_downloads_requested_range() {
        let fx = fixture(RangeResponder::new).await;
        let job = fx.job(ByteRange::new(250, 499)).await;
        let path = job.path.clone();
        let (worker, mut rx) = fx.worker(RetryPolicy::default());

        let chunk = worker.run(job).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert_eq!(chunk.downloaded, 250);
        assert_eq!(std::fs::read(&path).unwrap(), fx.body[250..500].to_vec());

        let row = &fx.store.list_chunks(&fx.download_id).await.unwrap()[0];
        assert_eq!(row.status, ChunkStatus::Completed);
        assert_eq!(row.progress, 100.0);

        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report);
        }
        assert_eq!(last.unwrap().status, ChunkStatus::Completed);
        assert_eq!(fx.control.completed_chunks(), 1);
    }

    #[tokio::test]
    async fn test_resumes_from_partial_file() {
        let fx = fixture(RangeResponder::new).await;
        let job = fx.job(ByteRange::new(250, 499)).await;
        std::fs::write(&job.path, &fx.body[250..300]).unwrap();
        let path = job.path.clone();
        let (worker, _rx) = fx.worker(RetryPolicy::default());

        worker.run(job).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), fx.body[250..500].to_vec());
        assert_eq!(received_ranges(&fx.server).await, vec!["bytes=300-499"]);
    }

    #[tokio::test]
    async fn test_complete_file_skips_request() {
        let fx = fixture(RangeResponder::new).await;
        let job = fx.job(ByteRange::new(0, 99)).await;
        std::fs::write(&job.path, &fx.body[0..100]).unwrap();
        let (worker, _rx) = fx.worker(RetryPolicy::default());

        let chunk = worker.run(job).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert!(received_ranges(&fx.server).await.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_range_is_an_error() {
        let fx = fixture(|body| RangeResponder::new(body).without_ranges()).await;
        let job = fx.job(ByteRange::new(250, 499)).await;
        let (worker, _rx) = fx.worker(RetryPolicy::default());

        let err = worker.run(job).await.unwrap_err();
        assert!(matches!(err, ChunkError::Transfer { index: 1, .. }));
        assert!(!err.is_retryable());

        let row = &fx.store.list_chunks(&fx.download_id).await.unwrap()[0];
        assert_eq!(row.status, ChunkStatus::Error);
    }

    #[tokio::test]
    async fn test_unranged_accepts_full_body() {
        let fx = fixture(|body| RangeResponder::new(body).without_ranges()).await;
        let mut job = fx.job(ByteRange::new(0, 999)).await;
        job.ranged = false;
        let path = job.path.clone();
        let (worker, _rx) = fx.worker(RetryPolicy::default());

        worker.run(job).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), fx.body);
    }

    #[tokio::test]
    async fn test_cancelled_worker_reports_cancelled() {
        let fx = fixture(|body| RangeResponder::new(body).with_delay(Duration::from_secs(5))).await;
        let job = fx.job(ByteRange::new(0, 249)).await;
        let (worker, _rx) = fx.worker(RetryPolicy::default());

        let control = Arc::clone(&fx.control);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            control.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), worker.run(job))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());

        let row = &fx.store.list_chunks(&fx.download_id).await.unwrap()[0];
        assert_eq!(row.status, ChunkStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let fx = fixture(|body| RangeResponder::new(body).failing_at(500)).await;
        let job = fx.job(ByteRange::new(500, 749)).await;
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        let (worker, _rx) = fx.worker(retry);

        let err = worker.run(job).await.unwrap_err();
        assert!(matches!(err, ChunkError::Transfer { .. }));
        assert_eq!(received_ranges(&fx.server).await.len(), 3);
    }
}
