//! Shared helpers for tests that need a local HTTP server

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::core::error_handling::StoreError;
use crate::core::models::{ChunkRecord, ChunkStatus, Download, DownloadStatus};
use crate::core::store::{DownloadPatch, DownloadStore, MemoryStore};

/// Deterministic body whose bytes differ between neighbouring offsets
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves a fixed body, honouring `Range: bytes=a-b` with 206 responses
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    supports_ranges: bool,
    delay: Option<Duration>,
    fail_at_start: Option<u64>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            supports_ranges: true,
            delay: None,
            fail_at_start: None,
        }
    }

    /// Ignore Range headers and always answer 200 with the full body
    pub fn without_ranges(mut self) -> Self {
        self.supports_ranges = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer 500 to ranged requests starting at `start`
    pub fn failing_at(mut self, start: u64) -> Self {
        self.fail_at_start = Some(start);
        self
    }

    pub fn supports_ranges(&self) -> bool {
        self.supports_ranges
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }
}

pub fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let bounds = value.trim().strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range_header);

        let template = match range {
            Some((start, _)) if self.supports_ranges && self.fail_at_start == Some(start) => {
                ResponseTemplate::new(500)
            }
            Some((start, end)) if self.supports_ranges => {
                let end = end.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1));
                if len == 0 || start > end {
                    ResponseTemplate::new(416)
                        .insert_header("content-range", format!("bytes */{}", len))
                } else {
                    ResponseTemplate::new(206)
                        .insert_header("accept-ranges", "bytes")
                        .insert_header(
                            "content-range",
                            format!("bytes {}-{}/{}", start, end, len),
                        )
                        .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
                }
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
        };

        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Mount HEAD and GET handlers for `route` on the server
pub async fn mount_resource(server: &MockServer, route: &str, responder: RangeResponder) {
    let accept_ranges = if responder.supports_ranges() {
        "bytes"
    } else {
        "none"
    };

    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", accept_ranges)
                .insert_header("content-length", responder.len().to_string())
                .set_body_bytes(vec![0u8; responder.len()]),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// `Range` headers of every GET the server received, in arrival order.
/// The `bytes=0-0` size request is left out.
pub async fn received_ranges(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.method.as_str() == "GET")
        .filter_map(|request| {
            request
                .headers
                .get("range")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .filter(|range| range != "bytes=0-0")
        .collect()
}

#[derive(Default)]
struct StallState {
    ranges: Mutex<Vec<String>>,
    released: AtomicBool,
    release: Notify,
}

impl StallState {
    async fn wait_for_release(&self) {
        loop {
            let notified = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Bare HTTP/1.1 server that answers each ranged GET with the first `head`
/// bytes of the range (in two writes, 40ms apart) and then holds the
/// connection until [`StallingServer::release`] is called. Leaves real
/// partial chunk files on disk while a download is in flight.
pub struct StallingServer {
    addr: SocketAddr,
    state: Arc<StallState>,
    task: JoinHandle<()>,
}

impl StallingServer {
    pub async fn start(body: Vec<u8>, head: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StallState::default());
        let body = Arc::new(body);

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    let body = Arc::clone(&body);
                    tokio::spawn(async move {
                        let _ = serve_stalling(stream, &body, head, &state).await;
                    });
                }
            })
        };

        Self { addr, state, task }
    }

    pub fn url(&self, route: &str) -> String {
        format!("http://{}{}", self.addr, route)
    }

    /// Let every held and future response finish
    pub fn release(&self) {
        self.state.released.store(true, Ordering::SeqCst);
        self.state.release.notify_waiters();
    }

    /// `Range` headers received so far, in arrival order
    pub fn ranges(&self) -> Vec<String> {
        self.state.ranges.lock().clone()
    }
}

impl Drop for StallingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stalling(
    mut stream: TcpStream,
    body: &[u8],
    head: usize,
    state: &StallState,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }

    let request = String::from_utf8_lossy(&request).into_owned();
    let mut lines = request.lines();
    let verb = lines
        .next()
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or_default()
        .to_string();
    let range = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });

    let len = body.len() as u64;
    if verb == "HEAD" {
        let header = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\naccept-ranges: bytes\r\nconnection: close\r\n\r\n",
            len
        );
        stream.write_all(header.as_bytes()).await?;
        return stream.shutdown().await;
    }

    let Some((start, end)) = range.as_deref().and_then(parse_range_header) else {
        let header = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            len
        );
        stream.write_all(header.as_bytes()).await?;
        stream.write_all(body).await?;
        return stream.shutdown().await;
    };

    if let Some(range) = &range {
        state.ranges.lock().push(range.clone());
    }

    let end = end.unwrap_or(len - 1).min(len - 1);
    let slice = &body[start as usize..=end as usize];
    let header = format!(
        "HTTP/1.1 206 Partial Content\r\ncontent-length: {}\r\ncontent-range: bytes {}-{}/{}\r\naccept-ranges: bytes\r\nconnection: close\r\n\r\n",
        slice.len(),
        start,
        end,
        len
    );
    stream.write_all(header.as_bytes()).await?;

    let head = head.min(slice.len());
    let split = head / 2;
    stream.write_all(&slice[..split]).await?;
    stream.flush().await?;
    tokio::time::sleep(Duration::from_millis(40)).await;
    stream.write_all(&slice[split..head]).await?;
    stream.flush().await?;

    state.wait_for_release().await;
    stream.write_all(&slice[head..]).await?;
    stream.shutdown().await
}

/// Store that parks the first update writing `gate` as its status until
/// [`GatedStore::release`] is called. Every other call goes straight to the
/// wrapped [`MemoryStore`].
pub struct GatedStore {
    inner: MemoryStore,
    gate: DownloadStatus,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedStore {
    pub fn new(gate: DownloadStatus) -> Self {
        Self {
            inner: MemoryStore::new(),
            gate,
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }

    /// The wrapped store, for writes that must bypass the gate
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Resolves once the gated write is parked
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl DownloadStore for GatedStore {
    async fn insert_download(&self, download: Download) -> Result<(), StoreError> {
        self.inner.insert_download(download).await
    }

    async fn get_download(&self, id: &str) -> Result<Download, StoreError> {
        self.inner.get_download(id).await
    }

    async fn list_downloads(&self) -> Result<Vec<Download>, StoreError> {
        self.inner.list_downloads().await
    }

    async fn update_download(
        &self,
        id: &str,
        patch: DownloadPatch,
    ) -> Result<Download, StoreError> {
        if patch.status == Some(self.gate) && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.update_download(id, patch).await
    }

    async fn delete_download(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_download(id).await
    }

    async fn replace_chunks(
        &self,
        download_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), StoreError> {
        self.inner.replace_chunks(download_id, chunks).await
    }

    async fn list_chunks(&self, download_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        self.inner.list_chunks(download_id).await
    }

    async fn update_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        self.inner.update_chunk(chunk).await
    }

    async fn set_chunk_status(
        &self,
        download_id: &str,
        from: &[ChunkStatus],
        to: ChunkStatus,
    ) -> Result<usize, StoreError> {
        self.inner.set_chunk_status(download_id, from, to).await
    }

    async fn delete_chunks(&self, download_id: &str) -> Result<(), StoreError> {
        self.inner.delete_chunks(download_id).await
    }
}
