use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TransferProgress, TransferRequest};
use crate::error::{Error, Result};
use crate::jobs::{StopToken, checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Running,
    Completed,
    Cancelled,
    Error,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferState::Running)
    }
}

/// A transfer started by a [`TransferEngine`]; readable from any thread.
pub trait Transfer: Send + Sync {
    fn state(&self) -> TransferState;

    /// Bytes per second since the transfer started.
    fn average_speed(&self) -> f64;

    /// True if the whole body arrived and is held in memory.
    fn is_fully_buffered(&self) -> bool;

    /// Hands over the in-memory body, if it was fully buffered.
    fn take_buffer(&self) -> Option<Bytes>;

    fn error(&self) -> Option<String>;

    fn error_code(&self) -> Option<u16>;

    fn cancel(&self);
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Starts a short speed-test transfer. It runs in the background and
    /// reports `Completed` once it has sampled long enough or read the body.
    fn start_speed_test(&self, request: TransferRequest) -> Box<dyn Transfer>;

    /// Lightweight reachability check.
    async fn is_available(&self, request: &TransferRequest) -> Result<bool>;

    /// Streams the whole file to `output_path`, checking `stop` between chunks.
    async fn download_to(
        &self,
        request: &TransferRequest,
        output_path: &Path,
        stop: &StopToken,
        progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
    ) -> Result<u64>;
}

const LOCAL_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub sample_duration: Duration,
    pub buffer_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("sourcepick/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            sample_duration: Duration::from_secs(2),
            buffer_limit: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct TransferStatus {
    state: TransferState,
    bytes: u64,
    started: Instant,
    finished: Option<Instant>,
    buffer: Option<BytesMut>,
    body_complete: bool,
    error: Option<String>,
    error_code: Option<u16>,
}

impl TransferStatus {
    fn new(buffer_limit: usize) -> Self {
        Self {
            state: TransferState::Running,
            bytes: 0,
            started: Instant::now(),
            finished: None,
            buffer: Some(BytesMut::with_capacity(buffer_limit.min(1024 * 1024))),
            body_complete: false,
            error: None,
            error_code: None,
        }
    }

    fn record_chunk(&mut self, chunk: &[u8], buffer_limit: usize) {
        self.bytes += chunk.len() as u64;
        let overflow = self
            .buffer
            .as_ref()
            .is_some_and(|buffer| buffer.len() + chunk.len() > buffer_limit);
        if overflow {
            self.buffer = None;
        } else if let Some(buffer) = self.buffer.as_mut() {
            buffer.extend_from_slice(chunk);
        }
    }

    fn finish(&mut self, state: TransferState) {
        self.state = state;
        self.finished = Some(Instant::now());
        if state != TransferState::Completed || !self.body_complete {
            self.buffer = None;
        }
    }
}

/// Speed-test transfer backed by a spawned reqwest request.
pub struct HttpTransfer {
    status: Arc<Mutex<TransferStatus>>,
    cancel: CancellationToken,
}

impl Transfer for HttpTransfer {
    fn state(&self) -> TransferState {
        self.status.lock().state
    }

    fn average_speed(&self) -> f64 {
        let status = self.status.lock();
        let end = status.finished.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(status.started).as_secs_f64();
        if elapsed > 0.0 {
            status.bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    fn is_fully_buffered(&self) -> bool {
        let status = self.status.lock();
        status.state == TransferState::Completed && status.body_complete && status.buffer.is_some()
    }

    fn take_buffer(&self) -> Option<Bytes> {
        let mut status = self.status.lock();
        if status.state == TransferState::Completed && status.body_complete {
            status.buffer.take().map(BytesMut::freeze)
        } else {
            None
        }
    }

    fn error(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    fn error_code(&self) -> Option<u16> {
        self.status.lock().error_code
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HttpTransfer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct HttpTransferEngine {
    client: Client,
    settings: EngineSettings,
}

impl HttpTransferEngine {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn request(&self, request: &TransferRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url);
        if let Some(referer) = &request.referer {
            builder = builder.header("Referer", referer);
        }
        builder
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    fn start_speed_test(&self, request: TransferRequest) -> Box<dyn Transfer> {
        let status = Arc::new(Mutex::new(TransferStatus::new(self.settings.buffer_limit)));
        let cancel = CancellationToken::new();

        let builder = self.request(&request);
        let settings = self.settings.clone();
        let task_status = Arc::clone(&status);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = sample(builder, &request, &settings, &task_status) => result,
                _ = task_cancel.cancelled() => Err(Error::Cancelled),
            };

            let mut status = task_status.lock();
            match outcome {
                Ok(()) => status.finish(TransferState::Completed),
                Err(Error::Cancelled) => status.finish(TransferState::Cancelled),
                Err(e) => {
                    debug!("Speed test for {} failed: {}", request.url, e);
                    if status.error_code.is_none() {
                        status.error_code = match &e {
                            Error::Http { source } => source.status().map(|s| s.as_u16()),
                            Error::Probe { code, .. } => *code,
                            _ => None,
                        };
                    }
                    status.error = Some(e.to_string());
                    status.finish(TransferState::Error);
                }
            }
        });

        Box::new(HttpTransfer { status, cancel })
    }

    async fn is_available(&self, request: &TransferRequest) -> Result<bool> {
        if let Some(path) = request.local_path() {
            return Ok(Path::new(path).exists());
        }

        let mut head = self.client.head(&request.url);
        if let Some(referer) = &request.referer {
            head = head.header("Referer", referer);
        }
        let response = head.send().await?;
        if response.status().is_success() {
            return Ok(true);
        }

        // Some hosts refuse HEAD; ask for a single byte instead.
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::FORBIDDEN
        ) {
            let response = self
                .request(request)
                .header("Range", "bytes=0-0")
                .send()
                .await?;
            return Ok(response.status().is_success());
        }

        debug!("{} answered {}", request.url, response.status());
        Ok(false)
    }

    async fn download_to(
        &self,
        request: &TransferRequest,
        output_path: &Path,
        stop: &StopToken,
        progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
    ) -> Result<u64> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(path) = request.local_path() {
            checkpoint(stop)?;
            let copied = tokio::fs::copy(path, output_path).await?;
            if let Some(sender) = progress {
                let _ = sender.send(TransferProgress::Completed {
                    bytes_downloaded: copied,
                });
            }
            return Ok(copied);
        }

        // Check if file exists and we should resume
        let existing_size = if request.resume {
            tokio::fs::metadata(output_path)
                .await
                .map(|metadata| metadata.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut builder = self.request(request);
        if existing_size > 0 {
            builder = builder.header("Range", format!("bytes={}-", existing_size));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Probe {
                url: request.url.clone(),
                message: format!("HTTP request failed with status: {}", status),
                code: Some(status.as_u16()),
            });
        }

        // A server that ignores Range sends the whole body again.
        let resume_from = if status == StatusCode::PARTIAL_CONTENT {
            existing_size
        } else {
            0
        };

        let total_size = if resume_from > 0 {
            response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split('/').nth(1)?.parse().ok())
                .unwrap_or(resume_from + response.content_length().unwrap_or(0))
        } else {
            response.content_length().unwrap_or(0)
        };

        if let Some(sender) = progress {
            let _ = sender.send(TransferProgress::Started {
                url: request.url.clone(),
                output_path: output_path.to_path_buf(),
                resume_from,
            });
        }

        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(output_path)
                .await?
        } else {
            tokio::fs::File::create(output_path).await?
        };

        let mut downloaded = resume_from;
        let mut last_progress_update = Instant::now();
        let mut last_bytes = downloaded;
        const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if stop.is_set() {
                if let Some(sender) = progress {
                    let _ = sender.send(TransferProgress::Cancelled);
                }
                return Err(Error::Cancelled);
            }

            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(sender) = progress {
                if last_progress_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
                    let elapsed = last_progress_update.elapsed().as_secs_f64();
                    let speed_bps = ((downloaded - last_bytes) as f64 / elapsed) as u64;
                    let _ = sender.send(TransferProgress::Progress {
                        bytes_downloaded: downloaded,
                        total_bytes: total_size,
                        speed_bps,
                    });
                    last_progress_update = Instant::now();
                    last_bytes = downloaded;
                }
            }
        }

        file.flush().await?;
        if let Some(sender) = progress {
            let _ = sender.send(TransferProgress::Completed {
                bytes_downloaded: downloaded,
            });
        }
        Ok(downloaded)
    }
}

async fn sample(
    builder: reqwest::RequestBuilder,
    request: &TransferRequest,
    settings: &EngineSettings,
    status: &Mutex<TransferStatus>,
) -> Result<()> {
    // The sampling clock starts with the transfer, not with the headers.
    let started = status.lock().started;
    let deadline = tokio::time::Instant::from_std(started) + settings.sample_duration;

    if let Some(path) = request.local_path() {
        return sample_local(Path::new(path), deadline, settings, status).await;
    }

    let response = builder.send().await?;
    let code = response.status();
    if !code.is_success() {
        status.lock().error_code = Some(code.as_u16());
        return Err(Error::Probe {
            url: request.url.clone(),
            message: format!("HTTP request failed with status: {}", code),
            code: Some(code.as_u16()),
        });
    }

    let mut stream = response.bytes_stream();
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(());
        }
        match tokio::time::timeout_at(deadline, stream.next()).await {
            // Sampled long enough
            Err(_) => return Ok(()),
            Ok(None) => {
                status.lock().body_complete = true;
                return Ok(());
            }
            Ok(Some(chunk)) => {
                let chunk = chunk?;
                status.lock().record_chunk(&chunk, settings.buffer_limit);
            }
        }
    }
}

/// Reads a local file in chunks. A file over the buffer limit is only timed.
async fn sample_local(
    path: &Path,
    deadline: tokio::time::Instant,
    settings: &EngineSettings,
    status: &Mutex<TransferStatus>,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if size > settings.buffer_limit as u64 {
        debug!("{:?} is {} bytes, over the buffer limit; timing only", path, size);
        status.lock().buffer = None;
    }

    let mut chunk = vec![0u8; LOCAL_CHUNK_SIZE];
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Ok(());
        }
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            status.lock().body_complete = true;
            return Ok(());
        }
        status.lock().record_chunk(&chunk[..read], settings.buffer_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_request(path: &Path) -> TransferRequest {
        TransferRequest::new(format!("file://{}", path.display()))
    }

    async fn wait_terminal(transfer: &dyn Transfer) -> TransferState {
        for _ in 0..200 {
            let state = transfer.state();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transfer.state()
    }

    #[test]
    fn test_status_drops_buffer_over_limit() {
        let mut status = TransferStatus::new(4);
        status.record_chunk(b"abc", 4);
        assert_eq!(status.buffer.as_ref().map(|b| b.len()), Some(3));
        status.record_chunk(b"de", 4);
        assert!(status.buffer.is_none());
        assert_eq!(status.bytes, 5);
    }

    #[tokio::test]
    async fn test_local_speed_test_is_fully_buffered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.zip");
        std::fs::write(&path, b"payload").unwrap();

        let engine = HttpTransferEngine::new(EngineSettings::default()).unwrap();
        let transfer = engine.start_speed_test(local_request(&path));

        assert_eq!(wait_terminal(transfer.as_ref()).await, TransferState::Completed);
        assert!(transfer.is_fully_buffered());
        assert_eq!(transfer.take_buffer().as_deref(), Some(&b"payload"[..]));
        assert!(transfer.take_buffer().is_none());
    }

    #[tokio::test]
    async fn test_local_speed_test_over_limit_is_only_timed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installer.bin");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();

        let engine = HttpTransferEngine::new(EngineSettings {
            buffer_limit: 1024,
            ..EngineSettings::default()
        })
        .unwrap();
        let transfer = engine.start_speed_test(local_request(&path));

        assert_eq!(wait_terminal(transfer.as_ref()).await, TransferState::Completed);
        assert!(!transfer.is_fully_buffered());
        assert!(transfer.take_buffer().is_none());
        assert!(transfer.average_speed() > 0.0);
    }

    /// Serves an endless body after holding the headers back for `delay`.
    async fn slow_header_server(delay: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            tokio::time::sleep(delay).await;
            let headers = "HTTP/1.1 200 OK\r\nContent-Length: 1000000000\r\n\r\n";
            if socket.write_all(headers.as_bytes()).await.is_err() {
                return;
            }
            let chunk = [1u8; 512];
            while socket.write_all(&chunk).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        format!("http://{}/mirror.bin", addr)
    }

    #[tokio::test]
    async fn test_sampling_clock_includes_header_wait() {
        let url = slow_header_server(Duration::from_millis(400)).await;
        let engine = HttpTransferEngine::new(EngineSettings {
            sample_duration: Duration::from_millis(800),
            ..EngineSettings::default()
        })
        .unwrap();

        let transfer = engine.start_speed_test(TransferRequest::new(url));
        tokio::time::sleep(Duration::from_millis(1050)).await;

        assert_eq!(transfer.state(), TransferState::Completed);
        assert!(!transfer.is_fully_buffered());
        assert!(transfer.average_speed() > 0.0);
    }

    #[tokio::test]
    async fn test_local_speed_test_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(EngineSettings::default()).unwrap();
        let transfer = engine.start_speed_test(local_request(&dir.path().join("missing")));

        assert_eq!(wait_terminal(transfer.as_ref()).await, TransferState::Error);
        assert!(transfer.error().is_some());
        assert!(!transfer.is_fully_buffered());
    }

    #[tokio::test]
    async fn test_local_availability_and_download() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let engine = HttpTransferEngine::new(EngineSettings::default()).unwrap();
        assert!(engine.is_available(&local_request(&path)).await.unwrap());
        assert!(
            !engine
                .is_available(&local_request(&dir.path().join("gone")))
                .await
                .unwrap()
        );

        let output = dir.path().join("out").join("dest.bin");
        let written = engine
            .download_to(&local_request(&path), &output, &StopToken::new(), None)
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&output).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_download_respects_stop_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, b"data").unwrap();

        let engine = HttpTransferEngine::new(EngineSettings::default()).unwrap();
        let stop = StopToken::new();
        stop.set();
        let result = engine
            .download_to(&local_request(&path), &dir.path().join("x"), &stop, None)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
