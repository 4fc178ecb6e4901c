use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::limiter::RateLimiter;
use crate::models::{ResolveError, Task, TaskResult};
use crate::progress::Progress;

const KB: usize = 1024;

/// How much of a VOD to write and report in each iteration.
pub const CHUNK_SIZE: usize = 256 * KB;

/// Number of attempts per task before giving up.
pub const RETRY_COUNT: usize = 5;

/// Seconds without network activity before an attempt is abandoned.
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("no network activity for {0:?}")]
    InactivityTimeout(Duration),
    #[error("request timed out")]
    Timeout,
    #[error("failed to resolve source url: {0}")]
    Resolve(#[source] ResolveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether another attempt may succeed.
    ///
    /// Anything the network or server did is retried, including every non-2xx
    /// status. Local filesystem errors, malformed requests and redirect loops
    /// fail the task immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
            }
            DownloadError::Status { .. }
            | DownloadError::InactivityTimeout(_)
            | DownloadError::Timeout
            | DownloadError::Resolve(_) => true,
            DownloadError::Io(_) | DownloadError::Cancelled => false,
        }
    }
}

/// Options shared by every task of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Attempts per task, including the first one.
    pub retries: usize,
    /// Inactivity timeout for connecting and for each body chunk.
    pub timeout: Duration,
    /// Size of the pieces written to disk and reported to progress.
    pub chunk_size: usize,
    /// Backoff before the first retry, doubled on every further one.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub user_agent: String,
    /// Opaque token sent as `Authorization: OAuth <token>`.
    pub auth_token: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retries: RETRY_COUNT,
            timeout: TIMEOUT,
            chunk_size: CHUNK_SIZE,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            user_agent: concat!("vodm/", env!("CARGO_PKG_VERSION")).to_string(),
            auth_token: None,
        }
    }
}

impl DownloadOptions {
    /// Delay before retry number `retry` (1-based).
    pub fn retry_backoff(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let multiplier = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.retry_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }

    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.auth_token {
            if let Ok(mut value) = HeaderValue::from_str(&format!("OAuth {token}")) {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            } else {
                warn!("auth token contains invalid header characters, ignoring it");
            }
        }

        Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .connect_timeout(self.timeout)
            .build()
    }
}

/// Downloads a single task with retries, shared by all workers of a batch.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    options: DownloadOptions,
}

impl Downloader {
    /// Create a new downloader with provided options.
    pub fn new(options: DownloadOptions) -> Result<Self, reqwest::Error> {
        let client = options.build_client()?;
        Ok(Self::with_client(client, options))
    }

    pub fn with_client(client: Client, options: DownloadOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Downloads `task.source` to `task.target`.
    ///
    /// The body goes to `<target>.tmp` first and is renamed into place only
    /// once complete, so a file at `target` is never partial. With
    /// `skip_existing`, an existing target counts as done without touching
    /// the network. Cancelling `cancel` interrupts the current attempt and
    /// removes its temporary file.
    pub async fn download_with_retries(
        &self,
        task: &Task,
        progress: &dyn Progress,
        limiter: &dyn RateLimiter,
        skip_existing: bool,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let mut url = task.source.known_url().map(str::to_owned);

        if cancel.is_cancelled() {
            return canceled(task, url);
        }

        if skip_existing {
            if let Some(meta) = existing_file(&task.target).await {
                debug!(task_id = task.id, target = %task.target.display(), "already downloaded");
                progress.already_downloaded(task.id, meta.len());
                return TaskResult::Success {
                    task_id: task.id,
                    target: task.target.clone(),
                    url,
                    size: meta.len(),
                    existing: true,
                };
            }
        }

        let attempts = self.options.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            progress.start(task.id, None);

            let outcome = self.attempt(task, progress, limiter, cancel, &mut url).await;

            let error = match outcome {
                Ok(size) => {
                    progress.end(task.id);
                    debug!(task_id = task.id, size, "download finished");
                    return TaskResult::Success {
                        task_id: task.id,
                        target: task.target.clone(),
                        url,
                        size,
                        existing: false,
                    };
                }
                Err(e) => e,
            };

            remove_partial(&task.temporary_path()).await;

            if matches!(error, DownloadError::Cancelled) {
                progress.abort(task.id, &error);
                return canceled(task, url);
            }

            if !error.is_retryable() || attempt >= attempts {
                error!(task_id = task.id, attempt, %error, "download failed");
                progress.failed(task.id, &error);
                return TaskResult::Error {
                    task_id: task.id,
                    target: task.target.clone(),
                    url,
                    error,
                };
            }

            let delay = self.options.retry_backoff(attempt);
            warn!(
                task_id = task.id,
                attempt,
                max = attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "download attempt failed, retrying"
            );
            progress.abort(task.id, &error);

            tokio::select! {
                _ = cancel.cancelled() => return canceled(task, url),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt: fetch into a fresh temporary file, then move it into place.
    ///
    /// Only the transfer is raced against `cancel`; creating and renaming the
    /// file always run to completion.
    async fn attempt(
        &self,
        task: &Task,
        progress: &dyn Progress,
        limiter: &dyn RateLimiter,
        cancel: &CancellationToken,
        url: &mut Option<String>,
    ) -> Result<u64, DownloadError> {
        let mut file = File::create(task.temporary_path()).await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            r = self.download_once(task, &mut file, progress, limiter, url) => r,
        };
        drop(file);
        let size = outcome?;

        tokio::fs::rename(task.temporary_path(), &task.target).await?;
        Ok(size)
    }

    /// Streams the response body into `file`.
    async fn download_once(
        &self,
        task: &Task,
        file: &mut File,
        progress: &dyn Progress,
        limiter: &dyn RateLimiter,
        url_slot: &mut Option<String>,
    ) -> Result<u64, DownloadError> {
        let url = task.source.resolve().await?;
        *url_slot = Some(url.clone());

        let timeout = self.options.timeout;
        let response = tokio::time::timeout(timeout, self.client.get(&url).send())
            .await
            .map_err(|_| DownloadError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status { status, url });
        }

        if let Some(size) = response.content_length() {
            progress.content_length(task.id, size);
        }

        let mut stream = response.bytes_stream();
        let chunk_size = self.options.chunk_size.max(1);
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut size = 0u64;

        loop {
            let next = tokio::time::timeout(timeout, stream.next())
                .await
                .map_err(|_| DownloadError::InactivityTimeout(timeout))?;
            let Some(bytes) = next else { break };
            buffer.extend_from_slice(&bytes?);

            while buffer.len() >= chunk_size {
                let chunk = buffer.split_to(chunk_size).freeze();
                size += write_chunk(file, task, chunk, progress, limiter).await?;
            }
        }
        if !buffer.is_empty() {
            size += write_chunk(file, task, buffer.freeze(), progress, limiter).await?;
        }

        file.flush().await?;
        Ok(size)
    }
}

/// Metadata of `path` if it is an existing regular file.
async fn existing_file(path: &Path) -> Option<std::fs::Metadata> {
    tokio::fs::metadata(path).await.ok().filter(|meta| meta.is_file())
}

async fn write_chunk(
    file: &mut File,
    task: &Task,
    chunk: Bytes,
    progress: &dyn Progress,
    limiter: &dyn RateLimiter,
) -> Result<u64, DownloadError> {
    file.write_all(&chunk).await?;
    let size = chunk.len() as u64;
    limiter.advance(size).await;
    progress.advance(task.id, size);
    Ok(size)
}

fn canceled(task: &Task, url: Option<String>) -> TaskResult {
    TaskResult::Canceled {
        task_id: task.id,
        target: task.target.clone(),
        url,
    }
}

/// Removes a partially written temporary file, if any.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}
