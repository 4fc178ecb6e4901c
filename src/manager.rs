// src/manager.rs

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::{pin, Pin};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BatchOptions;
use crate::downloader::Downloader;
use crate::limiter::{self, RateLimiter};
use crate::models::{BatchResult, Source, Task, TaskId, TaskResult};
use crate::progress::{NullProgress, Progress};
use crate::queue::{TaskQueue, TaskSender};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("worker count must be greater than 0")]
    InvalidWorkerCount,
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Runs batches of downloads on a bounded pool of workers.
pub struct DownloadManager {
    downloader: Downloader,
    options: BatchOptions,
    progress: Arc<dyn Progress>,
}

/// State shared by the workers of one batch.
struct Batch {
    downloader: Downloader,
    progress: Arc<dyn Progress>,
    limiter: Arc<dyn RateLimiter>,
    queue: TaskQueue,
    results: Mutex<HashMap<TaskId, TaskResult>>,
    cancel: CancellationToken,
    allow_failures: bool,
    skip_existing: bool,
}

/// What the producer remembers about each task, enough to report it as
/// canceled if no worker ever picks it up.
struct Entry {
    target: PathBuf,
    url: Option<String>,
}

impl DownloadManager {
    pub fn new(options: BatchOptions) -> Result<Self, ManagerError> {
        if options.workers == 0 {
            return Err(ManagerError::InvalidWorkerCount);
        }
        let downloader = Downloader::new(options.download.clone())?;
        Ok(Self {
            downloader,
            options,
            progress: Arc::new(NullProgress),
        })
    }

    /// Report task events to `progress` instead of discarding them.
    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Downloads every `(source, target)` pair. See [`Self::download_stream`].
    ///
    /// Unlike a stream, the pairs are already in memory, so after a
    /// cancellation the ones never reached are reported as `Canceled` too and
    /// the result list always matches the input one to one.
    pub async fn download_all<I>(&self, pairs: I) -> BatchResult
    where
        I: IntoIterator<Item = (Source, PathBuf)>,
    {
        let mut pairs = pairs.into_iter();
        let mut result = self.download_stream(futures_util::stream::iter(pairs.by_ref())).await;

        for (source, target) in pairs {
            result.results.push(TaskResult::Canceled {
                task_id: result.results.len(),
                target,
                url: source.known_url().map(str::to_owned),
            });
        }
        result
    }

    /// Downloads every `(source, target)` pair yielded by `pairs`, which may be
    /// produced lazily (e.g. page by page from an API).
    ///
    /// The returned results are in input order, one per pair pulled from the
    /// stream. With `allow_failures` unset, the first failed task cancels
    /// everything still running or queued, nothing more is pulled from
    /// `pairs`, and the batch is reported as not ok.
    pub async fn download_stream<S>(&self, pairs: S) -> BatchResult
    where
        S: Stream<Item = (Source, PathBuf)>,
    {
        let workers = self.options.workers;
        let (sender, queue) = TaskQueue::bounded(workers * 2);
        let batch = Arc::new(Batch {
            downloader: self.downloader.clone(),
            progress: self.progress.clone(),
            limiter: limiter::for_rate(self.options.rate_limit),
            queue,
            results: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            allow_failures: self.options.allow_failures,
            skip_existing: self.options.skip_existing,
        });

        debug!(workers, rate_limit = ?self.options.rate_limit, "starting batch");

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let batch = batch.clone();
            pool.spawn(async move { batch.run_worker(worker_id).await });
        }

        let pairs = pin!(pairs);
        let (entries, ()) = tokio::join!(
            produce(pairs, sender, &batch.cancel),
            join_workers(&mut pool, &batch.cancel),
        );

        let aborted = batch.cancel.is_cancelled();
        if aborted {
            let dropped = batch.queue.close().await;
            debug!(dropped = dropped.len(), "discarded queued tasks after cancellation");
        }

        let mut finished = std::mem::take(&mut *batch.results.lock());
        let results: Vec<TaskResult> = entries
            .into_iter()
            .enumerate()
            .map(|(task_id, entry)| {
                finished.remove(&task_id).unwrap_or(TaskResult::Canceled {
                    task_id,
                    target: entry.target,
                    url: entry.url,
                })
            })
            .collect();

        let result = BatchResult { ok: !aborted, results };
        info!(
            ok = result.ok,
            total = result.results.len(),
            succeeded = result.succeeded(),
            failed = result.failed(),
            canceled = result.canceled(),
            bytes = result.downloaded_bytes(),
            "batch finished"
        );
        result
    }
}

impl Batch {
    async fn run_worker(&self, worker_id: usize) {
        loop {
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = self.queue.pop() => task,
            };
            let Some(task) = task else { break };

            let result = self
                .downloader
                .download_with_retries(
                    &task,
                    self.progress.as_ref(),
                    self.limiter.as_ref(),
                    self.skip_existing,
                    &self.cancel,
                )
                .await;

            let failed = result.is_error();
            self.results.lock().insert(task.id, result);

            if failed && !self.allow_failures && !self.cancel.is_cancelled() {
                warn!(task_id = task.id, "task failed, cancelling remaining downloads");
                self.cancel.cancel();
            }
        }
        debug!(worker_id, "worker finished");
    }
}

/// Feeds tasks from `pairs` into the queue until the input ends or the batch
/// is cancelled. Returns one entry per task created, indexed by task id.
async fn produce<S>(mut pairs: Pin<&mut S>, sender: TaskSender, cancel: &CancellationToken) -> Vec<Entry>
where
    S: Stream<Item = (Source, PathBuf)>,
{
    let mut entries = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = pairs.next() => next,
        };
        let Some((source, target)) = next else { break };

        let task = Task::new(entries.len(), source, target);
        entries.push(Entry {
            target: task.target.clone(),
            url: task.source.known_url().map(str::to_owned),
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sender.send(task) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    drop(sender);
    entries
}

/// Waits for every worker. A panicking worker means broken bookkeeping: the
/// rest of the batch is cancelled and the panic is re-raised on the caller.
async fn join_workers(pool: &mut JoinSet<()>, cancel: &CancellationToken) {
    let mut panic = None;
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                cancel.cancel();
                panic.get_or_insert(e.into_panic());
            }
        }
    }
    if let Some(payload) = panic {
        std::panic::resume_unwind(payload);
    }
}
