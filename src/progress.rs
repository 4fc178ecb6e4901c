// src/progress.rs

//! Download progress observers.
//!
//! The downloader reports every task lifecycle event to a [`Progress`]
//! implementation shared by all workers of a batch. [`DownloadProgress`] keeps
//! the aggregate statistics (estimated total, speed, ETA) that presentation
//! layers such as [`crate::console::ConsoleProgress`] read back.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, warn};

use crate::downloader::DownloadError;
use crate::models::TaskId;

/// Number of `(downloaded, timestamp)` samples kept for speed calculation.
const MAX_SAMPLES: usize = 1000;

/// Receives task lifecycle events. All methods default to no-ops.
///
/// Implementations are called concurrently from every worker and must not
/// block for long.
pub trait Progress: Send + Sync {
    /// A new download attempt started. `size` is known up front only rarely.
    fn start(&self, _task_id: TaskId, _size: Option<u64>) {}

    /// Received content length from the server.
    fn content_length(&self, _task_id: TaskId, _size: u64) {}

    /// `size` more bytes were written for the task.
    fn advance(&self, _task_id: TaskId, _size: u64) {}

    /// The target is already on disk, nothing will be fetched.
    fn already_downloaded(&self, _task_id: TaskId, _size: u64) {}

    /// The attempt failed and its bytes are discarded; the task may start again.
    fn abort(&self, _task_id: TaskId, _error: &DownloadError) {}

    /// The task gave up for good.
    fn failed(&self, _task_id: TaskId, _error: &DownloadError) {}

    /// Download successfully finished.
    fn end(&self, _task_id: TaskId) {}
}

/// Ignores all events. Default for library callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {}

/// Emits a tracing event for each lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn start(&self, task_id: TaskId, size: Option<u64>) {
        debug!(task_id, ?size, "download started");
    }

    fn content_length(&self, task_id: TaskId, size: u64) {
        debug!(task_id, size, "content length received");
    }

    fn already_downloaded(&self, task_id: TaskId, size: u64) {
        debug!(task_id, size, "already downloaded, skipping");
    }

    // Failures and retries are logged at warn level by the downloader.
    fn abort(&self, task_id: TaskId, error: &DownloadError) {
        debug!(task_id, %error, "download aborted");
    }

    fn failed(&self, task_id: TaskId, error: &DownloadError) {
        debug!(task_id, %error, "download failed");
    }

    fn end(&self, task_id: TaskId) {
        debug!(task_id, "downloaded");
    }
}

#[derive(Debug, Clone, Default)]
struct TaskProgress {
    size: Option<u64>,
    downloaded: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    downloaded: u64,
    timestamp: Instant,
}

#[derive(Debug, Default)]
struct ProgressState {
    tasks: HashMap<TaskId, TaskProgress>,
    /// Every byte received, including those of aborted attempts.
    downloaded: u64,
    /// Bytes counting towards completion of the batch.
    progress_bytes: u64,
    downloaded_count: usize,
    failed_count: usize,
    samples: VecDeque<Sample>,
}

/// Read-only view of a [`DownloadProgress`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub file_count: Option<usize>,
    pub downloaded: u64,
    pub progress_bytes: u64,
    pub downloaded_count: usize,
    pub failed_count: usize,
    pub estimated_total: Option<u64>,
    pub progress_percent: u32,
    /// Bytes per second over the sample window.
    pub speed: Option<f64>,
    /// Remaining seconds.
    pub remaining_time: Option<u64>,
}

/// Tracks per-task and aggregate download state for a batch.
#[derive(Debug)]
pub struct DownloadProgress {
    file_count: Option<usize>,
    state: Mutex<ProgressState>,
}

impl DownloadProgress {
    /// `file_count` is the number of tasks in the batch, when known. Without it
    /// no total can be estimated.
    pub fn new(file_count: Option<usize>) -> Self {
        Self {
            file_count,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().snapshot(self.file_count)
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProgressState {
    fn task_mut(&mut self, task_id: TaskId, action: &str) -> &mut TaskProgress {
        match self.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => panic!("task {task_id}: cannot {action}, not started"),
        }
    }

    fn start(&mut self, task_id: TaskId, size: Option<u64>) {
        if self.tasks.contains_key(&task_id) {
            panic!("task {task_id}: cannot start, already started");
        }
        self.tasks.insert(task_id, TaskProgress { size, downloaded: 0 });
    }

    fn content_length(&mut self, task_id: TaskId, size: u64) {
        self.task_mut(task_id, "set size").size = Some(size);
    }

    fn advance(&mut self, task_id: TaskId, size: u64, now: Instant) {
        self.task_mut(task_id, "advance").downloaded += size;
        self.downloaded += size;
        self.progress_bytes += size;

        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { downloaded: self.downloaded, timestamp: now });
    }

    fn already_downloaded(&mut self, task_id: TaskId, size: u64) {
        if self.tasks.contains_key(&task_id) {
            panic!("task {task_id}: cannot mark as downloaded, already started");
        }
        self.tasks.insert(task_id, TaskProgress { size: Some(size), downloaded: 0 });
        self.progress_bytes += size;
        self.downloaded_count += 1;
    }

    fn abort(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.remove(&task_id) else {
            panic!("task {task_id}: cannot abort, not started");
        };
        self.progress_bytes = self.progress_bytes.saturating_sub(task.downloaded);
    }

    fn end(&mut self, task_id: TaskId) {
        let task = self.task_mut(task_id, "end");
        if let Some(size) = task.size {
            if size != task.downloaded {
                warn!(
                    task_id,
                    downloaded = task.downloaded,
                    expected = size,
                    "task ended with unexpected size"
                );
            }
        }
        self.downloaded_count += 1;
    }

    fn estimated_total(&self, file_count: Option<usize>) -> Option<u64> {
        let file_count = file_count.filter(|&count| count > 0)?;
        let sizes: Vec<u64> = self.tasks.values().filter_map(|t| t.size).collect();
        if sizes.is_empty() {
            return None;
        }
        let mean = sizes.iter().sum::<u64>() as f64 / sizes.len() as f64;
        Some((mean * file_count as f64) as u64)
    }

    fn speed(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let duration = last.timestamp.duration_since(first.timestamp).as_secs_f64();
        if duration > 0.0 {
            Some((last.downloaded - first.downloaded) as f64 / duration)
        } else {
            None
        }
    }

    fn snapshot(&self, file_count: Option<usize>) -> ProgressSnapshot {
        let estimated_total = self.estimated_total(file_count);
        let speed = self.speed();

        let progress_percent = match estimated_total {
            Some(total) if total > 0 => ((100 * self.progress_bytes) / total).min(100) as u32,
            _ => 0,
        };
        let remaining_time = match (estimated_total, speed) {
            (Some(total), Some(speed)) if speed > 0.0 => {
                Some((total.saturating_sub(self.progress_bytes) as f64 / speed) as u64)
            }
            _ => None,
        };

        ProgressSnapshot {
            file_count,
            downloaded: self.downloaded,
            progress_bytes: self.progress_bytes,
            downloaded_count: self.downloaded_count,
            failed_count: self.failed_count,
            estimated_total,
            progress_percent,
            speed,
            remaining_time,
        }
    }
}

impl Progress for DownloadProgress {
    fn start(&self, task_id: TaskId, size: Option<u64>) {
        self.state.lock().start(task_id, size);
    }

    fn content_length(&self, task_id: TaskId, size: u64) {
        self.state.lock().content_length(task_id, size);
    }

    fn advance(&self, task_id: TaskId, size: u64) {
        self.state.lock().advance(task_id, size, Instant::now());
    }

    fn already_downloaded(&self, task_id: TaskId, size: u64) {
        self.state.lock().already_downloaded(task_id, size);
    }

    fn abort(&self, task_id: TaskId, _error: &DownloadError) {
        self.state.lock().abort(task_id);
    }

    fn failed(&self, task_id: TaskId, _error: &DownloadError) {
        let mut state = self.state.lock();
        state.abort(task_id);
        state.failed_count += 1;
    }

    fn end(&self, task_id: TaskId) {
        self.state.lock().end(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn error() -> DownloadError {
        DownloadError::Timeout
    }

    #[test]
    fn initial_values() {
        let progress = DownloadProgress::new(Some(10));
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.downloaded, 0);
        assert_eq!(snapshot.estimated_total, None);
        assert_eq!(snapshot.progress_percent, 0);
        assert_eq!(snapshot.remaining_time, None);
        assert_eq!(snapshot.speed, None);
        assert_eq!(snapshot.file_count, Some(10));
        assert_eq!(snapshot.downloaded_count, 0);
    }

    #[test]
    fn downloaded_and_aborted_bytes() {
        let progress = DownloadProgress::new(Some(3));
        for id in 1..=3 {
            progress.start(id, Some(300));
        }
        assert_eq!(progress.snapshot().progress_percent, 0);

        progress.advance(1, 100);
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.progress_percent), (100, 100, 11));

        progress.advance(2, 200);
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.progress_percent), (300, 300, 33));

        progress.advance(3, 150);
        progress.advance(1, 50);
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.progress_percent), (500, 500, 55));

        progress.abort(2, &error());
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.progress_percent), (500, 300, 33));

        progress.start(2, Some(300));
        progress.advance(1, 150);
        progress.advance(2, 300);
        progress.advance(3, 150);
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.progress_percent), (1100, 900, 100));

        for id in 1..=3 {
            progress.end(id);
        }
        let s = progress.snapshot();
        assert_eq!((s.downloaded, s.progress_bytes, s.downloaded_count), (1100, 900, 3));
    }

    #[test]
    fn estimated_total_uses_mean_of_known_sizes() {
        let progress = DownloadProgress::new(Some(3));
        assert_eq!(progress.snapshot().estimated_total, None);

        progress.start(1, None);
        assert_eq!(progress.snapshot().estimated_total, None);

        progress.content_length(1, 12000);
        assert_eq!(progress.snapshot().estimated_total, Some(12000 * 3));

        progress.start(2, Some(11000));
        assert_eq!(progress.snapshot().estimated_total, Some(11500 * 3));

        progress.start(3, Some(10000));
        assert_eq!(progress.snapshot().estimated_total, Some(11000 * 3));
    }

    #[test]
    fn unknown_file_count_has_no_estimate() {
        let progress = DownloadProgress::new(None);
        progress.start(0, Some(100));
        assert_eq!(progress.snapshot().estimated_total, None);
        assert_eq!(progress.snapshot().progress_percent, 0);
    }

    #[test]
    fn already_downloaded_counts_as_complete() {
        let progress = DownloadProgress::new(Some(2));
        progress.already_downloaded(0, 400);

        let s = progress.snapshot();
        assert_eq!(s.downloaded_count, 1);
        assert_eq!(s.progress_bytes, 400);
        assert_eq!(s.downloaded, 0);
        assert_eq!(s.estimated_total, Some(800));
        assert_eq!(s.progress_percent, 50);

        // Aborting another task must not drop bytes of skipped ones.
        progress.start(1, Some(400));
        progress.advance(1, 100);
        progress.abort(1, &error());
        assert_eq!(progress.snapshot().progress_bytes, 400);
    }

    #[test]
    fn failed_discards_bytes_and_counts() {
        let progress = DownloadProgress::new(Some(1));
        progress.start(0, Some(100));
        progress.advance(0, 60);
        progress.failed(0, &error());

        let s = progress.snapshot();
        assert_eq!(s.failed_count, 1);
        assert_eq!(s.downloaded_count, 0);
        assert_eq!(s.progress_bytes, 0);
        assert_eq!(s.downloaded, 60);
    }

    #[test]
    fn vod_downloaded_count() {
        let progress = DownloadProgress::new(Some(3));
        for id in 1..=3 {
            progress.start(id, Some(100));
        }
        for id in 1..=3 {
            progress.advance(id, 100);
            progress.end(id);
            assert_eq!(progress.snapshot().downloaded_count, id);
        }
    }

    #[test]
    fn speed_and_remaining_time_from_samples() {
        let mut state = ProgressState::default();
        state.start(0, Some(1000));
        state.start(1, Some(1000));

        let t0 = Instant::now();
        state.advance(0, 100, t0);
        assert_eq!(state.snapshot(Some(2)).speed, None);

        state.advance(0, 200, t0 + Duration::from_secs(1));
        state.advance(1, 200, t0 + Duration::from_secs(2));

        let s = state.snapshot(Some(2));
        // 400 bytes between the first and last sample, two seconds apart.
        assert_eq!(s.speed, Some(200.0));
        assert_eq!(s.remaining_time, Some((2000 - 500) / 200));
    }

    #[test]
    fn speed_unknown_without_elapsed_time() {
        let mut state = ProgressState::default();
        state.start(0, None);
        let now = Instant::now();
        state.advance(0, 10, now);
        state.advance(0, 10, now);
        assert_eq!(state.snapshot(None).speed, None);
    }

    #[test]
    fn sample_window_is_bounded() {
        let mut state = ProgressState::default();
        state.start(0, None);
        let t0 = Instant::now();
        for i in 0..(MAX_SAMPLES as u64 + 10) {
            state.advance(0, 1, t0 + Duration::from_millis(i));
        }
        assert_eq!(state.samples.len(), MAX_SAMPLES);
        assert_eq!(state.samples.front().map(|s| s.downloaded), Some(11));
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn start_twice_panics() {
        let progress = DownloadProgress::new(None);
        progress.start(7, None);
        progress.start(7, None);
    }

    #[test]
    #[should_panic(expected = "not started")]
    fn advance_unknown_task_panics() {
        DownloadProgress::new(None).advance(3, 10);
    }
}
