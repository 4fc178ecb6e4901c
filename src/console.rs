use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::downloader::DownloadError;
use crate::models::TaskId;
use crate::progress::{DownloadProgress, Progress, ProgressSnapshot};

/// Don't render more often than 10 times per second.
const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// Renders a [`DownloadProgress`] as a single status line on stderr.
pub struct ConsoleProgress {
    inner: Arc<DownloadProgress>,
    bar: ProgressBar,
    last_rendered: Mutex<Option<Instant>>,
}

impl ConsoleProgress {
    pub fn new(inner: Arc<DownloadProgress>) -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        bar.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()));
        Self {
            inner,
            bar,
            last_rendered: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &DownloadProgress {
        &self.inner
    }

    /// Draws the final state and leaves it on screen.
    pub fn finish(&self) {
        self.bar.finish_with_message(status_line(&self.inner.snapshot()));
    }

    fn render(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_rendered.lock();
            if matches!(*last, Some(t) if now.duration_since(t) < RENDER_INTERVAL) {
                return;
            }
            *last = Some(now);
        }
        self.bar.set_message(status_line(&self.inner.snapshot()));
        self.bar.tick();
    }
}

impl Progress for ConsoleProgress {
    fn start(&self, task_id: TaskId, size: Option<u64>) {
        self.inner.start(task_id, size);
        self.render();
    }

    fn content_length(&self, task_id: TaskId, size: u64) {
        self.inner.content_length(task_id, size);
        self.render();
    }

    fn advance(&self, task_id: TaskId, size: u64) {
        self.inner.advance(task_id, size);
        self.render();
    }

    fn already_downloaded(&self, task_id: TaskId, size: u64) {
        self.inner.already_downloaded(task_id, size);
        self.render();
    }

    fn abort(&self, task_id: TaskId, error: &DownloadError) {
        self.inner.abort(task_id, error);
        self.bar.println(format!("Task {task_id} aborted, retrying: {error}"));
        self.render();
    }

    fn failed(&self, task_id: TaskId, error: &DownloadError) {
        self.inner.failed(task_id, error);
        self.bar.println(format!("Task {task_id} failed: {error}"));
        self.render();
    }

    fn end(&self, task_id: TaskId) {
        self.inner.end(task_id);
        self.render();
    }
}

/// e.g. "Downloaded 3/10 VODs 30% of ~12.4MB at 1.2MB/s ETA 00:07"
pub fn status_line(s: &ProgressSnapshot) -> String {
    let mut line = match s.file_count {
        Some(count) => format!("Downloaded {}/{} VODs", s.downloaded_count, count),
        None => format!("Downloaded {} VODs", s.downloaded_count),
    };
    line.push_str(&format!(" {}%", s.progress_percent));
    if let Some(total) = s.estimated_total {
        line.push_str(&format!(" of ~{}", format_size(total as f64)));
    }
    if let Some(speed) = s.speed {
        line.push_str(&format!(" at {}/s", format_size(speed)));
    }
    if let Some(remaining) = s.remaining_time {
        line.push_str(&format!(" ETA {}", format_time(remaining)));
    }
    if s.failed_count > 0 {
        line.push_str(&format!(" ({} failed)", s.failed_count));
    }
    line
}

pub fn format_size(bytes: f64) -> String {
    const UNITS: [&str; 3] = ["kB", "MB", "GB"];
    if bytes < 1024.0 {
        return format!("{bytes:.1}B");
    }
    let mut value = bytes / 1024.0;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}{}", UNITS[UNITS.len() - 1])
}

/// `mm:ss`, or `hh:mm:ss` past the first hour.
pub fn format_time(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(512.0), "512.0B");
        assert_eq!(format_size(1536.0), "1.5kB");
        assert_eq!(format_size(5.0 * 1024.0 * 1024.0), "5.0MB");
        assert_eq!(format_size(3.0 * 1024.0 * 1024.0 * 1024.0), "3.0GB");
        assert_eq!(format_size(4096.0 * 1024.0 * 1024.0 * 1024.0), "4096.0GB");
    }

    #[test]
    fn times() {
        assert_eq!(format_time(0), "00:00");
        assert_eq!(format_time(75), "01:15");
        assert_eq!(format_time(3600 + 62), "01:01:02");
    }

    #[test]
    fn status_line_includes_known_values() {
        let progress = DownloadProgress::new(Some(4));
        progress.already_downloaded(0, 1024);
        let line = status_line(&progress.snapshot());
        assert_eq!(line, "Downloaded 1/4 VODs 25% of ~4.0kB");
    }

    #[test]
    fn console_forwards_to_tracker() {
        let tracker = Arc::new(DownloadProgress::new(Some(1)));
        let console = ConsoleProgress::new(tracker.clone());
        console.bar.set_draw_target(ProgressDrawTarget::hidden());

        console.start(0, Some(10));
        console.advance(0, 10);
        console.end(0);

        assert_eq!(tracker.snapshot().downloaded_count, 1);
        assert_eq!(console.tracker().snapshot().progress_percent, 100);
    }
}
