//! Concurrent, resumable, rate-limited downloader for segmented media.
//!
//! A batch of `(source, target)` pairs is handed to a [`DownloadManager`],
//! which fetches them on a bounded pool of workers, writes each through a
//! `.tmp` file renamed into place on success, and returns one [`TaskResult`]
//! per pair in input order.

pub mod config;
pub mod console;
pub mod downloader;
pub mod input;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod progress;
pub mod queue;

pub use config::BatchOptions;
pub use downloader::{DownloadError, DownloadOptions, Downloader};
pub use manager::{DownloadManager, ManagerError};
pub use models::{BatchResult, Source, Task, TaskId, TaskResult};

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{parse_rate_limit, BatchOptions};
    pub use crate::console::ConsoleProgress;
    pub use crate::downloader::{DownloadError, DownloadOptions, Downloader};
    pub use crate::limiter::{RateLimiter, TokenBucket, Unlimited};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{BatchResult, ResolveUrl, Source, Task, TaskId, TaskResult};
    pub use crate::progress::{DownloadProgress, LogProgress, NullProgress, Progress};
}
