// src/models.rs

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::downloader::DownloadError;

/// Identifies a task within one batch. Assigned sequentially from 0.
pub type TaskId = usize;

/// Error type returned by URL resolvers.
pub type ResolveError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the URL to download just before each attempt.
///
/// Some sources (signed clip URLs, for instance) need their own network round
/// trip, and the result may expire, so resolution is deferred until a worker
/// picks the task up and is repeated on every retry.
#[async_trait]
pub trait ResolveUrl: Send + Sync {
    async fn resolve(&self) -> Result<String, ResolveError>;
}

/// Adapts an async closure into a [`ResolveUrl`].
pub struct FnResolver<F>(F);

#[async_trait]
impl<F, Fut> ResolveUrl for FnResolver<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ResolveError>> + Send,
{
    async fn resolve(&self) -> Result<String, ResolveError> {
        (self.0)().await
    }
}

/// Where the bytes of a task come from.
#[derive(Clone)]
pub enum Source {
    Url(String),
    Resolver(Arc<dyn ResolveUrl>),
}

impl Source {
    pub fn resolver<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ResolveError>> + Send + 'static,
    {
        Source::Resolver(Arc::new(FnResolver(f)))
    }

    /// The URL if it is known without resolving anything.
    pub fn known_url(&self) -> Option<&str> {
        match self {
            Source::Url(url) => Some(url),
            Source::Resolver(_) => None,
        }
    }

    pub async fn resolve(&self) -> Result<String, DownloadError> {
        match self {
            Source::Url(url) => Ok(url.clone()),
            Source::Resolver(resolver) => resolver.resolve().await.map_err(DownloadError::Resolve),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Source::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<String> for Source {
    fn from(url: String) -> Self {
        Source::Url(url)
    }
}

impl From<&str> for Source {
    fn from(url: &str) -> Self {
        Source::Url(url.to_string())
    }
}

/// One unit of work: a source to fetch and the path it must end up at.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub source: Source,
    pub target: PathBuf,
}

impl Task {
    pub fn new(id: TaskId, source: Source, target: PathBuf) -> Self {
        Self { id, source, target }
    }

    /// Returns the path the body is streamed into before the final rename.
    /// e.g., for "/path/to/seg-1.ts", it returns "/path/to/seg-1.ts.tmp"
    pub fn temporary_path(&self) -> PathBuf {
        temporary_path(&self.target)
    }
}

pub fn temporary_path(target: &Path) -> PathBuf {
    let mut path = target.as_os_str().to_owned();
    path.push(".tmp");
    PathBuf::from(path)
}

/// Outcome of a single task. Every input task gets exactly one.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Success {
        task_id: TaskId,
        target: PathBuf,
        url: Option<String>,
        size: u64,
        /// The target was already on disk and nothing was fetched.
        existing: bool,
    },
    Error {
        task_id: TaskId,
        target: PathBuf,
        url: Option<String>,
        #[serde(serialize_with = "serialize_display")]
        error: DownloadError,
    },
    Canceled {
        task_id: TaskId,
        target: PathBuf,
        url: Option<String>,
    },
}

impl TaskResult {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskResult::Success { task_id, .. }
            | TaskResult::Error { task_id, .. }
            | TaskResult::Canceled { task_id, .. } => *task_id,
        }
    }

    pub fn target(&self) -> &Path {
        match self {
            TaskResult::Success { target, .. }
            | TaskResult::Error { target, .. }
            | TaskResult::Canceled { target, .. } => target,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            TaskResult::Success { url, .. }
            | TaskResult::Error { url, .. }
            | TaskResult::Canceled { url, .. } => url.as_deref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TaskResult::Error { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskResult::Canceled { .. })
    }
}

/// Summary of one orchestrator run. `results` is in input order.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub ok: bool,
    pub results: Vec<TaskResult>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_error()).count()
    }

    pub fn canceled(&self) -> usize {
        self.results.iter().filter(|r| r.is_canceled()).count()
    }

    /// Bytes fetched over the network in this run (skipped files excluded).
    pub fn downloaded_bytes(&self) -> u64 {
        self.results
            .iter()
            .map(|r| match r {
                TaskResult::Success { size, existing: false, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    /// Targets that are now complete on disk.
    pub fn completed_targets(&self) -> impl Iterator<Item = &Path> {
        self.results.iter().filter(|r| r.is_success()).map(|r| r.target())
    }
}

fn serialize_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_path_appends_suffix() {
        let task = Task::new(0, "http://example.com/1.ts".into(), PathBuf::from("/tmp/vod/1.ts"));
        assert_eq!(task.temporary_path(), PathBuf::from("/tmp/vod/1.ts.tmp"));
    }

    #[tokio::test]
    async fn resolver_source_is_resolved_on_demand() {
        let source = Source::resolver(|| async { Ok("https://cdn.example.com/signed?sig=1".to_string()) });
        assert!(source.known_url().is_none());
        assert_eq!(source.resolve().await.unwrap(), "https://cdn.example.com/signed?sig=1");
    }

    #[tokio::test]
    async fn resolver_failure_maps_to_resolve_error() {
        let source = Source::resolver(|| async { Err::<String, ResolveError>("token expired".into()) });
        let err = source.resolve().await.unwrap_err();
        assert!(matches!(err, DownloadError::Resolve(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn batch_result_serializes_with_status_tag() {
        let batch = BatchResult {
            ok: false,
            results: vec![
                TaskResult::Success {
                    task_id: 0,
                    target: PathBuf::from("0.ts"),
                    url: Some("http://x/0.ts".into()),
                    size: 10,
                    existing: false,
                },
                TaskResult::Error {
                    task_id: 1,
                    target: PathBuf::from("1.ts"),
                    url: None,
                    error: DownloadError::Timeout,
                },
                TaskResult::Canceled { task_id: 2, target: PathBuf::from("2.ts"), url: None },
            ],
        };

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["results"][0]["status"], "success");
        assert_eq!(json["results"][1]["status"], "error");
        assert_eq!(json["results"][1]["error"], DownloadError::Timeout.to_string());
        assert_eq!(json["results"][2]["status"], "canceled");

        assert_eq!(batch.succeeded(), 1);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.canceled(), 1);
        assert_eq!(batch.downloaded_bytes(), 10);
    }
}
