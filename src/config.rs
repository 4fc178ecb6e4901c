use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloader::DownloadOptions;

/// Default number of concurrent downloads.
pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid rate limit {0:?}: must be an integer, followed by an optional 'k' or 'm'")]
    InvalidRate(String),
}

/// Settings for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Upper bound on concurrent downloads, must be greater than 0.
    pub workers: usize,
    /// Keep going when a task fails. When false the first failure cancels the batch.
    pub allow_failures: bool,
    /// Treat targets already on disk as downloaded.
    pub skip_existing: bool,
    /// Aggregate limit in bytes per second. `None` or 0 is unlimited.
    pub rate_limit: Option<u64>,
    pub download: DownloadOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            allow_failures: true,
            skip_existing: true,
            rate_limit: None,
            download: DownloadOptions::default(),
        }
    }
}

/// Parses a rate such as `500`, `64k` or `2M` into bytes per second.
/// Suffixes are binary multiples and case-insensitive.
pub fn parse_rate_limit(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidRate(value.to_string());
    let trimmed = value.trim();

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, 'k' | 'K')) => (&trimmed[..i], 1024),
        Some((i, 'm' | 'M')) => (&trimmed[..i], 1024 * 1024),
        _ => (trimmed, 1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|amount| amount.checked_mul(multiplier))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_rates() {
        assert_eq!(parse_rate_limit("1000"), Ok(1000));
        assert_eq!(parse_rate_limit("64k"), Ok(64 * 1024));
        assert_eq!(parse_rate_limit("64K"), Ok(64 * 1024));
        assert_eq!(parse_rate_limit("2m"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_rate_limit("2M"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_rate_limit("0"), Ok(0));
    }

    #[test]
    fn rejects_garbage() {
        for value in ["", "k", "1.5m", "-3", "10g", "10 k", "ten"] {
            assert!(parse_rate_limit(value).is_err(), "{value:?} should not parse");
        }
    }

    #[test]
    fn batch_defaults() {
        let options = BatchOptions::default();
        assert_eq!(options.workers, DEFAULT_WORKERS);
        assert!(options.allow_failures);
        assert!(options.skip_existing);
        assert_eq!(options.rate_limit, None);
        assert_eq!(options.download.retries, 5);
    }

    #[test]
    fn batch_options_deserialize_with_defaults() {
        let options: BatchOptions =
            serde_json::from_str(r#"{"workers": 3, "rate_limit": 1024, "download": {"retries": 2}}"#).unwrap();
        assert_eq!(options.workers, 3);
        assert_eq!(options.rate_limit, Some(1024));
        assert_eq!(options.download.retries, 2);
        assert_eq!(options.download.chunk_size, 256 * 1024);
        assert!(options.skip_existing);
    }
}
