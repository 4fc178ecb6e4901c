//! Task lists read by the command line tool.
//!
//! One task per line: `<url> [target]`. Blank lines and lines starting with
//! `#` are ignored. Targets are taken relative to the output directory; when
//! missing, the last segment of the URL path is used.

use reqwest::Url;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::Source;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("line {line}: invalid url {url:?}")]
    InvalidUrl { line: usize, url: String },
    #[error("line {line}: cannot derive a file name from {url:?}, give a target")]
    NoFileName { line: usize, url: String },
}

pub fn parse_task_list(text: &str, output_dir: &Path) -> Result<Vec<(Source, PathBuf)>, InputError> {
    let mut pairs = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let (url, target) = match raw.split_once(char::is_whitespace) {
            Some((url, target)) => (url, Some(target.trim())),
            None => (raw, None),
        };
        let parsed = Url::parse(url).map_err(|_| InputError::InvalidUrl {
            line,
            url: url.to_string(),
        })?;

        let target = match target {
            Some(target) => output_dir.join(target),
            None => target_for_url(&parsed, output_dir).ok_or_else(|| InputError::NoFileName {
                line,
                url: url.to_string(),
            })?,
        };
        pairs.push((Source::Url(parsed.into()), target));
    }
    Ok(pairs)
}

/// `<output_dir>/<last path segment>` for URLs that end in a file name.
pub fn target_for_url(url: &Url, output_dir: &Path) -> Option<PathBuf> {
    let name = url.path_segments()?.last().filter(|s| !s.is_empty())?;
    Some(output_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urls_with_and_without_targets() {
        let text = "\
# chunked quality
https://cdn.example.com/vod/chunked/0.ts

https://cdn.example.com/vod/chunked/1.ts   second part.ts
https://cdn.example.com/clip.mp4?sig=abc&token=x clips/clip.mp4
";
        let pairs = parse_task_list(text, Path::new("out")).unwrap();
        let targets: Vec<_> = pairs.iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(
            targets,
            vec![
                PathBuf::from("out/0.ts"),
                PathBuf::from("out/second part.ts"),
                PathBuf::from("out/clips/clip.mp4"),
            ]
        );
        assert_eq!(pairs[2].0.known_url(), Some("https://cdn.example.com/clip.mp4?sig=abc&token=x"));
    }

    #[test]
    fn rejects_bad_lines() {
        assert_eq!(
            parse_task_list("not-a-url", Path::new(".")).unwrap_err(),
            InputError::InvalidUrl { line: 1, url: "not-a-url".into() }
        );
        assert_eq!(
            parse_task_list("\nhttps://example.com/", Path::new(".")).unwrap_err(),
            InputError::NoFileName { line: 2, url: "https://example.com/".into() }
        );
    }
}
