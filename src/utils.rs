//! Utility functions for text truncation, URL normalisation, and file system checks.
//!
//! This module provides helpers used throughout the pipeline:
//! - Deterministic, char-boundary-safe truncation for prompt budgets
//! - Fallback excerpts for summaries
//! - Log-friendly truncation of model responses
//! - Source URL normalisation
//! - File system validation for output directories

use std::fs as stdfs;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Return the first `max_chars` characters of `s`.
///
/// Deterministic for a given input, never splits a UTF-8 code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Build a fallback summary from the opening of an article body.
///
/// Whitespace is collapsed first; an ellipsis marks that the body was cut.
pub fn excerpt(body: &str, max_chars: usize) -> String {
    let collapsed = collapse_whitespace(body);
    let cut = truncate_chars(&collapsed, max_chars);
    if cut.len() < collapsed.len() {
        format!("{}…", cut.trim_end())
    } else {
        collapsed
    }
}

/// Replace every run of whitespace with a single space and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` bytes (backing off to a char boundary)
/// with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log("a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(+{} bytes)", &s[..end], s.len() - end)
}

/// Normalise a user-supplied source URL.
///
/// Trims whitespace, prepends `https://` when no scheme is given and requires
/// a host. Returns `None` for anything that is not an http(s) URL.
pub fn normalize_source_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return None;
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    match (url.scheme(), url.host_str()) {
        ("http" | "https", Some(host)) if !host.is_empty() => Some(url),
        _ => None,
    }
}

/// Convert a title to a URL-friendly slug.
///
/// Used to generate anchor links in Markdown reports.
///
/// ```ignore
/// assert_eq!(slugify_title("Hello World"), "hello-world");
/// ```
pub fn slugify_title(title: &str) -> String {
    title
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ' && c != '-', "")
        .replace(' ', "-")
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if it doesn't exist, then performs a write test by
/// creating and immediately deleting a probe file.
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> std::io::Result<()> {
    fs::create_dir_all(path).await?;
    let probe_path = format!("{}/..__probe_write__", path.trim_end_matches('/'));
    stdfs::File::create(&probe_path)?;
    let _ = stdfs::remove_file(&probe_path);
    info!("Output directory is writable");
    Ok(())
}
