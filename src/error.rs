// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for cache resolution, plus CLI error formatting.
//!
//! Every failure a caller can observe is a [`CacheError`]. The type is
//! `Clone` because a single transfer outcome is delivered to every waiter
//! attached to it.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures of the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// The transfer exceeded its configured maximum duration.
    #[error("transfer timed out after {after:?}")]
    Timeout { after: Duration },

    /// The remote host could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("server responded with HTTP {0}")]
    Status(u16),

    /// Any other transport failure (reset, truncated body, protocol error).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The URI was empty or not a well-formed resource locator.
    #[error("invalid URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The cache root could not be inspected (permission denied, I/O error).
    /// A missing file is not an error.
    #[error("cache storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The transport failed.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Writing or moving bytes into the cache failed.
    #[error("write error: {0}")]
    Write(String),

    /// Every waiter detached and the transfer was aborted.
    #[error("transfer cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl fmt::Display) -> Self {
        CacheError::InvalidUri {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Map an I/O error from a probe or listing.
    pub fn storage(context: impl fmt::Display, err: io::Error) -> Self {
        CacheError::StorageUnavailable(format!("{}: {}", context, err))
    }

    /// Map an I/O error from writing, renaming or directory creation.
    pub fn write(context: impl fmt::Display, err: io::Error) -> Self {
        CacheError::Write(format!("{}: {}", context, err))
    }

    /// Whether asking again may produce a different outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Network(NetworkError::Status(code)) => *code >= 500 || *code == 429,
            CacheError::Network(_) | CacheError::Cancelled => true,
            CacheError::InvalidUri { .. }
            | CacheError::StorageUnavailable(_)
            | CacheError::Write(_) => false,
        }
    }

    /// Likely causes and fixes, for the CLI's error report.
    pub fn hints(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        match self {
            CacheError::InvalidUri { .. } => (
                vec!["URI is empty or missing a scheme"],
                vec!["Pass an absolute URI, e.g. https://example.com/a.png"],
            ),
            CacheError::StorageUnavailable(_) => (
                vec![
                    "Cache root is not readable by this user",
                    "Cache root is on an unmounted volume",
                ],
                vec!["Check permissions on the cache root", "Use --root to pick another directory"],
            ),
            CacheError::Network(NetworkError::Timeout { .. }) => (
                vec!["Server is slow or the resource is very large"],
                vec!["Raise the limit: --timeout <SECS>"],
            ),
            CacheError::Network(NetworkError::Status(_)) => (
                vec!["Resource does not exist", "Request headers were rejected"],
                vec!["Open the URI in a browser", "Check -H header values"],
            ),
            CacheError::Network(_) => (
                vec!["No network connection", "Host name does not resolve"],
                vec!["Check connectivity and retry"],
            ),
            CacheError::Write(_) => (
                vec!["Disk is full", "Cache root is read-only"],
                vec!["Free disk space or run: uricache clear", "Use --root to pick another directory"],
            ),
            CacheError::Cancelled => (vec![], vec!["Retry the request"]),
        }
    }
}

/// Formats an error message with title, causes and fixes.
///
/// ```
/// use uricache::error::format_error;
///
/// let report = format_error(
///     "Could not fetch https://example.com/a.png",
///     &["No network connection"],
///     &["Check connectivity and retry"],
/// );
/// assert!(report.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n", title));

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Render a [`CacheError`] with its hints.
pub fn format_cache_error(title: &str, err: &CacheError) -> String {
    let (causes, fixes) = err.hints();
    format_error(&format!("{}: {}", title, err), &causes, &fixes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let error = format_error("Test Error", &["Cause 1", "Cause 2"], &["Fix 1", "Fix 2"]);

        assert!(error.contains("[✗] Test Error"));
        assert!(error.contains("Possible causes:"));
        assert!(error.contains("  - Cause 1"));
        assert!(error.contains("  - Cause 2"));
        assert!(error.contains("Try these fixes:"));
        assert!(error.contains("  1. Fix 1"));
        assert!(error.contains("  2. Fix 2"));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert!(error.contains("[✗] Empty test"));
        assert!(!error.contains("Possible causes:"));
        assert!(!error.contains("Try these fixes:"));
    }

    #[test]
    fn test_network_error_converts() {
        let err: CacheError = NetworkError::Timeout { after: Duration::from_secs(5) }.into();
        assert_eq!(err, CacheError::Network(NetworkError::Timeout { after: Duration::from_secs(5) }));
        assert_eq!(err.to_string(), "network error: transfer timed out after 5s");
    }

    #[test]
    fn test_sub_second_timeout_keeps_precision() {
        let err = NetworkError::Timeout { after: Duration::from_millis(250) };
        assert_eq!(err.to_string(), "transfer timed out after 250ms");
    }

    #[test]
    fn test_retryable() {
        assert!(CacheError::Cancelled.is_retryable());
        assert!(CacheError::from(NetworkError::Connect("refused".into())).is_retryable());
        assert!(CacheError::from(NetworkError::Status(503)).is_retryable());
        assert!(!CacheError::from(NetworkError::Status(404)).is_retryable());
        assert!(!CacheError::invalid_uri("", "empty").is_retryable());
        assert!(!CacheError::Write("disk full".into()).is_retryable());
    }

    #[test]
    fn test_format_cache_error_includes_hints() {
        let err = CacheError::Write("disk full".into());
        let report = format_cache_error("Download failed", &err);
        assert!(report.contains("write error: disk full"));
        assert!(report.contains("Disk is full"));
    }
}
