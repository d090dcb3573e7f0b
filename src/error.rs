//! Error types for download tasks and workers.
//!
//! The variants split along the retry policy's fault lines: fatal errors
//! stop the run immediately, retryable ones go through the worker's
//! backoff loop, and exhausting the retry budget wraps the last cause in
//! [`DownloadError::MaxRetriesReached`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while running a download task.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The provided URL is malformed or invalid. Fatal.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The server answered with a 4xx client error. Fatal, never retried.
    #[error("unexpected HTTP {status} downloading {url}")]
    UnexpectedStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Partial content was expected but the server did not answer 206.
    ///
    /// Retried against the original URL; when retries run out this error is
    /// reported as-is rather than wrapped in `MaxRetriesReached`.
    #[error("expected partial content, got HTTP {status} from {url}")]
    WrongStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code actually received.
        status: u16,
    },

    /// A 200 response carried no usable Content-Length.
    #[error("no content length in response from {url}")]
    ZeroContentLength {
        /// The URL that returned the empty response.
        url: String,
    },

    /// Any other unexpected status (5xx and friends). Retryable.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Network-level error (DNS, connection refused, reset mid-body, ...).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// File system error (destination file or progress record).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The disk filled up mid-write. Fatal, never retried.
    #[error("no space left on device writing {path}: {source}")]
    DiskFull {
        /// The file path that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The retry budget ran out; wraps the error of the final attempt.
    #[error("max retries reached: {source}")]
    MaxRetriesReached {
        /// The error from the last failed attempt.
        #[source]
        source: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a fatal unexpected-status (4xx) error.
    pub fn unexpected_status(url: impl Into<String>, status: u16) -> Self {
        Self::UnexpectedStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a wrong-status error (206 expected, something else received).
    pub fn wrong_status(url: impl Into<String>, status: u16) -> Self {
        Self::WrongStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a zero-content-length error.
    pub fn zero_content_length(url: impl Into<String>) -> Self {
        Self::ZeroContentLength { url: url.into() }
    }

    /// Creates a generic retryable HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an IO error, promoting disk exhaustion to [`Self::DiskFull`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if io_error_is_disk_full(&source) {
            Self::DiskFull { path, source }
        } else {
            Self::Io { path, source }
        }
    }

    /// Wraps the final attempt's error once the retry budget is exhausted.
    pub fn max_retries_reached(source: DownloadError) -> Self {
        Self::MaxRetriesReached {
            source: Box::new(source),
        }
    }

    /// Whether this error stops the run immediately, bypassing retries.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::UnexpectedStatus { .. }
                | Self::ZeroContentLength { .. }
                | Self::DiskFull { .. }
                | Self::MaxRetriesReached { .. }
        )
    }
}

/// Whether an IO error means the disk is out of space.
///
/// Matches both the stable `StorageFull` kind and the message patterns the
/// platform error strings carry ("ENOSPC", "no space"), case-insensitive.
#[must_use]
pub fn io_error_is_disk_full(error: &std::io::Error) -> bool {
    if error.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    let msg = error.to_string().to_lowercase();
    msg.contains("enospc") || msg.contains("no space")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_status_display() {
        let error = DownloadError::unexpected_status("http://example.com/f.bin", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("http://example.com/f.bin"));
    }

    #[test]
    fn test_wrong_status_display() {
        let error = DownloadError::wrong_status("http://example.com/f.bin", 200);
        let msg = error.to_string();
        assert!(msg.contains("partial content"), "got: {msg}");
        assert!(msg.contains("200"));
    }

    #[test]
    fn test_max_retries_wraps_cause() {
        let cause = DownloadError::timeout_for_test();
        let error = DownloadError::max_retries_reached(cause);
        let msg = error.to_string();
        assert!(msg.contains("max retries"), "got: {msg}");
        assert!(msg.contains("timeout"), "cause should show through: {msg}");
    }

    #[test]
    fn test_disk_full_detected_by_message() {
        let io = std::io::Error::other("write failed: ENOSPC");
        assert!(io_error_is_disk_full(&io));

        let io = std::io::Error::other("No space left on device");
        assert!(io_error_is_disk_full(&io));

        let io = std::io::Error::other("connection reset");
        assert!(!io_error_is_disk_full(&io));
    }

    #[test]
    fn test_disk_full_detected_by_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert!(io_error_is_disk_full(&io));
    }

    #[test]
    fn test_io_constructor_promotes_disk_full() {
        let io = std::io::Error::other("no space left on device");
        let error = DownloadError::io("/tmp/out.bin", io);
        assert!(matches!(error, DownloadError::DiskFull { .. }));
        assert!(error.is_fatal());
    }

    #[test]
    fn test_plain_io_error_is_not_fatal() {
        let io = std::io::Error::other("interrupted");
        let error = DownloadError::io("/tmp/out.bin", io);
        assert!(matches!(error, DownloadError::Io { .. }));
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DownloadError::invalid_url("bad").is_fatal());
        assert!(DownloadError::unexpected_status("u", 403).is_fatal());
        assert!(DownloadError::zero_content_length("u").is_fatal());
        assert!(!DownloadError::http_status("u", 503).is_fatal());
        assert!(!DownloadError::wrong_status("u", 200).is_fatal());
    }

    impl DownloadError {
        fn timeout_for_test() -> Self {
            Self::Timeout {
                url: "http://example.com".to_string(),
            }
        }
    }
}
