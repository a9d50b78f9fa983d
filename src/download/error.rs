//! Error types for the download module.
//!
//! Two layers are defined here:
//! - [`TransportError`] is what a [`Transport`](super::Transport) adapter reports
//!   for a single request. The session classifies it and decides whether to retry.
//! - [`DownloadError`] is the final, typed outcome handed back to every caller
//!   joined on a session. It is `Clone` because several handles may observe it.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed error source used by transport adapters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a final download outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was malformed; never retried.
    InvalidRequest,
    /// The probe failed after all retries.
    Unreachable,
    /// The byte stream failed after all retries.
    TransportInterrupted,
    /// Received byte count did not match the advertised size.
    SizeMismatch,
    /// An existing file at the destination could not be removed.
    CannotOverwrite,
    /// Local storage failed (open, write, rename).
    StorageError,
    /// The session was cancelled. A terminal state rather than a failure.
    Cancelled,
    /// The driving task ended without publishing an outcome.
    Aborted,
}

/// Errors reported by a transport adapter for a single request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation did not complete within its timeout.
    #[error("timeout during {operation} for {url}")]
    Timeout {
        /// The URL being fetched.
        url: String,
        /// Which operation timed out (`probe`, `connect`, `read`).
        operation: &'static str,
    },

    /// Connection-level failure (DNS, refused, TLS, protocol).
    #[error("connection error for {url}: {source}")]
    Connection {
        /// The URL being fetched.
        url: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },

    /// The body stream broke after the response started.
    #[error("stream interrupted for {url}: {source}")]
    Stream {
        /// The URL being fetched.
        url: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl TransportError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, operation: &'static str) -> Self {
        Self::Timeout {
            url: url.into(),
            operation,
        }
    }

    /// Creates a connection error.
    pub fn connection(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Creates a stream interruption error.
    pub fn stream(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Stream {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// Final outcome error for a download session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The request failed validation.
    #[error("invalid download request: {reason}")]
    InvalidRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// The reachability probe kept failing.
    #[error("{url} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        /// The URL that was probed.
        url: String,
        /// Total attempts made (initial plus retries).
        attempts: u32,
        /// Description of the last failure.
        last_error: String,
    },

    /// The transfer kept failing mid-stream.
    #[error(
        "transfer of {url} interrupted at byte {bytes_received} after {attempts} attempts: {last_error}"
    )]
    TransportInterrupted {
        /// The URL being downloaded.
        url: String,
        /// Bytes safely stored in the temp file.
        bytes_received: u64,
        /// Total attempts made (initial plus retries).
        attempts: u32,
        /// Description of the last failure.
        last_error: String,
    },

    /// Byte count did not match the advertised total.
    #[error("size mismatch for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    SizeMismatch {
        /// The temp file that was checked.
        path: PathBuf,
        /// Advertised size in bytes.
        expected_bytes: u64,
        /// Received size in bytes.
        actual_bytes: u64,
    },

    /// The existing destination file could not be removed.
    #[error("cannot overwrite existing file {path}: {reason}")]
    CannotOverwrite {
        /// The destination that already exists.
        path: PathBuf,
        /// Why deletion failed.
        reason: String,
    },

    /// Local storage failed.
    #[error("storage error at {path}: {reason}")]
    Storage {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error, rendered.
        reason: String,
    },

    /// The session was cancelled before completion.
    #[error("download of {url} was cancelled")]
    Cancelled {
        /// The URL being downloaded.
        url: String,
    },

    /// The session task ended without reporting an outcome.
    #[error("download of {url} aborted before reporting an outcome")]
    Aborted {
        /// The URL being downloaded.
        url: String,
    },
}

impl DownloadError {
    /// Creates an invalid request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Creates a storage error from an IO error.
    pub fn storage(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            reason: source.to_string(),
        }
    }

    /// Creates an overwrite refusal from an IO error.
    pub fn cannot_overwrite(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::CannotOverwrite {
            path: path.into(),
            reason: source.to_string(),
        }
    }

    /// Creates a size mismatch error.
    pub fn size_mismatch(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a cancellation outcome.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::TransportInterrupted { .. } => ErrorKind::TransportInterrupted,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::CannotOverwrite { .. } => ErrorKind::CannotOverwrite,
            Self::Storage { .. } => ErrorKind::StorageError,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Aborted { .. } => ErrorKind::Aborted,
        }
    }

    /// Returns true when the outcome is a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// No `From<std::io::Error>` / `From<TransportError>` impls: every variant needs
// a path or URL the source error does not carry. Use the helper constructors.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_timeout_display() {
        let error = TransportError::timeout("https://example.com/file.bin", "read");
        let msg = error.to_string();
        assert!(msg.contains("timeout"), "Expected 'timeout' in: {msg}");
        assert!(msg.contains("read"), "Expected operation in: {msg}");
        assert!(msg.contains("https://example.com/file.bin"));
    }

    #[test]
    fn test_transport_stream_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = TransportError::stream("https://example.com/a", io);
        assert!(std::error::Error::source(&error).is_some());
        assert!(error.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_storage_error_display_includes_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::storage(PathBuf::from("/tmp/a.bin"), &io);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/a.bin"), "Expected path in: {msg}");
        assert!(msg.contains("access denied"), "Expected reason in: {msg}");
        assert_eq!(error.kind(), ErrorKind::StorageError);
    }

    #[test]
    fn test_size_mismatch_display() {
        let error = DownloadError::size_mismatch("/tmp/a.part", 100, 90);
        let msg = error.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("90"));
        assert_eq!(error.kind(), ErrorKind::SizeMismatch);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            DownloadError::invalid_request("empty url").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            DownloadError::cancelled("http://x/a").kind(),
            ErrorKind::Cancelled
        );
        let io = std::io::Error::other("busy");
        assert_eq!(
            DownloadError::cannot_overwrite("/d/a.bin", &io).kind(),
            ErrorKind::CannotOverwrite
        );
    }

    #[test]
    fn test_is_cancelled() {
        assert!(DownloadError::cancelled("http://x/a").is_cancelled());
        assert!(!DownloadError::invalid_request("nope").is_cancelled());
    }

    #[test]
    fn test_download_error_is_clone_and_comparable() {
        let error = DownloadError::Unreachable {
            url: "http://x/a".to_string(),
            attempts: 4,
            last_error: "HTTP 404".to_string(),
        };
        assert_eq!(error.clone(), error);
        assert!(error.to_string().contains("4 attempts"));
    }
}
