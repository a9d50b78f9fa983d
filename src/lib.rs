//! kdownload core library
//!
//! A resumable download engine: deduplicated sessions keyed by target,
//! byte-range resume, bounded retries with backoff, cooperative cancellation,
//! and progress fan-out to observers.
//!
//! # Architecture
//!
//! - [`download`] - sessions, registry, progress publisher, and the
//!   transport/storage adapters they are built on

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, DownloadKey, DownloadRequest, EngineConfig, ErrorKind,
    FsStorage, HttpClient, ProgressEvent, ProgressPublisher, RetryPolicy, SessionHandle,
    SessionRegistry, SessionSnapshot, SessionState,
};
