//! Resumable download engine.
//!
//! A [`SessionRegistry`] owns at most one [`SessionHandle`] per
//! [`DownloadKey`]. Each session probes the source, streams the body into a
//! temp file next to the destination, resumes with byte ranges after
//! interruptions, and renames the temp file into place once the size checks
//! out. Network and disk access go through the [`Transport`] and [`Storage`]
//! traits; [`HttpClient`] and [`FsStorage`] are the production adapters.
//!
//! # Features
//!
//! - Deduplication: concurrent submissions of one key share a session
//! - Resume from the bytes already on disk (`Range: bytes=N-`)
//! - Exponential backoff with a per-session retry ceiling
//! - Cooperative cancellation that keeps the partial file
//! - Coalesced progress events through a [`ProgressPublisher`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kdownload_core::download::{DownloadRequest, FsStorage, HttpClient, SessionRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SessionRegistry::new(
//!     Arc::new(HttpClient::new()),
//!     Arc::new(FsStorage::user_downloads()),
//! );
//! let _progress = registry.publisher().subscribe_all(|event: &kdownload_core::download::ProgressEvent| {
//!     println!("{} {}/{:?}", event.state, event.bytes_received, event.total_bytes);
//! });
//! let handle = registry.submit(DownloadRequest::new(
//!     "https://example.com/paper.pdf",
//!     "papers",
//!     "paper.pdf",
//! ))?;
//! let path = handle.wait().await?;
//! println!("Downloaded: {}", path.display());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
pub mod constants;
mod error;
pub mod filename;
mod progress;
mod registry;
mod request;
mod retry;
mod session;
mod storage;
mod transport;

pub use client::HttpClient;
pub use config::EngineConfig;
pub use error::{BoxError, DownloadError, ErrorKind, TransportError};
pub use progress::{ProgressEvent, ProgressObserver, ProgressPublisher, Subscription};
pub use registry::SessionRegistry;
pub use request::{DownloadKey, DownloadRequest};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_http_status,
    classify_transport_error,
};
pub use session::{SessionHandle, SessionSnapshot, SessionState};
pub use storage::{FsStorage, Storage, StorageWriter, default_download_root};
pub use transport::{
    ChunkStream, ProbeResponse, StreamResponse, Transport, parse_content_range_start,
    parse_content_range_total,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
