//! Transport contract: how the engine talks to the network.
//!
//! A transport performs exactly two operations, a lightweight probe and a
//! streamed GET, and reports raw status codes. Retry, resume and timeout policy
//! belong to the session, not the adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::TransportError;

/// Lazy sequence of body chunks, ending with end-of-stream or an error.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Result of a reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Full resource size, when the server reported one.
    pub total_bytes: Option<u64>,
    /// Whether the server advertised byte-range support.
    pub accepts_ranges: bool,
}

impl ProbeResponse {
    /// Returns true for statuses in `[200, 400)`.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Response to a streamed GET.
pub struct StreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// True when the server answered with partial content (206).
    pub partial: bool,
    /// Full resource size (not the remaining length), when known.
    pub total_bytes: Option<u64>,
    /// First byte offset of a partial body, from `Content-Range`.
    pub content_start: Option<u64>,
    /// The body.
    pub body: ChunkStream,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("partial", &self.partial)
            .field("total_bytes", &self.total_bytes)
            .field("content_start", &self.content_start)
            .finish_non_exhaustive()
    }
}

/// Network capability injected into the engine.
///
/// Implementations must honor `range_start` by sending
/// `Range: bytes=<start>-` and must report whether the server answered with
/// partial (206) or full (200) content. Non-2xx statuses are returned as
/// `Ok` responses; only failures to get a response at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lightweight reachability and size check.
    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ProbeResponse, TransportError>;

    /// Starts a streamed GET, optionally resuming at `range_start`.
    async fn stream_get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range_start: Option<u64>,
    ) -> Result<StreamResponse, TransportError>;
}

/// Parses the total size out of a `Content-Range` value such as `bytes 0-0/1234`.
#[must_use]
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Parses the first byte offset out of a `Content-Range` value such as `bytes 400-999/1000`.
#[must_use]
pub fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
