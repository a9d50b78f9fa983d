//! reqwest-backed [`Transport`].
//!
//! The client is built once and reused so connection pooling applies across
//! sessions. Response decompression is not enabled: byte counts must match
//! what the server advertises in `Content-Length` / `Content-Range`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::transport::{parse_content_range_start, parse_content_range_total};
use super::{ProbeResponse, StreamResponse, Transport, TransportError};

/// HTTP transport for downloads.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use kdownload_core::download::{DownloadRequest, FsStorage, HttpClient, SessionRegistry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = SessionRegistry::new(
///     Arc::new(HttpClient::new()),
///     Arc::new(FsStorage::new("./downloads")),
/// );
/// let path = registry
///     .download(DownloadRequest::new("https://example.com/file.pdf", "papers", "file.pdf"))
///     .await?;
/// println!("Downloaded to: {}", path.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default connect (5s) and read (30s) timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static configuration.
    /// This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the supplied configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        Self::try_new(
            Duration::from_secs(connect_timeout_secs),
            Duration::from_secs(read_timeout_secs),
        )
        .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client, reporting builder failures instead of panicking.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error (for example, a TLS backend failure).
    pub fn try_new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = build_client(connect_timeout, read_timeout)?;
        Ok(Self { client })
    }

    async fn send_request(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: Option<&str>,
    ) -> Result<Response, TransportError> {
        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::timeout(url, "connect")
            } else {
                TransportError::connection(url, e)
            }
        })
    }

    /// Probe for servers that reject HEAD: a one-byte ranged GET.
    async fn probe_with_range(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ProbeResponse, TransportError> {
        let response = self
            .send_request(Method::GET, url, headers, Some("bytes=0-0"))
            .await?;
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            total_bytes: total_bytes(&response, 0),
            accepts_ranges: partial || accepts_byte_ranges(&response),
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    #[instrument(level = "debug", skip(self, headers), fields(url = %url))]
    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ProbeResponse, TransportError> {
        let response = self.send_request(Method::HEAD, url, headers, None).await?;
        let status = response.status().as_u16();
        if matches!(status, 405 | 501) {
            debug!(status, "HEAD rejected, probing with ranged GET");
            return self.probe_with_range(url, headers).await;
        }

        Ok(ProbeResponse {
            status,
            total_bytes: header_u64(&response, CONTENT_LENGTH),
            accepts_ranges: accepts_byte_ranges(&response),
        })
    }

    #[instrument(level = "debug", skip(self, headers), fields(url = %url))]
    async fn stream_get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range_start: Option<u64>,
    ) -> Result<StreamResponse, TransportError> {
        let range = range_start.map(|start| format!("bytes={start}-"));
        let response = self
            .send_request(Method::GET, url, headers, range.as_deref())
            .await?;

        let status = response.status().as_u16();
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let content_start = if partial {
            content_range(&response).and_then(parse_content_range_start)
        } else {
            None
        };
        let total = if response.status().is_success() {
            total_bytes(&response, range_start.unwrap_or(0))
        } else {
            None
        };
        debug!(status, total = ?total, "response headers received");

        let stream_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| {
                    if e.is_timeout() {
                        TransportError::timeout(stream_url.clone(), "read")
                    } else {
                        TransportError::stream(stream_url.clone(), e)
                    }
                })
            })
            .boxed();

        Ok(StreamResponse {
            status,
            partial,
            total_bytes: total,
            content_start,
            body,
        })
    }
}

fn build_client(connect_timeout: Duration, read_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .build()
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn accepts_byte_ranges(response: &Response) -> bool {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
}

fn content_range(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
}

/// Full resource size: `Content-Range` total for 206, else `Content-Length`.
///
/// A 206 without a usable `Content-Range` falls back to `range_start + Content-Length`.
fn total_bytes(response: &Response, range_start: u64) -> Option<u64> {
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return header_u64(response, CONTENT_LENGTH);
    }
    content_range(response)
        .and_then(parse_content_range_total)
        .or_else(|| {
            header_u64(response, CONTENT_LENGTH).map(|remaining| range_start.saturating_add(remaining))
        })
}
