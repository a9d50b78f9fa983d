//! In-memory transport driven by a script of per-call behaviors.
//!
//! Serves one fixed resource. Each `probe` / `stream_get` call pops the next
//! scripted step; once a script is empty the transport behaves like a
//! well-behaved range-capable server.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use kdownload_core::download::{
    ChunkStream, ProbeResponse, StreamResponse, Transport, TransportError,
};

/// Behavior of one probe call.
#[derive(Debug, Clone)]
pub enum ProbeStep {
    /// 200 with the resource size.
    Ok,
    /// Answer with this status.
    Status(u16),
    /// Fail before any response.
    ConnectError,
    /// Wait, then answer like `Ok`.
    Delay(Duration),
    /// Never answer.
    Stall,
}

/// Behavior of one streamed GET.
#[derive(Debug, Clone)]
pub enum StreamStep {
    /// Honor the range and send the rest of the resource.
    Serve,
    /// Honor the range, then break the stream after `after` bytes.
    Interrupt { after: usize },
    /// Honor the range, send `after` bytes, then go silent.
    Stall { after: usize },
    /// 200 with the whole resource regardless of the range.
    IgnoreRange,
    /// 206 with the resource from byte `from`, whatever range was asked for.
    MisplacedRange { from: usize },
    /// 200 advertising the full size but ending after `len` bytes.
    Truncate { len: usize },
    /// Answer with this status and an empty body.
    Status(u16),
    /// Fail before any response.
    ConnectError,
}

enum Tail {
    End,
    Error(String),
    Pending,
}

pub struct ScriptedTransport {
    content: Bytes,
    chunk_size: usize,
    accepts_ranges: bool,
    probe_script: Mutex<VecDeque<ProbeStep>>,
    stream_script: Mutex<VecDeque<StreamStep>>,
    probe_calls: AtomicU32,
    range_starts: Mutex<Vec<Option<u64>>>,
    seen_headers: Mutex<Vec<BTreeMap<String, String>>>,
}

impl ScriptedTransport {
    pub fn serving(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            chunk_size: 100,
            accepts_ranges: true,
            probe_script: Mutex::new(VecDeque::new()),
            stream_script: Mutex::new(VecDeque::new()),
            probe_calls: AtomicU32::new(0),
            range_starts: Mutex::new(Vec::new()),
            seen_headers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    pub fn probe_steps(self, steps: impl IntoIterator<Item = ProbeStep>) -> Self {
        *self.probe_script.lock().unwrap() = steps.into_iter().collect();
        self
    }

    pub fn stream_steps(self, steps: impl IntoIterator<Item = StreamStep>) -> Self {
        *self.stream_script.lock().unwrap() = steps.into_iter().collect();
        self
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.range_starts.lock().unwrap().len()
    }

    /// Range start of every streamed GET, in call order.
    pub fn range_starts(&self) -> Vec<Option<u64>> {
        self.range_starts.lock().unwrap().clone()
    }

    pub fn last_headers(&self) -> Option<BTreeMap<String, String>> {
        self.seen_headers.lock().unwrap().last().cloned()
    }

    fn total(&self) -> u64 {
        self.content.len() as u64
    }

    fn probe_ok(&self) -> ProbeResponse {
        ProbeResponse {
            status: 200,
            total_bytes: Some(self.total()),
            accepts_ranges: self.accepts_ranges,
        }
    }

    fn next_probe(&self) -> ProbeStep {
        self.probe_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProbeStep::Ok)
    }

    fn next_stream(&self) -> StreamStep {
        self.stream_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamStep::Serve)
    }

    fn ranged(&self, range_start: Option<u64>, limit: usize, tail: Tail) -> StreamResponse {
        match range_start {
            Some(start) if self.accepts_ranges => {
                let start = usize::try_from(start).unwrap();
                if start >= self.content.len() {
                    self.empty(416)
                } else {
                    self.partial(start, limit, tail)
                }
            }
            _ => {
                let body = self.content.slice(..limit.min(self.content.len()));
                self.respond(200, body, None, tail)
            }
        }
    }

    fn partial(&self, start: usize, limit: usize, tail: Tail) -> StreamResponse {
        let body = self.content.slice(start..);
        let body = body.slice(..limit.min(body.len()));
        self.respond(206, body, Some(start as u64), tail)
    }

    fn empty(&self, status: u16) -> StreamResponse {
        StreamResponse {
            status,
            partial: false,
            total_bytes: None,
            content_start: None,
            body: stream::empty().boxed(),
        }
    }

    fn respond(
        &self,
        status: u16,
        body: Bytes,
        content_start: Option<u64>,
        tail: Tail,
    ) -> StreamResponse {
        let chunks: Vec<Result<Bytes, TransportError>> = body
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        let head = stream::iter(chunks);
        let body: ChunkStream = match tail {
            Tail::End => head.boxed(),
            Tail::Error(url) => head
                .chain(stream::once(async move {
                    Err(TransportError::stream(url, "connection reset by peer"))
                }))
                .boxed(),
            Tail::Pending => head.chain(stream::pending()).boxed(),
        };
        StreamResponse {
            status,
            partial: status == 206,
            total_bytes: Some(self.total()),
            content_start,
            body,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ProbeResponse, TransportError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_headers.lock().unwrap().push(headers.clone());

        match self.next_probe() {
            ProbeStep::Ok => Ok(self.probe_ok()),
            ProbeStep::Status(status) => Ok(ProbeResponse {
                status,
                total_bytes: None,
                accepts_ranges: false,
            }),
            ProbeStep::ConnectError => Err(TransportError::connection(url, "connection refused")),
            ProbeStep::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.probe_ok())
            }
            ProbeStep::Stall => std::future::pending().await,
        }
    }

    async fn stream_get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range_start: Option<u64>,
    ) -> Result<StreamResponse, TransportError> {
        self.range_starts.lock().unwrap().push(range_start);
        self.seen_headers.lock().unwrap().push(headers.clone());

        match self.next_stream() {
            StreamStep::Serve => Ok(self.ranged(range_start, usize::MAX, Tail::End)),
            StreamStep::Interrupt { after } => Ok(self.ranged(
                range_start,
                after,
                Tail::Error(url.to_string()),
            )),
            StreamStep::Stall { after } => {
                Ok(self.ranged(range_start, after, Tail::Pending))
            }
            StreamStep::IgnoreRange => Ok(self.respond(200, self.content.clone(), None, Tail::End)),
            StreamStep::MisplacedRange { from } => Ok(self.partial(from, usize::MAX, Tail::End)),
            StreamStep::Truncate { len } => {
                let len = len.min(self.content.len());
                Ok(self.respond(200, self.content.slice(..len), None, Tail::End))
            }
            StreamStep::Status(status) => Ok(self.empty(status)),
            StreamStep::ConnectError => Err(TransportError::connection(url, "connection refused")),
        }
    }
}
