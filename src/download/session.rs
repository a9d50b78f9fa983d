//! Download session: one in-flight transfer driven by a single task.
//!
//! ```text
//! Pending -> Probing -> Downloading -> Finalizing -> Completed
//!              |  ^         |  ^           |
//!              v  |         v  |           v
//!            Retrying    Retrying        Failed
//!
//! any non-terminal state --cancel--> Cancelled
//! ```
//!
//! The task owns all mutable session state. Callers observe it through a
//! [`SessionHandle`], which reads a `watch` channel the task publishes to.
//! Every await (network, storage write, backoff sleep) races the cancellation
//! token. The writer is flushed before any exit. A write cut short by
//! cancellation can leave a chunk prefix in the temp file; the next session
//! measures the file instead of trusting the last reported byte count.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::filename::{resolve_available_path, temp_file_name};
use super::retry::{classify_http_status, classify_transport_error};
use super::{
    ChunkStream, DownloadError, DownloadKey, DownloadRequest, EngineConfig, ErrorKind,
    FailureType, ProbeResponse, ProgressEvent, ProgressPublisher, RetryDecision, Storage,
    StorageWriter, Transport, TransportError,
};
use crate::user_agent::default_download_user_agent;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, task not yet running.
    Pending,
    /// Checking reachability and size.
    Probing,
    /// Streaming the body into the temp file.
    Downloading,
    /// Waiting out a backoff delay.
    Retrying,
    /// Verifying size and moving the temp file into place.
    Finalizing,
    /// The file is at its final path.
    Completed,
    /// Gave up with an error.
    Failed,
    /// Stopped on request; the temp file is kept.
    Cancelled,
}

impl SessionState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name for logs and display.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Probing => "probing",
            Self::Downloading => "downloading",
            Self::Retrying => "retrying",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a session at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session key.
    pub key: DownloadKey,
    /// Source URL.
    pub url: String,
    /// Current state.
    pub state: SessionState,
    /// Bytes stored in the temp file.
    pub bytes_received: u64,
    /// Full size, once known.
    pub total_bytes: Option<u64>,
    /// Retries consumed so far.
    pub retries_used: u32,
    /// Kind of the most recent failure, if any.
    pub last_error: Option<ErrorKind>,
    /// Where the file lands (updated if a duplicate suffix is chosen).
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
struct SessionStatus {
    snapshot: SessionSnapshot,
    outcome: Option<Result<PathBuf, DownloadError>>,
}

/// Capabilities a session needs from its registry.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) publisher: ProgressPublisher,
    pub(crate) config: EngineConfig,
}

/// Cloneable handle to a running or finished session.
///
/// Every caller joined on the same key holds a handle to the same session and
/// receives the same outcome from [`wait`](Self::wait).
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    key: DownloadKey,
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.status.borrow().snapshot.state)
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The session's key.
    #[must_use]
    pub fn key(&self) -> &DownloadKey {
        &self.key
    }

    /// Current state and progress.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().snapshot.clone()
    }

    /// Returns true once an outcome is available.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.borrow().outcome.is_some()
    }

    /// Requests cancellation. Idempotent; a no-op once the session is terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the outcome: the final path, or the error that ended the session.
    ///
    /// # Errors
    ///
    /// Returns the session's [`DownloadError`]. If the driving task died
    /// without reporting, returns [`DownloadError::Aborted`].
    pub async fn wait(&self) -> Result<PathBuf, DownloadError> {
        let mut status = self.status.clone();
        let outcome = status
            .wait_for(|s| s.outcome.is_some())
            .await
            .ok()
            .and_then(|s| s.outcome.clone());
        outcome.unwrap_or_else(|| {
            Err(DownloadError::Aborted {
                url: self.status.borrow().snapshot.url.clone(),
            })
        })
    }
}

/// Runs once when the session leaves the registry's view.
pub(crate) type TerminalHook = Box<dyn FnOnce() + Send + 'static>;

/// Fires the hook on the normal path, or on drop if the task unwinds.
struct TerminalGuard(Option<TerminalHook>);

impl TerminalGuard {
    fn fire(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Why one probe or stream attempt ended.
enum AttemptError {
    /// Ends the session immediately.
    Fatal(DownloadError),
    /// May be retried depending on policy.
    Failed {
        failure_type: FailureType,
        message: String,
    },
}

impl AttemptError {
    fn failed(failure_type: FailureType, message: impl Into<String>) -> Self {
        Self::Failed {
            failure_type,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for AttemptError {
    fn from(error: DownloadError) -> Self {
        Self::Fatal(error)
    }
}

/// State owned by the driving task.
pub(crate) struct Session {
    key: DownloadKey,
    request: DownloadRequest,
    headers: BTreeMap<String, String>,
    deps: SessionDeps,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
    state: SessionState,
    bytes_received: u64,
    total_bytes: Option<u64>,
    retries_used: u32,
    last_error: Option<ErrorKind>,
    dir: PathBuf,
    temp_path: PathBuf,
    final_path: PathBuf,
    last_progress: Option<Instant>,
}

impl Session {
    /// Validates `request` and spawns its driving task.
    ///
    /// `on_terminal` runs after the session reaches a terminal state and
    /// before the outcome becomes visible to waiters.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        id: u64,
        request: DownloadRequest,
        deps: SessionDeps,
        on_terminal: TerminalHook,
    ) -> Result<SessionHandle, DownloadError> {
        request.validate()?;

        let key = request.key();
        let dir = deps.storage.resolve_dir(&request.destination_folder);
        let temp_path = dir.join(temp_file_name(&request.destination_file_name, &key));
        let final_path = dir.join(&request.destination_file_name);
        let cancel = CancellationToken::new();
        let (status, _) = watch::channel(SessionStatus {
            snapshot: placeholder_snapshot(&key),
            outcome: None,
        });

        let session = Self {
            key: key.clone(),
            headers: request_headers(&request),
            request,
            deps,
            cancel: cancel.clone(),
            status,
            state: SessionState::Pending,
            bytes_received: 0,
            total_bytes: None,
            retries_used: 0,
            last_error: None,
            dir,
            temp_path,
            final_path,
            last_progress: None,
        };
        let initial = session.snapshot();
        session.status.send_replace(SessionStatus {
            snapshot: initial,
            outcome: None,
        });

        let handle = SessionHandle {
            id,
            key: key.clone(),
            cancel,
            status: session.status.subscribe(),
        };

        let span = info_span!("session", key = %key, url = %session.request.url);
        tokio::spawn(
            session
                .run(TerminalGuard(Some(on_terminal)))
                .instrument(span),
        );
        Ok(handle)
    }

    async fn run(mut self, mut terminal: TerminalGuard) {
        self.transition(SessionState::Probing);
        let outcome = self.drive().await;

        match &outcome {
            Ok(path) => {
                info!(path = %path.display(), bytes = self.bytes_received, "download complete");
                self.transition(SessionState::Completed);
            }
            Err(error) if error.is_cancelled() => {
                info!(bytes = self.bytes_received, "download cancelled, partial file kept");
                self.transition(SessionState::Cancelled);
            }
            Err(error) => {
                warn!(error = %error, "download failed");
                self.last_error = Some(error.kind());
                self.transition(SessionState::Failed);
            }
        }

        terminal.fire();
        let snapshot = self.snapshot();
        self.status.send_replace(SessionStatus {
            snapshot,
            outcome: Some(outcome),
        });
    }

    async fn drive(&mut self) -> Result<PathBuf, DownloadError> {
        self.deps
            .storage
            .ensure_dir(&self.dir)
            .await
            .map_err(|e| DownloadError::storage(&self.dir, &e))?;
        self.adopt_partial().await?;

        if self.probe().await? {
            self.download().await?;
        }
        self.finalize().await
    }

    /// Picks up bytes left in the temp file by an earlier session.
    async fn adopt_partial(&mut self) -> Result<(), DownloadError> {
        let storage = &self.deps.storage;
        let exists = storage
            .exists(&self.temp_path)
            .await
            .map_err(|e| DownloadError::storage(&self.temp_path, &e))?;
        if exists {
            self.bytes_received = storage
                .size(&self.temp_path)
                .await
                .map_err(|e| DownloadError::storage(&self.temp_path, &e))?;
            debug!(bytes = self.bytes_received, "found partial download");
        }
        Ok(())
    }

    /// Probes until reachable. Returns whether the body still needs fetching.
    async fn probe(&mut self) -> Result<bool, DownloadError> {
        let url = self.request.url.clone();
        loop {
            let attempt = with_cancel(
                &self.cancel,
                &url,
                tokio::time::timeout(
                    self.deps.config.connect_timeout,
                    self.deps.transport.probe(&url, &self.headers),
                ),
            )
            .await?;

            let message = match attempt {
                Ok(Ok(probe)) if probe.is_reachable() => return self.reconcile_partial(probe).await,
                Ok(Ok(probe)) => format!("HTTP {}", probe.status),
                Ok(Err(error)) => error.to_string(),
                Err(_) => TransportError::timeout(&url, "probe").to_string(),
            };

            debug!(error = %message, "probe failed");
            self.last_error = Some(ErrorKind::Unreachable);
            if !self.backoff(FailureType::Transient, &message).await? {
                return Err(DownloadError::Unreachable {
                    url,
                    attempts: self.retries_used + 1,
                    last_error: message,
                });
            }
            self.transition(SessionState::Probing);
        }
    }

    /// Decides whether adopted bytes are still usable against the probe result.
    async fn reconcile_partial(&mut self, probe: ProbeResponse) -> Result<bool, DownloadError> {
        self.total_bytes = probe.total_bytes;
        if self.bytes_received == 0 {
            return Ok(true);
        }

        match probe.total_bytes {
            Some(total) if self.bytes_received == total => {
                info!(bytes = total, "partial file already complete");
                return Ok(false);
            }
            Some(total) if self.bytes_received > total => {
                warn!(
                    bytes = self.bytes_received,
                    total, "partial file larger than resource, restarting"
                );
                self.discard_partial().await?;
            }
            _ if !probe.accepts_ranges => {
                warn!(
                    bytes = self.bytes_received,
                    "server does not advertise range support, restarting"
                );
                self.discard_partial().await?;
            }
            _ => info!(bytes = self.bytes_received, "resuming partial download"),
        }
        Ok(true)
    }

    async fn download(&mut self) -> Result<(), DownloadError> {
        self.transition(SessionState::Downloading);
        loop {
            let (failure_type, message) = match self.stream_once().await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Failed {
                    failure_type,
                    message,
                }) => (failure_type, message),
            };

            debug!(error = %message, bytes = self.bytes_received, "transfer attempt failed");
            self.last_error = Some(ErrorKind::TransportInterrupted);
            if !self.backoff(failure_type, &message).await? {
                return Err(DownloadError::TransportInterrupted {
                    url: self.request.url.clone(),
                    bytes_received: self.bytes_received,
                    attempts: self.retries_used + 1,
                    last_error: message,
                });
            }
            self.transition(SessionState::Downloading);
        }
    }

    /// One GET: negotiate the range, then pump the body into the temp file.
    async fn stream_once(&mut self) -> Result<(), AttemptError> {
        let url = self.request.url.clone();
        let range_start = (self.bytes_received > 0).then_some(self.bytes_received);

        let response = with_cancel(
            &self.cancel,
            &url,
            tokio::time::timeout(
                self.deps.config.connect_timeout,
                self.deps.transport.stream_get(&url, &self.headers, range_start),
            ),
        )
        .await?;
        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Err(AttemptError::failed(
                    classify_transport_error(&error),
                    error.to_string(),
                ));
            }
            Err(_) => {
                return Err(AttemptError::failed(
                    FailureType::Transient,
                    TransportError::timeout(&url, "connect").to_string(),
                ));
            }
        };

        match (range_start, response.status) {
            (Some(start), _) if response.partial => match response.content_start {
                Some(0) => {
                    warn!(requested = start, "server resent partial content from byte 0, restarting");
                    self.discard_partial().await?;
                }
                Some(served) if served != start => {
                    warn!(requested = start, served, "partial content at wrong offset, restarting from zero");
                    self.discard_partial().await?;
                    return Err(AttemptError::failed(
                        FailureType::Transient,
                        format!("Content-Range starts at byte {served}, requested {start}"),
                    ));
                }
                _ => {}
            },
            (Some(start), 200) => {
                warn!(requested = start, "server ignored range request, restarting from zero");
                self.discard_partial().await?;
            }
            (Some(start), 416) => {
                warn!(requested = start, "range not satisfiable, restarting from zero");
                self.discard_partial().await?;
                return Err(AttemptError::failed(
                    FailureType::Transient,
                    format!("HTTP 416 for range starting at byte {start}"),
                ));
            }
            (None, status) if (200..300).contains(&status) => {}
            (_, status) => {
                return Err(AttemptError::failed(
                    classify_http_status(status),
                    format!("HTTP {status}"),
                ));
            }
        }
        if response.total_bytes.is_some() {
            self.total_bytes = response.total_bytes;
        }

        let mut writer = self
            .deps
            .storage
            .open_for_append(&self.temp_path)
            .await
            .map_err(|e| DownloadError::storage(&self.temp_path, &e))?;
        let mut body = response.body;

        let pumped = self.pump(&mut writer, &mut body).await;
        let flushed = writer
            .flush()
            .await
            .map_err(|e| DownloadError::storage(&self.temp_path, &e));

        match (pumped, flushed) {
            (Err(AttemptError::Fatal(error)), _) | (_, Err(error)) => Err(AttemptError::Fatal(error)),
            (pumped, Ok(())) => pumped,
        }
    }

    async fn pump(
        &mut self,
        writer: &mut StorageWriter,
        body: &mut ChunkStream,
    ) -> Result<(), AttemptError> {
        let url = self.request.url.clone();
        loop {
            let next = with_cancel(
                &self.cancel,
                &url,
                tokio::time::timeout(self.deps.config.read_timeout, body.next()),
            )
            .await?;

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => return Ok(()),
                Ok(Some(Err(error))) => {
                    return Err(AttemptError::failed(
                        classify_transport_error(&error),
                        error.to_string(),
                    ));
                }
                Err(_) => {
                    return Err(AttemptError::failed(
                        FailureType::Transient,
                        TransportError::timeout(&url, "read").to_string(),
                    ));
                }
            };

            with_cancel(&self.cancel, &url, writer.write_all(&chunk))
                .await?
                .map_err(|e| DownloadError::storage(&self.temp_path, &e))?;
            self.bytes_received += chunk.len() as u64;
            self.emit_progress(false);
        }
    }

    async fn finalize(&mut self) -> Result<PathBuf, DownloadError> {
        self.transition(SessionState::Finalizing);
        let storage = Arc::clone(&self.deps.storage);

        if let Some(expected) = self.total_bytes
            && expected != self.bytes_received
        {
            let error =
                DownloadError::size_mismatch(&self.temp_path, expected, self.bytes_received);
            if let Err(e) = storage.delete(&self.temp_path).await {
                warn!(path = %self.temp_path.display(), error = %e, "could not remove temp file");
            }
            return Err(error);
        }

        if self.cancel.is_cancelled() {
            return Err(DownloadError::cancelled(&self.request.url));
        }

        let target = if self.request.allow_duplicate {
            resolve_available_path(
                storage.as_ref(),
                &self.dir,
                &self.request.destination_file_name,
            )
            .await
            .map_err(|e| DownloadError::storage(&self.final_path, &e))?
        } else {
            let occupied = storage
                .exists(&self.final_path)
                .await
                .map_err(|e| DownloadError::storage(&self.final_path, &e))?;
            if occupied {
                debug!(path = %self.final_path.display(), "replacing existing file");
                storage
                    .delete(&self.final_path)
                    .await
                    .map_err(|e| DownloadError::cannot_overwrite(&self.final_path, &e))?;
            }
            self.final_path.clone()
        };

        storage
            .atomic_rename(&self.temp_path, &target)
            .await
            .map_err(|e| DownloadError::storage(&target, &e))?;
        self.final_path.clone_from(&target);
        Ok(target)
    }

    /// Consumes one retry if policy allows, sleeping through the backoff.
    async fn backoff(
        &mut self,
        failure_type: FailureType,
        message: &str,
    ) -> Result<bool, DownloadError> {
        match self
            .deps
            .config
            .retry_policy
            .should_retry(failure_type, self.retries_used)
        {
            RetryDecision::Retry { delay, attempt } => {
                self.retries_used = attempt;
                info!(
                    retry = attempt,
                    delay_ms = delay.as_millis(),
                    error = %message,
                    "retrying"
                );
                self.transition(SessionState::Retrying);
                with_cancel(&self.cancel, &self.request.url, tokio::time::sleep(delay)).await?;
                Ok(true)
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(%reason, "not retrying");
                Ok(false)
            }
        }
    }

    /// Deletes the temp file and resets progress to zero.
    async fn discard_partial(&mut self) -> Result<(), DownloadError> {
        match self.deps.storage.delete(&self.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::storage(&self.temp_path, &e)),
        }
        self.bytes_received = 0;
        self.emit_progress(true);
        Ok(())
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state transition");
        }
        self.state = state;
        self.emit_progress(true);
    }

    /// Publishes progress; unforced events are coalesced to the configured interval.
    fn emit_progress(&mut self, force: bool) {
        let now = Instant::now();
        if !force
            && let Some(last) = self.last_progress
            && now.duration_since(last) < self.deps.config.progress_interval
        {
            return;
        }
        self.last_progress = Some(now);

        self.deps.publisher.publish(&ProgressEvent {
            key: self.key.clone(),
            bytes_received: self.bytes_received,
            total_bytes: self.total_bytes,
            state: self.state,
        });
        let snapshot = self.snapshot();
        self.status.send_modify(|status| status.snapshot = snapshot);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            url: self.request.url.clone(),
            state: self.state,
            bytes_received: self.bytes_received,
            total_bytes: self.total_bytes,
            retries_used: self.retries_used,
            last_error: self.last_error,
            destination: self.final_path.clone(),
        }
    }
}

fn placeholder_snapshot(key: &DownloadKey) -> SessionSnapshot {
    SessionSnapshot {
        key: key.clone(),
        url: String::new(),
        state: SessionState::Pending,
        bytes_received: 0,
        total_bytes: None,
        retries_used: 0,
        last_error: None,
        destination: PathBuf::new(),
    }
}

/// Caller headers plus a default User-Agent unless the caller set one.
fn request_headers(request: &DownloadRequest) -> BTreeMap<String, String> {
    let mut headers = request.headers.clone();
    if !headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("user-agent"))
    {
        headers.insert("User-Agent".to_string(), default_download_user_agent());
    }
    headers
}

/// Races `fut` against cancellation; cancellation wins ties.
async fn with_cancel<F: Future>(
    token: &CancellationToken,
    url: &str,
    fut: F,
) -> Result<F::Output, DownloadError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(DownloadError::cancelled(url)),
        output = fut => Ok(output),
    }
}
