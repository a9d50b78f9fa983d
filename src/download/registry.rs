//! Session registry: at most one active session per download key.
//!
//! Submitting a request whose key is already active joins the existing
//! session instead of starting a second transfer. Sessions remove themselves
//! when they reach a terminal state, before their outcome is published, so a
//! caller that observed the outcome can immediately resubmit the same key.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument};

use super::session::{Session, SessionDeps};
use super::{
    DownloadError, DownloadKey, DownloadRequest, EngineConfig, ProgressPublisher,
    SessionHandle, SessionSnapshot, Storage, Transport,
};

struct RegistryInner {
    sessions: DashMap<DownloadKey, SessionHandle>,
    deps: SessionDeps,
    next_id: AtomicU64,
}

/// Owns the table of active sessions.
///
/// Cheap to clone; clones share the same table and publisher.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.inner.sessions.len())
            .field("config", &self.inner.deps.config)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Creates a registry with default timeouts and retry policy.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn Storage>) -> Self {
        Self::with_config(transport, storage, EngineConfig::default())
    }

    /// Creates a registry with explicit engine settings.
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                deps: SessionDeps {
                    transport,
                    storage,
                    publisher: ProgressPublisher::new(),
                    config,
                },
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The publisher every session of this registry reports to.
    #[must_use]
    pub fn publisher(&self) -> &ProgressPublisher {
        &self.inner.deps.publisher
    }

    /// Starts a session for `request`, or joins the active one with the same key.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidRequest`] without creating a session
    /// when the request fails validation.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub fn submit(&self, request: DownloadRequest) -> Result<SessionHandle, DownloadError> {
        request.validate()?;
        let key = request.key();

        match self.inner.sessions.entry(key.clone()) {
            Entry::Occupied(active) => {
                debug!(key = %key, "joining active session");
                Ok(active.get().clone())
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let on_terminal = removal_hook(Arc::downgrade(&self.inner), key.clone(), id);
                let handle = Session::start(id, request, self.inner.deps.clone(), on_terminal)?;
                info!(key = %key, "session started");
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Submits `request` and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the validation error or the session's final error.
    pub async fn download(&self, request: DownloadRequest) -> Result<PathBuf, DownloadError> {
        self.submit(request)?.wait().await
    }

    /// Requests cancellation of the active session for `key`.
    ///
    /// Returns false when no session with that key is active.
    pub fn cancel(&self, key: &DownloadKey) -> bool {
        match self.inner.sessions.get(key) {
            Some(handle) => {
                debug!(key = %key, "cancel requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Requests cancellation of every active session.
    pub fn cancel_all(&self) {
        for entry in self.inner.sessions.iter() {
            entry.value().cancel();
        }
    }

    /// Snapshots of all active sessions, ordered by key.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Handle to the active session for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &DownloadKey) -> Option<SessionHandle> {
        self.inner.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Returns true when no session is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

/// Removes the entry for `key` only if it still belongs to session `id`.
fn removal_hook(
    registry: Weak<RegistryInner>,
    key: DownloadKey,
    id: u64,
) -> super::session::TerminalHook {
    Box::new(move || {
        if let Some(inner) = registry.upgrade() {
            inner
                .sessions
                .remove_if(&key, |_, handle| handle.id() == id);
            debug!(key = %key, "session removed from registry");
        }
    })
}
