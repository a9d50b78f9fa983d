//! Progress fan-out from sessions to observers.
//!
//! Sessions publish [`ProgressEvent`]s; the [`ProgressPublisher`] forwards each
//! event to the observers subscribed to that key and to the wildcard
//! observers. Delivery is synchronous on the publishing session's task, which
//! keeps events for one key in production order. A panicking observer is
//! caught and logged; the remaining observers still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::warn;

use super::{DownloadKey, SessionState};

/// Point-in-time progress of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Which download this is about.
    pub key: DownloadKey,
    /// Bytes stored so far.
    pub bytes_received: u64,
    /// Full size, when known.
    pub total_bytes: Option<u64>,
    /// Session state at emission time.
    pub state: SessionState,
}

impl ProgressEvent {
    /// Completed fraction in `0.0..=1.0`, when the total is known and non-zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_received as f64 / total as f64).min(1.0))
            }
            _ => None,
        }
    }
}

/// Receives progress events.
///
/// Implemented for any `Fn(&ProgressEvent) + Send + Sync`.
pub trait ProgressObserver: Send + Sync {
    /// Called once per delivered event.
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Key(DownloadKey),
    All,
}

type ObserverList = Vec<(u64, Arc<dyn ProgressObserver>)>;

#[derive(Default)]
struct PublisherInner {
    next_id: AtomicU64,
    topics: DashMap<Topic, ObserverList>,
}

/// Cloneable handle to a shared observer registry.
#[derive(Clone, Default)]
pub struct ProgressPublisher {
    inner: Arc<PublisherInner>,
}

impl std::fmt::Debug for ProgressPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPublisher")
            .field("topics", &self.inner.topics.len())
            .finish()
    }
}

impl ProgressPublisher {
    /// Creates a publisher with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `observer` to events for `key`.
    ///
    /// Only events published after this call are delivered. The observer stays
    /// registered until the returned [`Subscription`] is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        key: DownloadKey,
        observer: impl ProgressObserver + 'static,
    ) -> Subscription {
        self.add(Topic::Key(key), Arc::new(observer))
    }

    /// Subscribes `observer` to events for every key.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_all(&self, observer: impl ProgressObserver + 'static) -> Subscription {
        self.add(Topic::All, Arc::new(observer))
    }

    /// Number of observers registered for `key` (wildcards excluded).
    #[must_use]
    pub fn observer_count(&self, key: &DownloadKey) -> usize {
        self.inner
            .topics
            .get(&Topic::Key(key.clone()))
            .map_or(0, |list| list.len())
    }

    /// Delivers `event` to the key's observers, then to wildcard observers.
    pub fn publish(&self, event: &ProgressEvent) {
        // Clone the lists out so no shard lock is held while observers run.
        let mut targets: ObserverList = self
            .inner
            .topics
            .get(&Topic::Key(event.key.clone()))
            .map(|list| list.clone())
            .unwrap_or_default();
        if let Some(list) = self.inner.topics.get(&Topic::All) {
            targets.extend(list.iter().cloned());
        }

        for (id, observer) in targets {
            let delivered = catch_unwind(AssertUnwindSafe(|| observer.on_progress(event)));
            if delivered.is_err() {
                warn!(
                    key = %event.key,
                    observer_id = id,
                    "progress observer panicked; continuing delivery"
                );
            }
        }
    }

    fn add(&self, topic: Topic, observer: Arc<dyn ProgressObserver>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push((id, observer));
        Subscription {
            publisher: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }
}

/// Keeps an observer registered; dropping it unsubscribes.
pub struct Subscription {
    publisher: Weak<PublisherInner>,
    topic: Topic,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    /// Removes the observer now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.publisher.upgrade() else {
            return;
        };
        let id = self.id;
        inner.topics.remove_if_mut(&self.topic, |_, list| {
            list.retain(|(observer_id, _)| *observer_id != id);
            list.is_empty()
        });
    }
}
