//! Engine-wide tuning shared by every session a registry starts.

use std::time::Duration;

use super::RetryPolicy;
use super::constants::{CONNECT_TIMEOUT_SECS, PROGRESS_INTERVAL, READ_TIMEOUT_SECS};

/// Timeouts, retry policy and progress cadence for sessions.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backoff and retry ceiling, applied per session.
    pub retry_policy: RetryPolicy,
    /// Limit for the probe and for receiving response headers of a GET.
    pub connect_timeout: Duration,
    /// Limit for waiting on any single body chunk.
    pub read_timeout: Duration,
    /// Minimum spacing between progress events within one state.
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Replaces both timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Replaces the progress coalescing interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}
