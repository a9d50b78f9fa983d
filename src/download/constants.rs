//! Constants for the download module (timeouts, retry backoff, progress pacing).

use std::time::Duration;

/// Default connect timeout for probe and stream requests (5 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default per-chunk read timeout (30 seconds).
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Default minimum spacing between coalesced progress events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Suffix appended to in-flight temp files.
pub const TEMP_SUFFIX: &str = "part";

/// Number of key hex characters embedded in temp file names.
pub const TEMP_KEY_PREFIX_LEN: usize = 12;

/// Upper bound on `" (n)"` disambiguation before giving up.
pub const MAX_DUPLICATE_SUFFIX: u32 = 10_000;
