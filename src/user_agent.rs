//! User-Agent sent with download requests unless the caller supplies one.

/// Default User-Agent for download requests (identifies the tool and version).
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("kdownload/{version}")
}
