//! Download requests and the keys used to deduplicate them.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use super::DownloadError;
use super::filename::is_safe_filename_segment;

/// A request to download `url` into `destination_folder/destination_file_name`.
///
/// Once submitted, the session works on its own copy; later changes to the
/// caller's value have no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source URL (http or https).
    pub url: String,
    /// Folder to save into. Relative folders resolve under the storage root.
    pub destination_folder: String,
    /// File name inside the folder.
    pub destination_file_name: String,
    /// Extra request headers sent with the probe and every GET.
    pub headers: BTreeMap<String, String>,
    /// When false, an existing destination file is replaced.
    /// When true, the new file gets a `" (n)"` suffix instead.
    pub allow_duplicate: bool,
}

impl DownloadRequest {
    /// Creates a request with no extra headers that replaces existing files.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        destination_folder: impl Into<String>,
        destination_file_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            destination_folder: destination_folder.into(),
            destination_file_name: destination_file_name.into(),
            headers: BTreeMap::new(),
            allow_duplicate: false,
        }
    }

    /// Adds one request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds several request headers.
    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the duplicate policy.
    #[must_use]
    pub fn allow_duplicate(mut self, allow: bool) -> Self {
        self.allow_duplicate = allow;
        self
    }

    /// Returns the deduplication key for this request.
    #[must_use]
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(
            &self.url,
            &self.destination_folder,
            &self.destination_file_name,
        )
    }

    /// Checks that the request can be started.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidRequest`] when the URL is empty, does not
    /// parse, or is not http/https, or when the file name is empty or not a
    /// single safe path segment. The URL, folder and file name are used
    /// verbatim for the key and the paths, so surrounding whitespace is
    /// rejected rather than trimmed.
    pub fn validate(&self) -> Result<(), DownloadError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(DownloadError::invalid_request("URL is empty"));
        }
        for (field, value) in [
            ("URL", self.url.as_str()),
            ("folder", self.destination_folder.as_str()),
            ("file name", self.destination_file_name.as_str()),
        ] {
            if value.trim() != value {
                return Err(DownloadError::invalid_request(format!(
                    "{field} '{value}' has leading or trailing whitespace"
                )));
            }
        }
        let parsed = Url::parse(url)
            .map_err(|e| DownloadError::invalid_request(format!("invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_request(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let name = self.destination_file_name.trim();
        if name.is_empty() {
            return Err(DownloadError::invalid_request("file name is empty"));
        }
        if !is_safe_filename_segment(name) {
            return Err(DownloadError::invalid_request(format!(
                "file name '{name}' must be a single path segment"
            )));
        }

        for (header, value) in &self.headers {
            if !is_valid_header_name(header) {
                return Err(DownloadError::invalid_request(format!(
                    "invalid header name '{header}'"
                )));
            }
            if value.contains(['\r', '\n', '\0']) {
                return Err(DownloadError::invalid_request(format!(
                    "invalid value for header '{header}'"
                )));
            }
        }
        Ok(())
    }
}

/// RFC 9110 token characters.
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Stable identity of a logical download target.
///
/// Derived from the URL, folder and file name only; headers and the duplicate
/// policy do not take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadKey(String);

impl DownloadKey {
    /// Derives the key for a target.
    #[must_use]
    pub fn new(url: &str, folder: &str, file_name: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [url, folder, file_name] {
            hasher.update(part.as_bytes());
            // NUL separator keeps ("ab", "c") distinct from ("a", "bc").
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Returns the full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first `len` hex characters (used in temp file names).
    #[must_use]
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short(16))
    }
}
