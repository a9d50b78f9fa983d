//! Filename sanitization, temp naming, and duplicate-name resolution.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use url::Url;

use super::DownloadKey;
use super::Storage;
use super::constants::{MAX_DUPLICATE_SUFFIX, TEMP_KEY_PREFIX_LEN, TEMP_SUFFIX};

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Returns true when `name` is exactly one ordinary path segment.
pub(crate) fn is_safe_filename_segment(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Derives a filename from the URL's last path segment, or `download_<timestamp>.bin`.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
            debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
            last.into()
        });
        return sanitize_filename(&decoded);
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}.bin")
}

/// Temp file name for an in-flight download: `<name>.<key prefix>.part`.
///
/// Deterministic per key so a later session can pick up a cancelled transfer.
#[must_use]
pub fn temp_file_name(file_name: &str, key: &DownloadKey) -> String {
    format!(
        "{file_name}.{}.{TEMP_SUFFIX}",
        key.short(TEMP_KEY_PREFIX_LEN)
    )
}

/// Splits a filename into stem and extension (extension includes the dot).
///
/// A leading dot is part of the stem, so `.bashrc` has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Inserts `" (n)"` before the extension: `report.pdf` -> `report (2).pdf`.
#[must_use]
pub fn disambiguated_name(file_name: &str, n: u32) -> String {
    let (stem, ext) = split_extension(file_name);
    format!("{stem} ({n}){ext}")
}

/// Finds the first free path among `name`, `name (1)`, `name (2)`, ...
///
/// # Errors
///
/// Returns an IO error when the storage existence check fails or every
/// candidate up to the suffix limit is taken.
pub async fn resolve_available_path(
    storage: &dyn Storage,
    dir: &Path,
    file_name: &str,
) -> std::io::Result<PathBuf> {
    let base = dir.join(file_name);
    if !storage.exists(&base).await? {
        return Ok(base);
    }

    for n in 1..=MAX_DUPLICATE_SUFFIX {
        let candidate = dir.join(disambiguated_name(file_name, n));
        if !storage.exists(&candidate).await? {
            debug!(path = %candidate.display(), "resolved duplicate name");
            return Ok(candidate);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!(
            "no free name for {} after {MAX_DUPLICATE_SUFFIX} attempts",
            base.display()
        ),
    ))
}
