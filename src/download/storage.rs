//! Storage contract and the local filesystem adapter.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, BufWriter};
use tracing::{debug, instrument};

/// Writable handle returned by [`Storage::open_for_append`].
pub type StorageWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// File capability injected into the engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Maps a request's destination folder to a concrete directory.
    fn resolve_dir(&self, folder: &str) -> PathBuf;

    /// Creates `dir` (and parents) if missing.
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()>;

    /// Opens `path` for appending, creating it when absent.
    async fn open_for_append(&self, path: &Path) -> io::Result<StorageWriter>;

    /// Returns whether `path` exists.
    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Returns the size of `path` in bytes.
    async fn size(&self, path: &Path) -> io::Result<u64>;

    /// Moves `src` to `dst` in one step.
    async fn atomic_rename(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Removes `path`.
    async fn delete(&self, path: &Path) -> io::Result<()>;
}

/// [`Storage`] backed by `tokio::fs`.
///
/// Relative folders resolve under `root`; absolute folders are used as given.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Creates a storage adapter rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a storage adapter rooted at the user's downloads directory.
    ///
    /// Falls back to the current directory when no home directory is set.
    #[must_use]
    pub fn user_downloads() -> Self {
        Self::new(default_download_root())
    }
}

#[async_trait]
impl Storage for FsStorage {
    fn resolve_dir(&self, folder: &str) -> PathBuf {
        let folder = folder.trim();
        if folder.is_empty() {
            self.root.clone()
        } else {
            self.root.join(folder)
        }
    }

    async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }

    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    async fn open_for_append(&self, path: &Path) -> io::Result<StorageWriter> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Box::new(BufWriter::new(file)))
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn atomic_rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        debug!(src = %src.display(), dst = %dst.display(), "renaming");
        tokio::fs::rename(src, dst).await
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// `$HOME/Downloads` (or `%USERPROFILE%\Downloads`), else `.`.
#[must_use]
pub fn default_download_root() -> PathBuf {
    ["HOME", "USERPROFILE"]
        .iter()
        .find_map(|name| std::env::var_os(name).filter(|v| !v.is_empty()))
        .map_or_else(|| PathBuf::from("."), |home| PathBuf::from(home).join("Downloads"))
}
