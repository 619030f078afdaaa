//! On-disk layout of the file cache.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::cache::file_info::FileInfoKey;
use crate::io;

/// Why a path cannot be used as the cache root.
#[derive(Debug, Error)]
pub enum InvalidRootPathError {
    /// The path exists but is not a directory.
    #[error("Root path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory holds files this program did not put there.
    #[error("Root path appears to contain data stemming from sources different to this app: {0}")]
    RootPathUnsafeCache(PathBuf),

    /// The path could not be inspected or created.
    #[error("IO error while accessing root path: {0}")]
    Io(#[from] std::io::Error),
}

/// An object name that cannot be mapped to a path inside the cache directory.
#[derive(Debug, Error)]
#[error("object {bucket:?}/{object:?} cannot be stored in the cache directory")]
pub struct InvalidObjectPath {
    /// Bucket of the rejected object.
    pub bucket: String,
    /// Name of the rejected object.
    pub object: String,
}

/// The directory holding cached object bytes and the file-info snapshot.
///
/// Cached bytes of generation `g` of object `o` in bucket `b` live at
/// `<root>/objects/<b>/<g>/<o>`, so two generations of one object never share a file.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    // Dangerous: Changing this constant may cause the program to treat existing cache directories
    // as invalid, and thus provide a worse user experience. Changing this will break backwards
    // compatibility with existing cache directories.
    const MARKER_FILE: &'static str = ".bucketfs_cache";
    const SNAPSHOT_FILE: &'static str = "file_info.snapshot";
    const OBJECTS_DIR: &'static str = "objects";

    /// Open (or create) a cache directory at the given path.
    ///
    /// If the path exists, it must either be an empty directory, or a directory which was
    /// previously used as a cache for this program. Existing contents are left alone; whether
    /// they are trusted is decided by the file-info restore.
    pub async fn open(path: &Path) -> Result<Self, InvalidRootPathError> {
        let mut pbuf = match tokio::fs::canonicalize(path).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::RootPathUnsafeCache(p));
                }
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await?;
                tokio::fs::canonicalize(path).await?
            }
            Err(e) => return Err(e.into()),
        };

        pbuf.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pbuf)
            .await?;
        pbuf.pop();

        info!(root = %pbuf.display(), "opened file cache directory");
        Ok(Self { root: pbuf })
    }

    /// The canonical root of the cache directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the file-info snapshot is persisted.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(Self::SNAPSHOT_FILE)
    }

    /// The directory every cached object file lives under.
    #[must_use]
    pub fn objects_root(&self) -> PathBuf {
        self.root.join(Self::OBJECTS_DIR)
    }

    /// The local file holding the cached bytes of `key` at `generation`.
    pub fn object_path(
        &self,
        key: &FileInfoKey,
        generation: i64,
    ) -> Result<PathBuf, InvalidObjectPath> {
        let invalid = || InvalidObjectPath {
            bucket: key.bucket.clone(),
            object: key.object.clone(),
        };

        let bucket = Path::new(&key.bucket);
        let object = Path::new(&key.object);
        let is_plain = |p: &Path| {
            let mut components = p.components().peekable();
            components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
        };
        if key.bucket.contains('/') || !is_plain(bucket) || !is_plain(object) {
            return Err(invalid());
        }

        Ok(self
            .objects_root()
            .join(bucket)
            .join(generation.to_string())
            .join(object))
    }

    /// Remove all cached bytes and the snapshot, keeping the directory and its marker.
    pub async fn clear(&self) -> std::io::Result<()> {
        io::remove_dir_contents(&self.root, &[Self::MARKER_FILE]).await
    }
}
