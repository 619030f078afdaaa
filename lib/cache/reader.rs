//! Reads of remote objects served through the local file cache.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::{debug, instrument};

use crate::bucket::{Bucket, BucketError, ObjectMeta};
use crate::cache::fcache::InvalidObjectPath;
use crate::cache::file_info::{FileInfo, FileInfoKey};
use crate::download::{DownloadError, JobManager, JobState};

/// Why a cached read failed.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The read starts past the end of the object.
    #[error("read at offset {offset} is past the end of the {size}-byte object")]
    OutOfRange {
        /// Requested start.
        offset: u64,
        /// Object size.
        size: u64,
    },

    /// The download serving the read failed.
    #[error("download failed: {0}")]
    Download(Arc<DownloadError>),

    /// The download serving the read was cancelled.
    #[error("download of {0:?} was cancelled")]
    Cancelled(String),

    /// The download could not be set up.
    #[error(transparent)]
    Setup(#[from] DownloadError),

    /// The object has no valid local path.
    #[error(transparent)]
    Path(#[from] InvalidObjectPath),

    /// A direct read from the bucket failed.
    #[error("remote read failed: {0}")]
    Remote(#[from] BucketError),

    /// The local file could not be read.
    #[error("local cache read failed: {0}")]
    LocalIo(#[from] std::io::Error),
}

/// Serves object reads from the file cache, downloading through a [`JobManager`].
///
/// Objects larger than the whole cache are read straight from the bucket.
pub struct CachedObjectReader<B: Bucket> {
    jobs: Arc<JobManager<B>>,
}

impl<B: Bucket> CachedObjectReader<B> {
    /// A reader downloading through `jobs`.
    pub fn new(jobs: Arc<JobManager<B>>) -> Self {
        Self { jobs }
    }

    /// The manager handing out download jobs.
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobManager<B>> {
        &self.jobs
    }

    /// Read up to `len` bytes of `object` starting at `offset`.
    ///
    /// Reads past the end are truncated. A read starting past the end is an error.
    #[instrument(name = "CachedObjectReader::read", skip(self), fields(object = %object.name))]
    pub async fn read(&self, object: &ObjectMeta, offset: u64, len: u64) -> Result<Bytes, ReadError> {
        if offset > object.size {
            return Err(ReadError::OutOfRange {
                offset,
                size: object.size,
            });
        }
        let end = offset.saturating_add(len).min(object.size);
        if end == offset {
            return Ok(Bytes::new());
        }

        let store = self.jobs.file_info();
        if object.size > store.max_weight() {
            debug!(size = object.size, "object exceeds cache capacity; reading directly");
            return self.read_direct(object, offset, end).await;
        }

        let key = FileInfoKey::new(self.jobs.bucket().name(), object.name.clone());
        store.invalidate_stale(&key, object.generation).await;
        let path = store.cache_dir().object_path(&key, object.generation)?;

        // A running job is the authority on how much of its file is written; the record may
        // still describe bytes a replacement job has not rewritten yet.
        let live = self.jobs.get(&key).filter(|job| {
            job.object().generation == object.generation && !job.status().state.is_terminal()
        });
        match store.look_up(&key) {
            Some(info) if info.offset >= end => {
                let written = live
                    .as_ref()
                    .map_or(info.offset, |job| job.status().offset.min(info.offset));
                if written >= end {
                    match read_local(&path, offset, end).await {
                        Ok(bytes) => return Ok(bytes),
                        Err(error) if live.is_some() => {
                            debug!(%error, "cached bytes unreadable; waiting on the running download");
                        }
                        Err(error) => {
                            debug!(%error, "cached bytes unreadable; downloading again");
                            store.erase(&key);
                            self.jobs.remove(&key).await;
                            self.admit(&key, object).await?;
                        }
                    }
                }
            }
            Some(_) => {}
            None => {
                // A finished job whose record was evicted no longer has its bytes on disk.
                if let Some(job) = self.jobs.get(&key)
                    && job.status().state.is_terminal()
                {
                    self.jobs.remove(&key).await;
                }
                self.admit(&key, object).await?;
            }
        }

        let job = self.jobs.get_or_create(object).await?;
        let status = job.download(end, true).await;
        match status.state {
            JobState::Failed(error) => return Err(ReadError::Download(error)),
            JobState::Cancelled => return Err(ReadError::Cancelled(object.name.clone())),
            JobState::NotStarted | JobState::Downloading | JobState::Completed => {}
        }

        // The job may have advanced past what the record says if the record was re-admitted.
        if store
            .peek(&key)
            .is_some_and(|info| info.offset < status.offset)
        {
            let evicted = store
                .update_offset(&key, object.generation, object.size, status.offset)
                .map_err(DownloadError::from)?;
            store.discard(evicted).await;
        }

        match read_local(&path, offset, end).await {
            Ok(bytes) => Ok(bytes),
            // The file was evicted and removed between the download and this read.
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                debug!(%error, "cached bytes went away; reading directly");
                self.read_direct(object, offset, end).await
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Register a fresh record for `object` as most recently used.
    async fn admit(&self, key: &FileInfoKey, object: &ObjectMeta) -> Result<(), ReadError> {
        let store = self.jobs.file_info();
        let evicted = store
            .insert(FileInfo {
                key: key.clone(),
                object_generation: object.generation,
                file_size: object.size,
                offset: 0,
            })
            .map_err(DownloadError::from)?;
        store.discard(evicted).await;
        Ok(())
    }

    async fn read_direct(&self, object: &ObjectMeta, offset: u64, end: u64) -> Result<Bytes, ReadError> {
        let reader = self
            .jobs
            .bucket()
            .new_reader(&object.name, object.generation, offset..end)
            .await?;
        let mut buf = Vec::new();
        reader
            .take(end - offset)
            .read_to_end(&mut buf)
            .await
            .map_err(BucketError::from)?;
        Ok(Bytes::from(buf))
    }
}

async fn read_local(path: &Path, offset: u64, end: u64) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let len = usize::try_from(end - offset).map_err(std::io::Error::other)?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
