//! A background download of one object generation into the local file cache.
//!
//! Callers ask a [`Job`] for "at least `offset` bytes". The first such call spawns the fetch
//! task. Callers that want to wait register a one-shot subscription which fires as soon as the
//! job's offset reaches theirs, or the job reaches a terminal state. Subscriptions fire in the
//! order they were registered.

use std::collections::VecDeque;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, info_span, instrument, warn};

use crate::bucket::{Bucket, BucketError, ObjectMeta};
use crate::cache::fcache::InvalidObjectPath;
use crate::cache::file_info::{FileInfoError, FileInfoKey, FileInfoStore};
use crate::sync::{Mutex, lock};

/// Why a download, or setting one up, failed.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The bucket refused a stat or a ranged read.
    #[error("remote read failed: {0}")]
    Remote(#[from] BucketError),

    /// The object was replaced after the job was created.
    #[error("object {name:?} changed generation from {expected} to {actual}")]
    GenerationMismatch {
        /// Object name.
        name: String,
        /// Generation the job was created for.
        expected: i64,
        /// Generation the bucket reported.
        actual: i64,
    },

    /// A ranged read ended early.
    #[error("remote returned {actual} bytes for a {expected}-byte read at offset {offset}")]
    ShortRead {
        /// Start of the read.
        offset: u64,
        /// Bytes asked for.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// Writing the local file failed.
    #[error("local cache file {path}: {source}")]
    LocalIo {
        /// The local file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The object would never fit in the file cache.
    #[error("object {name:?} is {size} bytes but the file cache holds at most {capacity}")]
    TooLarge {
        /// Object name.
        name: String,
        /// Object size in bytes.
        size: u64,
        /// Cache capacity in bytes.
        capacity: u64,
    },

    /// Progress could not be recorded.
    #[error(transparent)]
    FileInfo(#[from] FileInfoError),

    /// The object has no valid local path.
    #[error(transparent)]
    Path(#[from] InvalidObjectPath),

    /// The fetch task went away without reaching a terminal state.
    #[error("download task stopped unexpectedly")]
    Aborted,
}

/// Lifecycle of a [`Job`].
///
/// `NotStarted -> Downloading -> {Completed, Failed, Cancelled}`; `NotStarted` may also go
/// straight to `Cancelled`. Terminal states never change.
#[derive(Debug, Clone)]
pub enum JobState {
    /// Nobody has asked for bytes yet.
    NotStarted,
    /// The fetch task is running.
    Downloading,
    /// Every byte of the object is in the local file.
    Completed,
    /// The fetch stopped on an error, shared by everyone who observes it.
    Failed(Arc<DownloadError>),
    /// Stopped by [`Job::cancel`].
    Cancelled,
}

impl JobState {
    /// Whether the state can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    /// Short lowercase name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl PartialEq for JobState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Failed(a), Self::Failed(b)) => Arc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for JobState {}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "failed: {e}"),
            other => f.write_str(other.name()),
        }
    }
}

/// A snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Where the job is in its lifecycle.
    pub state: JobState,
    /// Bytes `[0, offset)` are present in the local file.
    pub offset: u64,
}

impl JobStatus {
    /// The failure, if the job failed.
    #[must_use]
    pub fn error(&self) -> Option<&Arc<DownloadError>> {
        match &self.state {
            JobState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

struct Subscriber {
    id: u64,
    offset: u64,
    tx: oneshot::Sender<JobStatus>,
}

struct JobInner {
    status: JobStatus,
    subscribers: VecDeque<Subscriber>,
    next_subscriber: u64,
}

impl JobInner {
    fn subscribe(&mut self, offset: u64) -> (u64, oneshot::Receiver<JobStatus>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.push_back(Subscriber { id, offset, tx });
        (id, rx)
    }

    /// Fire every subscriber satisfied by the current status, or all of them once terminal.
    fn notify_subscribers(&mut self) {
        let fire_all = self.status.state.is_terminal();
        let mut waiting = VecDeque::with_capacity(self.subscribers.len());
        for sub in self.subscribers.drain(..) {
            if fire_all || self.status.offset >= sub.offset {
                // The receiver may have given up already.
                let _ = sub.tx.send(self.status.clone());
            } else {
                waiting.push_back(sub);
            }
        }
        self.subscribers = waiting;
    }
}

/// Download of one object generation.
pub struct Job<B: Bucket> {
    object: ObjectMeta,
    key: FileInfoKey,
    local_path: PathBuf,
    chunk_size: u64,
    bucket: Arc<B>,
    file_info: Arc<FileInfoStore>,
    inner: Mutex<JobInner>,
    cancel: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl<B: Bucket> fmt::Debug for Job<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("object", &self.object)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<B: Bucket> Job<B> {
    /// Prepare a download of `object`, fetched `chunk_size` bytes at a time.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(
        object: ObjectMeta,
        bucket: Arc<B>,
        file_info: Arc<FileInfoStore>,
        chunk_size: u64,
    ) -> Result<Arc<Self>, DownloadError> {
        assert!(chunk_size > 0, "chunk_size must be positive");

        let key = FileInfoKey::new(bucket.name(), object.name.clone());
        let local_path = file_info
            .cache_dir()
            .object_path(&key, object.generation)?;
        let (stopped, _) = watch::channel(false);

        Ok(Arc::new(Self {
            object,
            key,
            local_path,
            chunk_size,
            bucket,
            file_info,
            inner: Mutex::new(JobInner {
                status: JobStatus {
                    state: JobState::NotStarted,
                    offset: 0,
                },
                subscribers: VecDeque::new(),
                next_subscriber: 0,
            }),
            cancel: CancellationToken::new(),
            stopped,
        }))
    }

    /// The object generation being downloaded.
    #[must_use]
    pub fn object(&self) -> &ObjectMeta {
        &self.object
    }

    /// The file-info key the job records progress under.
    #[must_use]
    pub fn key(&self) -> &FileInfoKey {
        &self.key
    }

    /// The local file this job writes.
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// A snapshot of the current state and offset.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        lock(&self.inner).status.clone()
    }

    /// Number of callers currently waiting on this job.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Ask for at least `offset` bytes, starting the download if needed.
    ///
    /// `offset` is clamped to the object size. Without `wait_for_download` the current status is
    /// returned immediately. Otherwise this resolves once the offset is reached or the job
    /// terminates. Dropping the returned future withdraws the subscription, so a caller-side
    /// timeout leaves nothing behind.
    #[instrument(name = "Job::download", skip(self), fields(object = %self.object.name))]
    pub async fn download(self: &Arc<Self>, offset: u64, wait_for_download: bool) -> JobStatus {
        let offset = offset.min(self.object.size);

        let (id, rx) = {
            let mut inner = lock(&self.inner);
            if matches!(inner.status.state, JobState::NotStarted) {
                inner.status.state = JobState::Downloading;
                self.spawn_fetch();
            }

            if !wait_for_download
                || inner.status.state.is_terminal()
                || inner.status.offset >= offset
            {
                return inner.status.clone();
            }
            inner.subscribe(offset)
        };

        let _subscription = Subscription { job: self, id };
        match rx.await {
            Ok(status) => status,
            // Senders are only dropped after sending or when the job is torn down.
            Err(_) => self.status(),
        }
    }

    /// Stop the download. Subscribers are released with a `Cancelled` status.
    ///
    /// Idempotent; terminal jobs are left untouched. Returns the resulting status.
    pub fn cancel(&self) -> JobStatus {
        let mut inner = lock(&self.inner);
        if !inner.status.state.is_terminal() {
            let started = !matches!(inner.status.state, JobState::NotStarted);
            inner.status.state = JobState::Cancelled;
            self.cancel.cancel();
            inner.notify_subscribers();
            if !started {
                self.stopped.send_replace(true);
            }
            info!(object = %self.object.name, offset = inner.status.offset, "download cancelled");
        }
        inner.status.clone()
    }

    /// Resolve once no task is writing this job's local file any more.
    ///
    /// Never resolves for a job that was neither started nor cancelled.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Must be called with the inner lock held.
    fn spawn_fetch(self: &Arc<Self>) {
        self.file_info
            .mark_downloading(&self.key, self.object.generation);
        // Built before the task exists so the claim is released even if it is never polled.
        let guard = RunGuard {
            job: Arc::clone(self),
            released: false,
        };

        let span = info_span!("download", object = %self.object.name, generation = self.object.generation);
        tokio::spawn(
            async move {
                let job = Arc::clone(&guard.job);
                tokio::select! {
                    biased;
                    () = job.cancel.cancelled() => {
                        debug!("fetch interrupted by cancellation");
                    }
                    result = job.fetch() => {
                        if let Err(error) = result {
                            job.fail(error);
                        }
                    }
                }
                guard.release().await;
            }
            .instrument(span),
        );
    }

    async fn fetch(&self) -> Result<(), DownloadError> {
        let current = self.bucket.stat_object(&self.object.name).await?;
        if current.generation != self.object.generation {
            return Err(DownloadError::GenerationMismatch {
                name: self.object.name.clone(),
                expected: self.object.generation,
                actual: current.generation,
            });
        }

        let local_io = |source| DownloadError::LocalIo {
            path: self.local_path.clone(),
            source,
        };
        if let Some(parent) = self.local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(local_io)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.local_path)
            .await
            .map_err(local_io)?;

        // Bytes a record already vouches for are kept; readers may be serving them right now.
        let size = self.object.size;
        let on_disk = file.metadata().await.map_err(local_io)?.len();
        let recorded = self
            .file_info
            .peek(&self.key)
            .filter(|info| info.object_generation == self.object.generation)
            .map_or(0, |info| info.offset);
        let mut offset: u64 = recorded.min(on_disk).min(size);
        file.set_len(offset).await.map_err(local_io)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(local_io)?;
        if offset > 0 {
            debug!(offset, "resuming after bytes already on disk");
            if offset < size && !self.record_progress(offset).await? {
                return Ok(());
            }
        }

        let mut buf = Vec::new();
        loop {
            let end = offset.saturating_add(self.chunk_size).min(size);
            if end > offset {
                let expected = end - offset;
                let reader = self
                    .bucket
                    .new_reader(&self.object.name, self.object.generation, offset..end)
                    .await?;
                buf.clear();
                reader
                    .take(expected)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(BucketError::from)?;
                if buf.len() as u64 != expected {
                    return Err(DownloadError::ShortRead {
                        offset,
                        expected,
                        actual: buf.len() as u64,
                    });
                }

                file.write_all(&buf).await.map_err(local_io)?;
                file.flush().await.map_err(local_io)?;
            }
            if end == size {
                file.sync_all().await.map_err(local_io)?;
            }

            offset = end;
            if !self.record_progress(offset).await? || offset == size {
                return Ok(());
            }
        }
    }

    /// Publish progress. Returns `false` once the job has been stopped from outside.
    async fn record_progress(&self, offset: u64) -> Result<bool, DownloadError> {
        let evicted = {
            let mut inner = lock(&self.inner);
            if inner.status.state.is_terminal() {
                return Ok(false);
            }
            let evicted = self.file_info.update_offset(
                &self.key,
                self.object.generation,
                self.object.size,
                offset,
            )?;
            inner.status.offset = offset;
            if offset == self.object.size {
                inner.status.state = JobState::Completed;
                info!(object = %self.object.name, bytes = offset, "download completed");
            }
            inner.notify_subscribers();
            evicted
        };
        self.file_info.discard(evicted).await;
        Ok(true)
    }

    fn fail(&self, error: DownloadError) {
        let mut inner = lock(&self.inner);
        if inner.status.state.is_terminal() {
            return;
        }
        warn!(object = %self.object.name, %error, "download failed");
        inner.status.state = JobState::Failed(Arc::new(error));
        inner.notify_subscribers();
    }
}

/// Withdraws a pending subscription when the waiting caller goes away.
struct Subscription<'a, B: Bucket> {
    job: &'a Job<B>,
    id: u64,
}

impl<B: Bucket> Drop for Subscription<'_, B> {
    fn drop(&mut self) {
        lock(&self.job.inner)
            .subscribers
            .retain(|sub| sub.id != self.id);
    }
}

/// Releases the fetch task's claims on the job when the task ends, however it ends.
///
/// A task that is dropped without finishing fails the job with [`DownloadError::Aborted`].
struct RunGuard<B: Bucket> {
    job: Arc<Job<B>>,
    released: bool,
}

impl<B: Bucket> RunGuard<B> {
    /// Unpin the local file, deleting it if the cache no longer accounts for it.
    async fn release(mut self) {
        let job = Arc::clone(&self.job);
        self.released = true;
        if job
            .file_info
            .finish_downloading(&job.key, job.object.generation)
        {
            job.file_info
                .remove_untracked(&job.key, job.object.generation)
                .await;
        }
    }
}

impl<B: Bucket> Drop for RunGuard<B> {
    fn drop(&mut self) {
        let job = &self.job;
        job.fail(DownloadError::Aborted);
        if !self.released {
            job.file_info
                .finish_downloading(&job.key, job.object.generation);
        }
        job.stopped.send_replace(true);
    }
}
