//! One download job per cached object.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::job::{DownloadError, Job, JobState};
use crate::bucket::{Bucket, ObjectMeta};
use crate::cache::file_info::{FileInfoKey, FileInfoStore};

/// Hands out the [`Job`] for an object, replacing jobs that can no longer serve it.
pub struct JobManager<B: Bucket> {
    bucket: Arc<B>,
    file_info: Arc<FileInfoStore>,
    chunk_size: u64,
    jobs: scc::HashMap<FileInfoKey, Arc<Job<B>>>,
}

impl<B: Bucket> JobManager<B> {
    /// A manager creating jobs that fetch `chunk_size` bytes per remote read.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(bucket: Arc<B>, file_info: Arc<FileInfoStore>, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            bucket,
            file_info,
            chunk_size,
            jobs: scc::HashMap::new(),
        }
    }

    /// The bucket every job reads from.
    #[must_use]
    pub fn bucket(&self) -> &Arc<B> {
        &self.bucket
    }

    /// The store jobs record their progress in.
    #[must_use]
    pub fn file_info(&self) -> &Arc<FileInfoStore> {
        &self.file_info
    }

    /// The job currently registered for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &FileInfoKey) -> Option<Arc<Job<B>>> {
        self.jobs.read_sync(key, |_, job| Arc::clone(job))
    }

    /// The job for `object`, creating it if needed.
    ///
    /// An existing job is reused unless it is for another generation, failed or was cancelled.
    /// Such a job is cancelled and waited for before its replacement is registered, so only one
    /// task ever writes a given local file.
    ///
    /// Objects larger than the whole file cache are refused with [`DownloadError::TooLarge`].
    #[instrument(name = "JobManager::get_or_create", skip(self), fields(object = %object.name))]
    pub async fn get_or_create(&self, object: &ObjectMeta) -> Result<Arc<Job<B>>, DownloadError> {
        let capacity = self.file_info.max_weight();
        if object.size > capacity {
            return Err(DownloadError::TooLarge {
                name: object.name.clone(),
                size: object.size,
                capacity,
            });
        }

        let key = FileInfoKey::new(self.bucket.name(), object.name.clone());
        loop {
            if let Some(existing) = self.get(&key) {
                let reusable = existing.object().generation == object.generation
                    && !matches!(
                        existing.status().state,
                        JobState::Failed(_) | JobState::Cancelled
                    );
                if reusable {
                    return Ok(existing);
                }

                debug!(
                    old_generation = existing.object().generation,
                    state = existing.status().state.name(),
                    "replacing download job"
                );
                existing.cancel();
                existing.wait_stopped().await;
                self.jobs
                    .remove_if_async(&key, |job| Arc::ptr_eq(job, &existing))
                    .await;
            }

            match self.jobs.entry_async(key.clone()).await {
                scc::hash_map::Entry::Vacant(vac) => {
                    let job = Job::new(
                        object.clone(),
                        Arc::clone(&self.bucket),
                        Arc::clone(&self.file_info),
                        self.chunk_size,
                    )?;
                    vac.insert_entry(Arc::clone(&job));
                    return Ok(job);
                }
                // Someone registered a job meanwhile; judge it on the next pass.
                scc::hash_map::Entry::Occupied(_) => {}
            }
        }
    }

    /// Cancel and forget the job for `key`, waiting until its task has stopped.
    pub async fn remove(&self, key: &FileInfoKey) -> Option<Arc<Job<B>>> {
        let (_, job) = self.jobs.remove_async(key).await?;
        job.cancel();
        job.wait_stopped().await;
        Some(job)
    }

    /// Cancel every job and wait for their tasks to stop.
    pub async fn cancel_all(&self) {
        let mut jobs = Vec::new();
        self.jobs
            .iter_async(|key, job| {
                jobs.push((key.clone(), Arc::clone(job)));
                true
            })
            .await;

        for (key, job) in jobs {
            self.jobs
                .remove_if_async(&key, |registered| Arc::ptr_eq(registered, &job))
                .await;
            job.cancel();
            job.wait_stopped().await;
        }
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
