//! One invocation of the CLI: open the cache, run a command, persist the cache.

use std::io::Write as _;
use std::sync::Arc;

use bucketfs::bucket::local::LocalBucket;
use bucketfs::bucket::{Bucket as _, BucketError};
use bucketfs::cache::fcache::{CacheDir, InvalidRootPathError};
use bucketfs::cache::file_info::{FileInfoError, FileInfoKey, FileInfoStore};
use bucketfs::cache::reader::{CachedObjectReader, ReadError};
use bucketfs::clock::SystemClock;
use bucketfs::download::{DownloadError, JobManager, JobState};
use bucketfs::fs::{EntryKind, ListingService};
use thiserror::Error;
use tokio::select;
use tracing::{debug, info, warn};

use crate::app_config::Config;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cache directory unusable: {0}")]
    CacheDir(#[from] InvalidRootPathError),

    #[error("File info cache error: {0}")]
    FileInfo(#[from] FileInfoError),

    #[error("Bucket error: {0}")]
    Bucket(#[from] BucketError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Download of {0:?} did not complete: {1}")]
    Incomplete(String, JobState),

    #[error("Interrupted.")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the user asked for.
pub enum Action {
    Fetch { object: String },
    Cat { object: String, offset: u64, len: Option<u64> },
    Ls { dir: String },
    Status,
}

struct Session {
    bucket: Arc<LocalBucket>,
    file_info: Arc<FileInfoStore>,
    jobs: Arc<JobManager<LocalBucket>>,
    reader: CachedObjectReader<LocalBucket>,
    listing: ListingService<LocalBucket, SystemClock>,
}

impl Session {
    async fn open(config: &Config) -> Result<Self, SessionError> {
        let bucket = Arc::new(LocalBucket::new(
            config.bucket.name.clone(),
            config.bucket.root.clone(),
        ));

        let dir = CacheDir::open(&config.file_cache.path).await?;
        let max_weight = config.file_cache.max_size.as_u64();
        let file_info = if config.file_cache.restore_on_start {
            FileInfoStore::restore(max_weight, dir).await?
        } else {
            dir.clear().await?;
            FileInfoStore::new(max_weight, dir)
        };
        let file_info = Arc::new(file_info);

        let jobs = Arc::new(JobManager::new(
            Arc::clone(&bucket),
            Arc::clone(&file_info),
            config.file_cache.sequential_read_size.as_u64(),
        ));
        let reader = CachedObjectReader::new(Arc::clone(&jobs));
        let listing = ListingService::new(
            Arc::clone(&bucket),
            SystemClock,
            config.list_cache.kernel_list_cache_ttl,
            config.list_cache.parallel_dirops,
        );

        Ok(Self {
            bucket,
            file_info,
            jobs,
            reader,
            listing,
        })
    }

    async fn fetch(&self, object: &str) -> Result<(), SessionError> {
        let meta = self.bucket.stat_object(object).await?;
        let job = self.jobs.get_or_create(&meta).await?;
        info!(object, size = meta.size, "Fetching object into the cache.");

        let status = job.download(meta.size, true).await;
        match status.state {
            JobState::Completed => {
                info!(object, bytes = status.offset, "Object cached.");
                Ok(())
            }
            state => Err(SessionError::Incomplete(object.to_owned(), state)),
        }
    }

    async fn cat(&self, object: &str, offset: u64, len: Option<u64>) -> Result<(), SessionError> {
        let meta = self.bucket.stat_object(object).await?;
        let len = len.unwrap_or_else(|| meta.size.saturating_sub(offset));
        let bytes = self.reader.read(&meta, offset, len).await?;

        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&bytes)?;
        stdout.flush()?;
        Ok(())
    }

    async fn ls(&self, dir: &str) -> Result<(), SessionError> {
        let entries = self.listing.read_dir(dir).await?;
        let mut stdout = std::io::stdout().lock();
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => writeln!(stdout, "{:>12}  {}/", "-", entry.name)?,
                EntryKind::File => writeln!(stdout, "{:>12}  {}", entry.size, entry.name)?,
            }
        }
        Ok(())
    }

    fn status(&self) -> Result<(), SessionError> {
        let cache = self.file_info.cache();
        let mut stdout = std::io::stdout().lock();
        writeln!(
            stdout,
            "cache: {} ({} of {} bytes in {} entries)",
            self.file_info.cache_dir().root().display(),
            cache.occupied_weight(),
            cache.max_weight(),
            cache.len()
        )?;
        for encoded in cache.keys() {
            let Ok(key) = FileInfoKey::decode(&encoded) else {
                warn!(key = encoded, "Skipping undecodable cache key.");
                continue;
            };
            if let Some(info) = self.file_info.peek(&key) {
                writeln!(
                    stdout,
                    "{:>12}/{:<12} gen {:<20} {}",
                    info.offset, info.file_size, info.object_generation, key
                )?;
            }
        }
        Ok(())
    }

    async fn run(&self, action: Action) -> Result<(), SessionError> {
        match action {
            Action::Fetch { object } => self.fetch(&object).await,
            Action::Cat { object, offset, len } => self.cat(&object, offset, len).await,
            Action::Ls { dir } => self.ls(&dir).await,
            Action::Status => self.status(),
        }
    }

    async fn close(&self) {
        self.jobs.cancel_all().await;
        if let Err(error) = self.file_info.persist().await {
            warn!(%error, "Failed to persist the file info cache.");
        }
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
    }
    Ok(())
}

/// Run `action` against the configured bucket and cache.
pub async fn run(config: Config, action: Action) -> Result<(), SessionError> {
    let session = Session::open(&config).await?;

    let result = select! {
        result = session.run(action) => result,
        signal = wait_for_exit() => signal.map_err(SessionError::from).and(Err(SessionError::Interrupted)),
    };

    session.close().await;
    result
}

pub fn spawn(config: Config, action: Action) -> Result<(), SessionError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, action))
}
