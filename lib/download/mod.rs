//! Background downloads feeding the file cache.

pub mod job;
pub mod manager;

pub use job::{DownloadError, Job, JobState, JobStatus};
pub use manager::JobManager;
