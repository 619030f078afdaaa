#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bucketfs::bucket::BucketError;
use bucketfs::cache::file_info::{FileInfo, FileInfoKey};
use bucketfs::download::{DownloadError, JobState};
use bytes::Bytes;
use common::{Fixture, MockBucket, data, eventually, wait_terminal};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_without_waiting_starts_the_job() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let job = fx.job(&object, 10);

    assert_eq!(job.status().state, JobState::NotStarted);
    let status = job.download(100, false).await;
    assert!(!matches!(status.state, JobState::NotStarted));

    let status = wait_terminal(&job).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.offset, 100);
    assert_eq!(tokio::fs::read(job.local_path()).await.unwrap(), data(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_resolves_once_its_offset_is_reached() {
    let bucket = MockBucket::gated("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&object, 10);

    let waiter = {
        let job = Arc::clone(&job);
        tokio::spawn(async move { job.download(25, true).await })
    };

    eventually("waiter registers", || job.subscriber_count() == 1).await;
    bucket.release(1);
    eventually("first chunk lands", || job.status().offset == 10).await;
    assert!(!waiter.is_finished());
    assert_eq!(job.subscriber_count(), 1);

    bucket.release(2);
    let status = waiter.await.unwrap();
    assert_eq!(status.state, JobState::Downloading);
    assert_eq!(status.offset, 30);
    assert_eq!(job.subscriber_count(), 0);

    bucket.open_gate();
    assert_eq!(wait_terminal(&job).await.state, JobState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn already_satisfied_request_returns_immediately() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(40));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&object, 10);

    job.download(40, true).await;
    let reads = bucket.reads();

    let status = job.download(20, true).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.offset, 40);
    assert_eq!(bucket.reads(), reads, "no new fetch for a completed job");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_past_the_end_is_clamped() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(bucket, 1_000, 30).await;
    let job = fx.job(&object, 30);

    let status = job.download(10_000, true).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.offset, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_releases_every_waiter_with_the_same_error() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    bucket.fail_reads_from(30);
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let job = fx.job(&object, 10);

    let (a, b) = tokio::join!(job.download(50, true), job.download(100, true));
    let (ea, eb) = (a.error().unwrap(), b.error().unwrap());
    assert!(Arc::ptr_eq(ea, eb));
    assert!(matches!(
        ea.as_ref(),
        DownloadError::Remote(BucketError::Transport(_))
    ));
    assert_eq!(job.status().offset, 30);
    assert_eq!(job.subscriber_count(), 0);

    // Terminal: later calls see the same failure without refetching.
    assert_eq!(job.download(100, true).await, job.status());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_releases_waiters_and_is_idempotent() {
    let bucket = MockBucket::gated("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&object, 10);

    let waiter = {
        let job = Arc::clone(&job);
        tokio::spawn(async move { job.download(100, true).await })
    };
    eventually("waiter registers", || job.subscriber_count() == 1).await;

    let first = job.cancel();
    assert_eq!(first.state, JobState::Cancelled);
    assert_eq!(waiter.await.unwrap().state, JobState::Cancelled);

    let second = job.cancel();
    assert_eq!(first, second);
    assert_eq!(job.download(50, true).await.state, JobState::Cancelled);

    bucket.open_gate();
    job.wait_stopped().await;
    assert_eq!(job.status(), first, "late chunks must not revive the job");
    assert!(!fx.store.is_downloading(job.key(), object.generation));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_start_never_fetches() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&object, 10);

    assert_eq!(job.cancel().state, JobState::Cancelled);
    let status = job.download(100, true).await;
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.offset, 0);
    job.wait_stopped().await;
    assert_eq!(bucket.reads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_timeout_withdraws_the_subscription() {
    let bucket = MockBucket::gated("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&object, 10);

    let result = tokio::time::timeout(Duration::from_millis(50), job.download(50, true)).await;
    assert!(result.is_err(), "the download is gated and cannot finish");
    assert_eq!(job.subscriber_count(), 0);
    assert_eq!(job.status().state, JobState::Downloading);

    bucket.open_gate();
    assert_eq!(wait_terminal(&job).await.state, JobState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_generation_fails_the_job() {
    let bucket = MockBucket::new("bkt");
    let stale = bucket.put("obj", data(100));
    bucket.put("obj", data(120));
    let fx = Fixture::new(Arc::clone(&bucket), 1_000, 10).await;
    let job = fx.job(&stale, 10);

    let status = job.download(100, true).await;
    let error = status.error().unwrap();
    assert!(
        matches!(
            error.as_ref(),
            DownloadError::GenerationMismatch { expected, .. } if *expected == stale.generation
        ),
        "{error}"
    );
    assert_eq!(bucket.reads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_object_fails_with_not_found() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(10));
    bucket.remove("obj");
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let job = fx.job(&object, 10);

    let status = job.download(10, true).await;
    assert!(matches!(
        status.error().unwrap().as_ref(),
        DownloadError::Remote(BucketError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_read_is_an_error() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    bucket.set_short_reads(true);
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let job = fx.job(&object, 10);

    let status = job.download(100, true).await;
    assert!(matches!(
        status.error().unwrap().as_ref(),
        DownloadError::ShortRead {
            offset: 0,
            expected: 10,
            actual: 9
        }
    ));
    assert_eq!(status.offset, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_object_completes() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("empty", Bytes::new());
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let job = fx.job(&object, 10);

    job.download(0, false).await;
    let status = wait_terminal(&job).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(tokio::fs::metadata(job.local_path()).await.unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_recorded_without_promotion() {
    let bucket = MockBucket::new("bkt");
    let object = bucket.put("obj", data(100));
    let fx = Fixture::new(bucket, 1_000, 10).await;
    let consumer = FileInfo {
        key: FileInfoKey::new("bkt", "other"),
        object_generation: 1,
        file_size: 10,
        offset: 10,
    };
    fx.store.insert(consumer.clone()).unwrap();

    let job = fx.job(&object, 10);
    job.download(100, true).await;

    let recorded = fx.store.peek(job.key()).unwrap();
    assert_eq!(recorded.offset, 100);
    assert_eq!(recorded.object_generation, object.generation);
    assert_eq!(
        fx.store.cache().keys(),
        [consumer.key.encode(), job.key().encode()],
        "background progress lands behind consumer entries"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_during_download_keeps_the_file() {
    let bucket = MockBucket::gated("bkt");
    let object = bucket.put("obj", data(60));
    let fx = Fixture::new(Arc::clone(&bucket), 100, 20).await;
    let job = fx.job(&object, 20);

    job.download(0, false).await;
    bucket.release(1);
    eventually("first chunk lands", || job.status().offset == 20).await;

    // A consumer insert pushes the download's record out of the cache.
    let evicted = fx
        .store
        .insert(FileInfo {
            key: FileInfoKey::new("bkt", "hog"),
            object_generation: 1,
            file_size: 100,
            offset: 100,
        })
        .unwrap();
    assert_eq!(evicted.len(), 1);
    fx.store.discard(evicted).await;
    assert!(job.local_path().exists(), "an active download owns its file");

    bucket.open_gate();
    let status = wait_terminal(&job).await;
    assert_eq!(status.state, JobState::Completed, "eviction never cancels a job");

    // The hog keeps the cache full, so the finished download has no record and its file goes.
    job.wait_stopped().await;
    assert!(fx.store.peek(job.key()).is_none());
    assert!(!job.local_path().exists());
}

#[test]
fn task_dropped_before_running_releases_the_job() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (fx, object, job) = runtime.block_on(async {
        let bucket = MockBucket::new("bkt");
        let object = bucket.put("obj", data(100));
        let fx = Fixture::new(bucket, 1_000, 10).await;
        let job = fx.job(&object, 10);
        // Spawns the fetch task, which this single-threaded runtime has not polled yet.
        job.download(0, false).await;
        (fx, object, job)
    });
    drop(runtime);

    assert!(matches!(
        job.status().error().unwrap().as_ref(),
        DownloadError::Aborted
    ));
    assert!(!fx.store.is_downloading(job.key(), object.generation));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        tokio::time::timeout(Duration::from_secs(2), job.wait_stopped())
            .await
            .unwrap();
    });
}
