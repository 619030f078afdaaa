#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bucketfs::bucket::{Bucket, BucketError, ObjectListing, ObjectMeta};
use bucketfs::cache::fcache::CacheDir;
use bucketfs::cache::file_info::FileInfoStore;
use bucketfs::cache::traits::Weighted;
use bucketfs::clock::Clock;
use bucketfs::download::{Job, JobManager, JobStatus};
use bucketfs::fs::{DirEntry, ListingService};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// A cache value whose weight is given explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub weight: u64,
    pub tag: u32,
}

impl Item {
    pub fn new(weight: u64) -> Self {
        Self { weight, tag: 0 }
    }

    pub fn tagged(weight: u64, tag: u32) -> Self {
        Self { weight, tag }
    }
}

impl Weighted for Item {
    fn weight(&self) -> u64 {
        self.weight
    }
}

/// Deterministic object contents.
pub fn data(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

struct MockObject {
    generation: i64,
    contents: Bytes,
}

/// An in-memory bucket with knobs for failure injection.
pub struct MockBucket {
    name: String,
    objects: Mutex<BTreeMap<String, MockObject>>,
    next_generation: AtomicI64,
    /// Reads whose range starts at or after this offset fail.
    fail_from: Mutex<Option<u64>>,
    /// Reads return one byte less than asked for.
    short_reads: AtomicBool,
    /// Every `new_reader` call takes one permit.
    gate: Arc<Semaphore>,
    reads: AtomicUsize,
}

impl MockBucket {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Semaphore::MAX_PERMITS))
    }

    /// A bucket whose reads block until [`release`](Self::release) hands out permits.
    pub fn gated(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, 0))
    }

    fn build(name: &str, permits: usize) -> Self {
        Self {
            name: name.to_owned(),
            objects: Mutex::new(BTreeMap::new()),
            next_generation: AtomicI64::new(1),
            fail_from: Mutex::new(None),
            short_reads: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(permits)),
            reads: AtomicUsize::new(0),
        }
    }

    /// Create or overwrite an object; every call yields a new generation.
    pub fn put(&self, name: &str, contents: Bytes) -> ObjectMeta {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let meta = ObjectMeta {
            name: name.to_owned(),
            generation,
            size: contents.len() as u64,
        };
        self.objects.lock().unwrap().insert(
            name.to_owned(),
            MockObject {
                generation,
                contents,
            },
        );
        meta
    }

    pub fn remove(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }

    /// Allow `n` more reads through a gated bucket.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Let every remaining read through.
    pub fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn fail_reads_from(&self, offset: u64) {
        *self.fail_from.lock().unwrap() = Some(offset);
    }

    pub fn clear_failures(&self) {
        *self.fail_from.lock().unwrap() = None;
        self.short_reads.store(false, Ordering::SeqCst);
    }

    pub fn set_short_reads(&self, short: bool) {
        self.short_reads.store(short, Ordering::SeqCst);
    }

    /// Number of `new_reader` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn meta_of(&self, name: &str) -> Option<ObjectMeta> {
        self.objects.lock().unwrap().get(name).map(|o| ObjectMeta {
            name: name.to_owned(),
            generation: o.generation,
            size: o.contents.len() as u64,
        })
    }
}

impl Bucket for MockBucket {
    type Reader = Cursor<Bytes>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn new_reader(
        &self,
        name: &str,
        generation: i64,
        range: Range<u64>,
    ) -> Result<Self::Reader, BucketError> {
        self.gate.acquire().await.unwrap().forget();
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_from
            .lock()
            .unwrap()
            .is_some_and(|from| range.start >= from)
        {
            return Err(BucketError::Transport(std::io::Error::other(
                "injected read failure",
            )));
        }

        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(name)
            .filter(|o| o.generation == generation)
            .ok_or_else(|| BucketError::NotFound(name.to_owned()))?;
        let start = usize::try_from(range.start).unwrap();
        let mut end = usize::try_from(range.end).unwrap().min(object.contents.len());
        if self.short_reads.load(Ordering::SeqCst) && end > start {
            end -= 1;
        }
        Ok(Cursor::new(object.contents.slice(start..end)))
    }

    async fn stat_object(&self, name: &str) -> Result<ObjectMeta, BucketError> {
        if let Some(meta) = self.meta_of(name) {
            return Ok(meta);
        }
        Err(BucketError::NotFound(name.to_owned()))
    }

    async fn list_objects(&self, prefix: &str, delimited: bool) -> Result<ObjectListing, BucketError> {
        let objects = self.objects.lock().unwrap();
        let mut listing = ObjectListing::default();
        for (name, object) in objects.range(prefix.to_owned()..) {
            let Some(rest) = name.strip_prefix(prefix) else {
                break;
            };
            if delimited && let Some(idx) = rest.find('/') {
                let sub = format!("{prefix}{}", &rest[..=idx]);
                if listing.prefixes.last() != Some(&sub) {
                    listing.prefixes.push(sub);
                }
                continue;
            }
            listing.objects.push(ObjectMeta {
                name: name.clone(),
                generation: object.generation,
                size: object.contents.len() as u64,
            });
        }
        Ok(listing)
    }

    async fn create_object(&self, name: &str, contents: Bytes) -> Result<ObjectMeta, BucketError> {
        Ok(self.put(name, contents))
    }

    async fn delete_object(&self, name: &str) -> Result<(), BucketError> {
        match self.objects.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(BucketError::NotFound(name.to_owned())),
        }
    }
}

/// A temporary cache directory with a store, a bucket and a job manager over them.
pub struct Fixture {
    pub tmp: TempDir,
    pub bucket: Arc<MockBucket>,
    pub store: Arc<FileInfoStore>,
    pub jobs: Arc<JobManager<MockBucket>>,
}

impl Fixture {
    pub async fn new(bucket: Arc<MockBucket>, max_weight: u64, chunk_size: u64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CacheDir::open(&tmp.path().join("cache")).await.unwrap();
        let store = Arc::new(FileInfoStore::new(max_weight, dir));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&bucket),
            Arc::clone(&store),
            chunk_size,
        ));
        Self {
            tmp,
            bucket,
            store,
            jobs,
        }
    }

    pub fn job(&self, object: &ObjectMeta, chunk_size: u64) -> Arc<Job<MockBucket>> {
        Job::new(
            object.clone(),
            Arc::clone(&self.bucket),
            Arc::clone(&self.store),
            chunk_size,
        )
        .unwrap()
    }
}

/// Poll until the job reaches a terminal state, or panic after a timeout.
pub async fn wait_terminal(job: &Job<MockBucket>) -> JobStatus {
    for _ in 0..400 {
        let status = job.status();
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job did not finish within 2 seconds: {:?}", job.status());
}

/// Poll until `cond` holds, or panic after a timeout.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} did not happen within 2 seconds");
}

/// Behaves like the kernel's directory cache in front of a [`ListingService`].
pub struct SimulatedKernel<'a, B: Bucket, C: Clock> {
    service: &'a ListingService<B, C>,
    cached: HashMap<String, Vec<DirEntry>>,
    pub listings_served: usize,
}

impl<'a, B: Bucket, C: Clock> SimulatedKernel<'a, B, C> {
    pub fn new(service: &'a ListingService<B, C>) -> Self {
        Self {
            service,
            cached: HashMap::new(),
            listings_served: 0,
        }
    }

    /// `opendir` + `readdir`, answered from the kernel cache when the service allows it.
    pub async fn list(&mut self, dir: &str) -> Vec<String> {
        let reply = self.service.open_dir(dir);
        if reply.keep_cache
            && let Some(entries) = self.cached.get(dir)
        {
            return entries.iter().map(|e| e.name.clone()).collect();
        }

        self.cached.remove(dir);
        let entries = self.service.read_dir(dir).await.unwrap();
        self.listings_served += 1;
        let names = entries.iter().map(|e| e.name.clone()).collect();
        if reply.cache_dir {
            self.cached.insert(dir.to_owned(), entries);
        }
        names
    }
}
