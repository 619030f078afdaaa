//! Directory views over a flat bucket, and the kernel list-cache policy for them.
//!
//! Directories are `/`-separated name prefixes. A directory exists if it has an explicit marker
//! object (`dir/`) or any object below it.
//!
//! The kernel may keep the result of a listing and skip the next one. [`ListingService::open_dir`]
//! decides, per directory, whether the listing the kernel holds is still within the configured
//! [`KernelListCacheTtl`]. Mutations made through this service drop that trust immediately.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, trace};

use crate::bucket::{Bucket, BucketError, ObjectMeta};
use crate::clock::{Clock, SystemClock};
use crate::fs::ttl::KernelListCacheTtl;

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    /// A regular object.
    File,
    /// A name prefix, with or without a marker object.
    Directory,
}

/// One child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name relative to the parent, without a trailing `/`.
    pub name: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Object size; zero for directories.
    pub size: u64,
    /// Object generation; `None` for implicit directories.
    pub generation: Option<i64>,
}

/// Reply to an open-directory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDirReply {
    /// The kernel may cache the listing it is about to receive.
    pub cache_dir: bool,
    /// The listing the kernel already holds is still valid.
    pub keep_cache: bool,
}

/// Directory operations over a bucket, plus the per-directory kernel list-cache trust.
pub struct ListingService<B: Bucket, C: Clock = SystemClock> {
    bucket: Arc<B>,
    clock: C,
    ttl: KernelListCacheTtl,
    dirops: Semaphore,
    /// When each directory was last listed for the kernel.
    listed_at: scc::HashMap<String, Instant>,
    /// How often each directory has been invalidated.
    invalidations: scc::HashMap<String, u64>,
}

impl<B: Bucket, C: Clock> ListingService<B, C> {
    /// Without `parallel_dirops`, directory operations run one at a time.
    pub fn new(bucket: Arc<B>, clock: C, ttl: KernelListCacheTtl, parallel_dirops: bool) -> Self {
        let permits = if parallel_dirops {
            Semaphore::MAX_PERMITS
        } else {
            1
        };
        Self {
            bucket,
            clock,
            ttl,
            dirops: Semaphore::new(permits),
            listed_at: scc::HashMap::new(),
            invalidations: scc::HashMap::new(),
        }
    }

    /// The configured kernel list-cache TTL.
    #[must_use]
    pub fn ttl(&self) -> KernelListCacheTtl {
        self.ttl
    }

    /// The bucket being browsed.
    #[must_use]
    pub fn bucket(&self) -> &Arc<B> {
        &self.bucket
    }

    /// Decide whether the kernel may keep its cached listing of `dir`.
    #[instrument(name = "ListingService::open_dir", skip(self))]
    pub fn open_dir(&self, dir: &str) -> OpenDirReply {
        let prefix = dir_prefix(dir);
        let now = self.clock.now();
        let keep_cache = self
            .listed_at
            .read_sync(&prefix, |_, listed_at| self.ttl.trusts(*listed_at, now))
            .unwrap_or(false);
        trace!(keep_cache, "open_dir");
        OpenDirReply {
            cache_dir: self.ttl.is_enabled(),
            keep_cache,
        }
    }

    /// List the children of `dir`, sorted by name.
    #[instrument(name = "ListingService::read_dir", skip(self))]
    pub async fn read_dir(&self, dir: &str) -> Result<Vec<DirEntry>, BucketError> {
        let _permit = self.dirop().await;
        let prefix = dir_prefix(dir);
        let started = self.clock.now();
        let epoch = self.invalidation_epoch(&prefix);
        let listing = self.bucket.list_objects(&prefix, true).await?;

        let mut entries: Vec<DirEntry> = listing
            .objects
            .into_iter()
            .filter_map(|object| {
                let name = object.name.strip_prefix(&prefix)?;
                // The directory's own marker.
                if name.is_empty() {
                    return None;
                }
                Some(DirEntry {
                    name: name.to_owned(),
                    kind: EntryKind::File,
                    size: object.size,
                    generation: Some(object.generation),
                })
            })
            .collect();
        entries.extend(listing.prefixes.iter().filter_map(|sub| {
            let name = sub.strip_prefix(&prefix)?.trim_end_matches('/');
            (!name.is_empty()).then(|| DirEntry {
                name: name.to_owned(),
                kind: EntryKind::Directory,
                size: 0,
                generation: None,
            })
        }));
        entries.sort_by(|a, b| match a.name.cmp(&b.name) {
            Ordering::Equal => a.kind.cmp(&b.kind),
            other => other,
        });

        if self.ttl.is_enabled() {
            self.listed_at.upsert_sync(prefix.clone(), started);
            // A mutation that landed while listing may be missing from `entries`.
            if self.invalidation_epoch(&prefix) != epoch {
                self.listed_at.remove_sync(&prefix);
                debug!("directory changed while listing; not trusting the result");
            }
        }
        debug!(entries = entries.len(), "listed directory");
        Ok(entries)
    }

    /// Resolve `name` inside `dir`. A file shadows a directory of the same name.
    #[instrument(name = "ListingService::lookup", skip(self))]
    pub async fn lookup(&self, dir: &str, name: &str) -> Result<Option<DirEntry>, BucketError> {
        let _permit = self.dirop().await;
        let full = child_name(dir, name)?;
        match self.bucket.stat_object(&full).await {
            Ok(meta) => {
                return Ok(Some(DirEntry {
                    name: name.to_owned(),
                    kind: EntryKind::File,
                    size: meta.size,
                    generation: Some(meta.generation),
                }));
            }
            Err(BucketError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let sub = format!("{full}/");
        let generation = match self.bucket.stat_object(&sub).await {
            Ok(meta) => Some(meta.generation),
            Err(BucketError::NotFound(_)) => {
                let listing = self.bucket.list_objects(&sub, true).await?;
                if listing.objects.is_empty() && listing.prefixes.is_empty() {
                    return Ok(None);
                }
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Some(DirEntry {
            name: name.to_owned(),
            kind: EntryKind::Directory,
            size: 0,
            generation,
        }))
    }

    /// Forget that the kernel holds a valid listing of `dir`.
    pub fn invalidate(&self, dir: &str) {
        let prefix = dir_prefix(dir);
        match self.invalidations.entry_sync(prefix.clone()) {
            scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() += 1,
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(1);
            }
        }
        if self.listed_at.remove_sync(&prefix).is_some() {
            debug!(dir, "invalidated kernel list cache");
        }
    }

    fn invalidation_epoch(&self, prefix: &str) -> u64 {
        self.invalidations
            .read_sync(prefix, |_, epoch| *epoch)
            .unwrap_or(0)
    }

    /// Create `dir/name` with `contents`.
    #[instrument(name = "ListingService::create_file", skip(self, contents))]
    pub async fn create_file(
        &self,
        dir: &str,
        name: &str,
        contents: Bytes,
    ) -> Result<ObjectMeta, BucketError> {
        let _permit = self.dirop().await;
        let full = child_name(dir, name)?;
        let meta = self.bucket.create_object(&full, contents).await?;
        self.invalidate(dir);
        Ok(meta)
    }

    /// Delete `dir/name`.
    #[instrument(name = "ListingService::delete_file", skip(self))]
    pub async fn delete_file(&self, dir: &str, name: &str) -> Result<(), BucketError> {
        let _permit = self.dirop().await;
        let full = child_name(dir, name)?;
        self.bucket.delete_object(&full).await?;
        self.invalidate(dir);
        Ok(())
    }

    /// Create an explicit directory marker for `dir/name/`.
    #[instrument(name = "ListingService::create_dir", skip(self))]
    pub async fn create_dir(&self, dir: &str, name: &str) -> Result<ObjectMeta, BucketError> {
        let _permit = self.dirop().await;
        let full = format!("{}/", child_name(dir, name)?);
        let meta = self.bucket.create_object(&full, Bytes::new()).await?;
        self.invalidate(dir);
        Ok(meta)
    }

    /// Remove the explicit marker of `dir/name/`.
    #[instrument(name = "ListingService::delete_dir", skip(self))]
    pub async fn delete_dir(&self, dir: &str, name: &str) -> Result<(), BucketError> {
        let _permit = self.dirop().await;
        let full = format!("{}/", child_name(dir, name)?);
        self.bucket.delete_object(&full).await?;
        self.invalidate(dir);
        self.invalidate(&full);
        Ok(())
    }

    async fn dirop(&self) -> Option<SemaphorePermit<'_>> {
        // The semaphore is never closed.
        self.dirops.acquire().await.ok()
    }
}

/// `""` and `"/"` are the bucket root; anything else gets exactly one trailing `/`.
fn dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn child_name(dir: &str, name: &str) -> Result<String, BucketError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(BucketError::InvalidName(name.to_owned()));
    }
    Ok(format!("{}{name}", dir_prefix(dir)))
}
