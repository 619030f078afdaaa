//! Bookkeeping for how much of each remote object is present in the local file cache.
//!
//! A [`FileInfoStore`] wraps a [`WeightedLruCache`] of [`FileInfo`] records. The weight of a
//! record is the number of bytes already downloaded, so the cache capacity bounds the bytes held
//! on disk. Whenever records fall out of the cache their local files are deleted. Files a
//! download is still writing are deleted when that download stops.

use std::fmt;
use std::path::PathBuf;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::eviction::lru::{SnapshotError, WeightedLruCache};
use crate::cache::fcache::{CacheDir, InvalidObjectPath};
use crate::cache::traits::Weighted;
use crate::io;

/// Identity of a cached object: the bucket it lives in and its name.
///
/// Encoded as `<len(bucket)>:<bucket><len(object)>:<object>` so that no pair of distinct
/// identities shares an encoding, whatever characters the names contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileInfoKey {
    /// Bucket name.
    pub bucket: String,
    /// Object name within the bucket.
    pub object: String,
}

/// A string that is not an encoded [`FileInfoKey`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed file info key {0:?}")]
pub struct KeyDecodeError(pub String);

impl FileInfoKey {
    /// Build a key from its parts.
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// The collision-free string form used as the cache key.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}:{}{}:{}",
            self.bucket.len(),
            self.bucket,
            self.object.len(),
            self.object
        )
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> Result<Self, KeyDecodeError> {
        fn field(s: &str) -> Option<(&str, &str)> {
            let (len, rest) = s.split_once(':')?;
            if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let len: usize = len.parse().ok()?;
            Some((rest.get(..len)?, rest.get(len..)?))
        }

        let malformed = || KeyDecodeError(encoded.to_owned());
        let (bucket, rest) = field(encoded).ok_or_else(malformed)?;
        let (object, rest) = field(rest).ok_or_else(malformed)?;
        if !rest.is_empty() {
            return Err(malformed());
        }
        Ok(Self::new(bucket, object))
    }
}

impl fmt::Display for FileInfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// Download progress of one object generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// The object this record describes.
    pub key: FileInfoKey,
    /// The generation whose bytes are on disk.
    pub object_generation: i64,
    /// Full size of the remote object.
    pub file_size: u64,
    /// Bytes `[0, offset)` are present in the local file.
    pub offset: u64,
}

impl Weighted for FileInfo {
    fn weight(&self) -> u64 {
        self.offset
    }
}

/// Failures of the file-info store.
#[derive(Debug, Error)]
pub enum FileInfoError {
    /// A record claimed more bytes than the object has.
    #[error("offset {offset} is past the end of the {size}-byte object {key}")]
    OffsetBeyondSize {
        /// The object.
        key: FileInfoKey,
        /// Claimed offset.
        offset: u64,
        /// Object size.
        size: u64,
    },

    /// Progress arrived for a generation the store no longer tracks.
    #[error("file info for {key} now tracks generation {current}, not {generation}")]
    Superseded {
        /// The object.
        key: FileInfoKey,
        /// Generation the progress was for.
        generation: i64,
        /// Generation on record.
        current: i64,
    },

    /// The snapshot could not be encoded.
    #[error("file info snapshot is unusable: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The object has no valid local path.
    #[error(transparent)]
    Path(#[from] InvalidObjectPath),

    /// Reading or writing the snapshot or the objects directory failed.
    #[error("IO error on the file info snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// The file-info cache plus the files it accounts for.
pub struct FileInfoStore {
    cache: WeightedLruCache<FileInfo>,
    dir: CacheDir,
    /// Object generations with a download in flight, and how many.
    active: scc::HashMap<(FileInfoKey, i64), usize>,
}

impl FileInfoStore {
    /// An empty store admitting at most `max_weight` downloaded bytes.
    ///
    /// # Panics
    ///
    /// Panics if `max_weight` is zero.
    #[must_use]
    pub fn new(max_weight: u64, dir: CacheDir) -> Self {
        Self::with_cache(WeightedLruCache::new(max_weight), dir)
    }

    fn with_cache(cache: WeightedLruCache<FileInfo>, dir: CacheDir) -> Self {
        Self {
            cache,
            dir,
            active: scc::HashMap::new(),
        }
    }

    /// Rebuild the store from the snapshot in `dir`, if one can be trusted.
    ///
    /// Entries whose local file is missing or shorter than the recorded offset are dropped. An
    /// unreadable snapshot discards every cached file. If the snapshot was taken with a different
    /// capacity, entries are replayed from least to most recent so the order survives.
    #[instrument(name = "FileInfoStore::restore", skip(dir), fields(root = %dir.root().display()))]
    pub async fn restore(max_weight: u64, dir: CacheDir) -> Result<Self, FileInfoError> {
        let snapshot_path = dir.snapshot_path();
        let bytes = match tokio::fs::read(&snapshot_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no file info snapshot; starting with an empty cache");
                dir.clear().await?;
                return Ok(Self::new(max_weight, dir));
            }
            Err(e) => return Err(e.into()),
        };

        let restored = match WeightedLruCache::<FileInfo>::decode(&bytes) {
            Ok(cache) => cache,
            Err(error) => {
                warn!(%error, "discarding unreadable file info snapshot");
                dir.clear().await?;
                return Ok(Self::new(max_weight, dir));
            }
        };

        let store = if restored.max_weight() == max_weight {
            Self::with_cache(restored, dir)
        } else {
            let store = Self::new(max_weight, dir);
            let mut entries = restored.to_snapshot().entries;
            entries.reverse();
            for (key, info) in entries {
                let evicted = store.cache.insert(key, info);
                store.discard(evicted).await;
            }
            store
        };

        for (key, info) in store.cache.to_snapshot().entries {
            let path = store.dir.object_path(&info.key, info.object_generation);
            let trusted = match &path {
                Ok(path) => io::file_len(path).await.is_some_and(|len| len >= info.offset),
                Err(_) => false,
            };
            if !trusted {
                debug!(key = %info.key, "dropping file info whose local file is missing or short");
                store.cache.erase(&key);
                if let Ok(path) = path {
                    let _ = io::remove_file_if_exists(&path).await;
                }
            }
        }

        store.sweep_untracked().await?;
        info!(
            entries = store.cache.len(),
            bytes = store.cache.occupied_weight(),
            "restored file info cache"
        );
        Ok(store)
    }

    /// Delete every file under the objects directory that no record points at.
    async fn sweep_untracked(&self) -> Result<(), FileInfoError> {
        let tracked: FxHashSet<PathBuf> = self
            .cache
            .to_snapshot()
            .entries
            .iter()
            .filter_map(|(_, info)| self.local_path(info).ok())
            .collect();

        let mut removed = 0usize;
        for path in io::files_under(&self.dir.objects_root()).await? {
            if !tracked.contains(&path) && io::remove_file_if_exists(&path).await? {
                removed += 1;
            }
        }
        io::remove_empty_dirs(&self.dir.objects_root()).await?;
        if removed > 0 {
            info!(removed, "removed cached files left behind by an earlier run");
        }
        Ok(())
    }

    /// Persist the current contents to the snapshot file.
    pub async fn persist(&self) -> Result<(), FileInfoError> {
        let bytes = self.cache.encode()?;
        let path = self.dir.snapshot_path();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(bytes = bytes.len(), "persisted file info snapshot");
        Ok(())
    }

    /// The directory the records' files live in.
    #[must_use]
    pub fn cache_dir(&self) -> &CacheDir {
        &self.dir
    }

    /// The underlying LRU cache.
    #[must_use]
    pub fn cache(&self) -> &WeightedLruCache<FileInfo> {
        &self.cache
    }

    /// Capacity in downloaded bytes.
    #[must_use]
    pub fn max_weight(&self) -> u64 {
        self.cache.max_weight()
    }

    /// The local file for `info`.
    pub fn local_path(&self, info: &FileInfo) -> Result<PathBuf, InvalidObjectPath> {
        self.dir.object_path(&info.key, info.object_generation)
    }

    /// Look up a record on behalf of a reader. Promotes it to most recently used.
    #[must_use]
    pub fn look_up(&self, key: &FileInfoKey) -> Option<FileInfo> {
        self.cache.look_up(&key.encode())
    }

    /// Look up a record without touching recency.
    #[must_use]
    pub fn peek(&self, key: &FileInfoKey) -> Option<FileInfo> {
        self.cache.peek(&key.encode())
    }

    /// Insert or replace a record on behalf of a reader, making it most recently used.
    ///
    /// Returns the records evicted to make room. Their files are not yet deleted; pass them to
    /// [`discard`](Self::discard).
    pub fn insert(&self, info: FileInfo) -> Result<Vec<FileInfo>, FileInfoError> {
        check_offset(&info)?;
        Ok(self.cache.insert(info.key.encode(), info))
    }

    /// Record download progress without changing the record's recency.
    ///
    /// An absent record is added as the least recently used entry. Progress of a generation
    /// other than the recorded one is refused.
    pub fn update_offset(
        &self,
        key: &FileInfoKey,
        object_generation: i64,
        file_size: u64,
        offset: u64,
    ) -> Result<Vec<FileInfo>, FileInfoError> {
        let info = FileInfo {
            key: key.clone(),
            object_generation,
            file_size,
            offset,
        };
        check_offset(&info)?;
        let mut current = object_generation;
        self.cache
            .update_in_place_if(key.encode(), info, |existing| {
                current = existing.object_generation;
                current == object_generation
            })
            .ok_or_else(|| FileInfoError::Superseded {
                key: key.clone(),
                generation: object_generation,
                current,
            })
    }

    /// Remove a record. Its file is left for the caller to [`discard`](Self::discard).
    pub fn erase(&self, key: &FileInfoKey) -> Option<FileInfo> {
        self.cache.erase(&key.encode())
    }

    /// Drop the record for `key` if it describes a generation other than `generation`, deleting
    /// its file.
    pub async fn invalidate_stale(&self, key: &FileInfoKey, generation: i64) -> Option<FileInfo> {
        let encoded = key.encode();
        let stale = self.cache.peek(&encoded)?;
        if stale.object_generation == generation {
            return None;
        }
        let erased = self.cache.erase(&encoded)?;
        debug!(
            %key,
            old = erased.object_generation,
            new = generation,
            "erasing file info of a stale generation"
        );
        self.discard(vec![erased.clone()]).await;
        Some(erased)
    }

    /// Delete the local files of records that left the cache.
    ///
    /// Files still being written by a download are kept; the download owns them until it stops.
    pub async fn discard(&self, evicted: Vec<FileInfo>) {
        for info in evicted {
            if self.is_downloading(&info.key, info.object_generation) {
                debug!(key = %info.key, "evicted file is still downloading; keeping it");
                continue;
            }
            let Ok(path) = self.local_path(&info) else {
                continue;
            };
            match io::remove_file_if_exists(&path).await {
                Ok(_) => debug!(key = %info.key, offset = info.offset, "evicted cached file"),
                Err(error) => {
                    warn!(key = %info.key, %error, "failed to delete evicted cached file");
                }
            }
        }
    }

    /// Note that a download for this generation has started.
    pub fn mark_downloading(&self, key: &FileInfoKey, generation: i64) {
        match self.active.entry_sync((key.clone(), generation)) {
            scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() += 1,
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(1);
            }
        }
    }

    /// Note that a download for this generation has stopped.
    ///
    /// Returns `true` once no download of this generation is left.
    pub fn finish_downloading(&self, key: &FileInfoKey, generation: i64) -> bool {
        let id = (key.clone(), generation);
        self.active.update_sync(&id, |_, count| *count = count.saturating_sub(1));
        self.active.remove_if_sync(&id, |count| *count == 0);
        !self.is_downloading(key, generation)
    }

    /// Delete the local file of `key` at `generation` unless a record or a running download
    /// still accounts for it. Returns `true` if a file was removed.
    ///
    /// Files evicted while their download was running are skipped by
    /// [`discard`](Self::discard); the download calls this once it stops.
    pub async fn remove_untracked(&self, key: &FileInfoKey, generation: i64) -> bool {
        let recorded = self
            .peek(key)
            .is_some_and(|info| info.object_generation == generation);
        if recorded || self.is_downloading(key, generation) {
            return false;
        }
        let Ok(path) = self.dir.object_path(key, generation) else {
            return false;
        };
        match io::remove_file_if_exists(&path).await {
            Ok(removed) => {
                if removed {
                    debug!(%key, generation, "removed cached file no record accounts for");
                }
                removed
            }
            Err(error) => {
                warn!(%key, %error, "failed to remove untracked cached file");
                false
            }
        }
    }

    /// Whether a download for this generation is in flight.
    #[must_use]
    pub fn is_downloading(&self, key: &FileInfoKey, generation: i64) -> bool {
        self.active
            .read_sync(&(key.clone(), generation), |_, _| ())
            .is_some()
    }
}

fn check_offset(info: &FileInfo) -> Result<(), FileInfoError> {
    if info.offset > info.file_size {
        return Err(FileInfoError::OffsetBeyondSize {
            key: info.key.clone(),
            offset: info.offset,
            size: info.file_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_is_length_prefixed() {
        let key = FileInfoKey::new("bkt", "a/b:c");
        assert_eq!(key.encode(), "3:bkt5:a/b:c");
        assert_eq!(FileInfoKey::decode("3:bkt5:a/b:c"), Ok(key));
    }

    #[test]
    fn ambiguous_concatenations_stay_distinct() {
        let a = FileInfoKey::new("ab", "c");
        let b = FileInfoKey::new("a", "bc");
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn decode_rejects_garbage() {
        for bad in ["", "3:bk", "x:abc1:d", "3:bkt5:abc", "3:bkt1:ab", "-1:a1:b", "3:bkt"] {
            assert!(FileInfoKey::decode(bad).is_err(), "{bad:?} decoded");
        }
    }

    #[test]
    fn decode_respects_char_boundaries() {
        let key = FileInfoKey::new("bü", "ö");
        assert_eq!(FileInfoKey::decode(&key.encode()), Ok(key));
        assert!(FileInfoKey::decode("1:ü1:a").is_err());
    }
}
