//! A [`Bucket`] backed by a directory on the local filesystem.
//!
//! Object names map to relative paths under the root. The generation of an object is its
//! modification time in nanoseconds, so rewriting a file produces a new generation.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, instrument};

use super::{Bucket, BucketError, ObjectListing, ObjectMeta};

/// A bucket whose objects are files under `root`.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    root: PathBuf,
}

impl LocalBucket {
    /// Serve the files under `root` as bucket `name`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// The directory backing this bucket.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, BucketError> {
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(BucketError::InvalidName(name.to_owned()));
        }

        let relative = Path::new(trimmed);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(BucketError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    async fn meta(&self, name: &str, path: &Path) -> Result<ObjectMeta, BucketError> {
        let md = tokio::fs::metadata(path)
            .await
            .map_err(|e| not_found_or_transport(name, e))?;

        // `dir/` names a directory marker, `dir` names a file.
        let is_marker = name.ends_with('/');
        if md.is_dir() != is_marker {
            return Err(BucketError::NotFound(name.to_owned()));
        }

        let mtime = md.modified()?;
        let nanos = mtime
            .duration_since(UNIX_EPOCH)
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .as_nanos();
        Ok(ObjectMeta {
            name: name.to_owned(),
            generation: i64::try_from(nanos).unwrap_or(i64::MAX),
            size: if is_marker { 0 } else { md.len() },
        })
    }

    async fn collect(
        &self,
        dir_name: &str,
        name_prefix: &str,
        delimited: bool,
        listing: &mut ObjectListing,
    ) -> Result<(), BucketError> {
        let mut pending = vec![dir_name.to_owned()];

        while let Some(dir) = pending.pop() {
            let dir_path = if dir.is_empty() {
                self.root.clone()
            } else {
                self.object_path(&dir)?
            };
            let mut entries = match tokio::fs::read_dir(&dir_path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let Ok(file_name) = entry.file_name().into_string() else {
                    debug!(path = ?entry.path(), "skipping non-UTF-8 file name");
                    continue;
                };
                // Only the top level is filtered by the partial name.
                if dir == dir_name && !file_name.starts_with(name_prefix) {
                    continue;
                }

                let full = format!("{dir}{file_name}");
                if entry.file_type().await?.is_dir() {
                    let sub = format!("{full}/");
                    if delimited {
                        listing.prefixes.push(sub);
                    } else {
                        listing
                            .objects
                            .push(self.meta(&sub, &entry.path()).await?);
                        pending.push(sub);
                    }
                } else {
                    listing.objects.push(self.meta(&full, &entry.path()).await?);
                }
            }
        }
        Ok(())
    }
}

fn not_found_or_transport(name: &str, e: std::io::Error) -> BucketError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BucketError::NotFound(name.to_owned())
    } else {
        BucketError::Transport(e)
    }
}

impl Bucket for LocalBucket {
    type Reader = tokio::io::Take<tokio::fs::File>;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "LocalBucket::new_reader", skip(self))]
    async fn new_reader(
        &self,
        name: &str,
        generation: i64,
        range: Range<u64>,
    ) -> Result<Self::Reader, BucketError> {
        let path = self.object_path(name)?;
        let meta = self.meta(name, &path).await?;
        if meta.generation != generation {
            return Err(BucketError::NotFound(format!("{name}#{generation}")));
        }

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_transport(name, e))?;
        file.seek(SeekFrom::Start(range.start)).await?;
        Ok(file.take(range.end.saturating_sub(range.start)))
    }

    async fn stat_object(&self, name: &str) -> Result<ObjectMeta, BucketError> {
        let path = self.object_path(name)?;
        self.meta(name, &path).await
    }

    #[instrument(name = "LocalBucket::list_objects", skip(self))]
    async fn list_objects(
        &self,
        prefix: &str,
        delimited: bool,
    ) -> Result<ObjectListing, BucketError> {
        let (dir_name, name_prefix) = match prefix.rfind('/') {
            Some(idx) => prefix.split_at(idx + 1),
            None => ("", prefix),
        };

        let mut listing = ObjectListing::default();
        self.collect(dir_name, name_prefix, delimited, &mut listing)
            .await?;
        listing.objects.sort_by(|a, b| a.name.cmp(&b.name));
        listing.prefixes.sort();
        Ok(listing)
    }

    async fn create_object(&self, name: &str, contents: Bytes) -> Result<ObjectMeta, BucketError> {
        let path = self.object_path(name)?;
        if name.ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
            return self.meta(name, &path).await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        self.meta(name, &path).await
    }

    async fn delete_object(&self, name: &str) -> Result<(), BucketError> {
        let path = self.object_path(name)?;
        let result = if name.ends_with('/') {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| not_found_or_transport(name, e))
    }
}
