//! The remote object store as seen by the cache.
//!
//! Only the operations the cache and the listing service need are modelled. Wire protocols,
//! retries and authentication belong to implementations of [`Bucket`].

pub mod local;

use std::future::Future;
use std::ops::Range;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Metadata of one remote object generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Full object name within the bucket.
    pub name: String,
    /// Immutable version stamp. A different generation means different content.
    pub generation: i64,
    /// Size of the object in bytes.
    pub size: u64,
}

/// Errors returned by a [`Bucket`].
#[derive(Debug, Error)]
pub enum BucketError {
    /// No such object, or not at the requested generation.
    #[error("object {0:?} not found")]
    NotFound(String),

    /// The name cannot address an object.
    #[error("invalid object name {0:?}")]
    InvalidName(String),

    /// The request itself failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    /// Objects directly matching the listed prefix.
    pub objects: Vec<ObjectMeta>,
    /// Collapsed sub-prefixes (each ending in `/`) when the listing is delimited.
    pub prefixes: Vec<String>,
}

/// A remote bucket of immutable-per-generation objects.
pub trait Bucket: Send + Sync + 'static {
    /// Byte stream returned by [`new_reader`](Self::new_reader).
    type Reader: AsyncRead + Send + Unpin + 'static;

    /// The bucket name.
    fn name(&self) -> &str;

    /// Open a reader over `range` of generation `generation` of the object.
    ///
    /// Fails with [`BucketError::NotFound`] if that generation no longer exists.
    fn new_reader(
        &self,
        name: &str,
        generation: i64,
        range: Range<u64>,
    ) -> impl Future<Output = Result<Self::Reader, BucketError>> + Send;

    /// Fetch the current metadata of an object.
    fn stat_object(&self, name: &str)
    -> impl Future<Output = Result<ObjectMeta, BucketError>> + Send;

    /// List objects whose name starts with `prefix`.
    ///
    /// When `delimited` is set, names containing a `/` after the prefix are collapsed into
    /// [`ObjectListing::prefixes`].
    fn list_objects(
        &self,
        prefix: &str,
        delimited: bool,
    ) -> impl Future<Output = Result<ObjectListing, BucketError>> + Send;

    /// Create or replace an object, returning the metadata of the new generation.
    fn create_object(
        &self,
        name: &str,
        contents: Bytes,
    ) -> impl Future<Output = Result<ObjectMeta, BucketError>> + Send;

    /// Delete an object.
    fn delete_object(&self, name: &str) -> impl Future<Output = Result<(), BucketError>> + Send;
}
