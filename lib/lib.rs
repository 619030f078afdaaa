//! bucketfs shared library.

/// Remote object store abstraction.
pub mod bucket;
/// Caching primitives for bucketfs.
pub mod cache;
pub mod clock;
/// Background object downloads.
pub mod download;
/// Directory listings and kernel list caching.
pub mod fs;
pub mod io;
pub mod sync;
