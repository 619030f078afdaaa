//! Filesystem-facing policy: directory listings and their kernel caching.
/// Directory views over a flat bucket.
pub mod listing;
/// Kernel list-cache lifetime.
pub mod ttl;

pub use listing::{DirEntry, EntryKind, ListingService, OpenDirReply};
pub use ttl::KernelListCacheTtl;
