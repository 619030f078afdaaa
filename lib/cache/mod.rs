/// Cache eviction policies.
pub mod eviction;
/// On-disk cache directory layout.
pub mod fcache;
/// Download progress bookkeeping.
pub mod file_info;
/// Reads served through the file cache.
pub mod reader;
/// Cache traits.
pub mod traits;
