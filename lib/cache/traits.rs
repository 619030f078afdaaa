/// Values stored in a [`WeightedLruCache`](super::eviction::lru::WeightedLruCache).
///
/// The weight is the cost the value charges against the cache capacity. It must be stable
/// while the value sits in the cache: the cache remembers the weight it charged at insertion
/// time and credits exactly that amount back on removal.
pub trait Weighted {
    /// The cost of keeping this value in the cache.
    fn weight(&self) -> u64;
}

impl<T: Weighted + ?Sized> Weighted for std::sync::Arc<T> {
    fn weight(&self) -> u64 {
        (**self).weight()
    }
}
