//! Implements the weighted LRU eviction policy.
//!
//! Entries live in an arena of slots addressed by index. The recency list threads through the
//! slots via `prev`/`next` indices, with `head` pointing at the most recently used entry and
//! `tail` at the least recently used one. A side index maps keys to slots. Moving an entry to
//! the front or unlinking it is a handful of index updates; there are no back-pointers.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::cache::traits::Weighted;
use crate::sync::{Mutex, lock};

type Slot = usize;

#[derive(Debug)]
struct Node<V> {
    key: String,
    value: V,
    /// The weight charged for this entry when it was stored.
    weight: u64,
    /// Neighbour towards the most-recent end.
    prev: Option<Slot>,
    /// Neighbour towards the least-recent end.
    next: Option<Slot>,
}

/// A broken internal invariant, reported by [`WeightedLruCache::check_invariants`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The capacity is zero.
    #[error("max weight must be positive")]
    ZeroMaxWeight,

    /// More weight is held than the capacity allows.
    #[error("occupied weight {occupied} exceeds max weight {max}")]
    OverCapacity {
        /// Weight held.
        occupied: u64,
        /// Capacity.
        max: u64,
    },

    /// The running total disagrees with the entries.
    #[error("occupied weight {recorded} does not match the sum of entry weights {actual}")]
    WeightMismatch {
        /// The running total.
        recorded: u64,
        /// Sum over the entries.
        actual: u64,
    },

    /// A value's weight changed after it was charged.
    #[error("entry {key:?} changed weight from {charged} to {current} while cached")]
    WeightDrift {
        /// The entry.
        key: String,
        /// Weight charged on insert.
        charged: u64,
        /// Weight reported now.
        current: u64,
    },

    /// The recency list and the index hold different numbers of entries.
    #[error("recency list holds {listed} entries but the index holds {indexed}")]
    LengthMismatch {
        /// Entries reachable through the recency list.
        listed: usize,
        /// Entries in the index.
        indexed: usize,
    },

    /// An index entry points at the wrong node.
    #[error("index entry for {0:?} does not point at its list node")]
    IndexMismatch(String),

    /// Forward and backward links disagree.
    #[error("recency list links are inconsistent at slot {0}")]
    BrokenLink(usize),

    /// Arena slots are neither live nor free.
    #[error("arena holds {slots} slots but {live} are live and {free} are free")]
    LeakedSlots {
        /// Slots in the arena.
        slots: usize,
        /// Slots holding entries.
        live: usize,
        /// Slots on the free list.
        free: usize,
    },
}

/// Failure to persist or restore a cache snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The bytes are not a snapshot.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The snapshot decodes but breaks an invariant.
    #[error("snapshot is inconsistent: {0}")]
    Inconsistent(#[from] InvariantViolation),

    /// A key appears twice.
    #[error("snapshot lists key {0:?} more than once")]
    DuplicateKey(String),
}

/// Persisted form of a [`WeightedLruCache`].
///
/// Entries are ordered most recently used first. The key index is derived on restore and is not
/// part of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruSnapshot<V> {
    /// Capacity of the cache.
    pub max_weight: u64,
    /// Sum of the entry weights at capture time.
    pub occupied_weight: u64,
    /// `(key, value)` pairs, most recently used first.
    pub entries: Vec<(String, V)>,
}

#[derive(Debug)]
struct LruState<V> {
    max_weight: u64,
    occupied_weight: u64,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<Slot>,
    index: FxHashMap<String, Slot>,
    head: Option<Slot>,
    tail: Option<Slot>,
}

impl<V: Weighted> LruState<V> {
    fn new(max_weight: u64) -> Self {
        Self {
            max_weight,
            occupied_weight: 0,
            nodes: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, slot: Slot) -> &Node<V> {
        match self.nodes.get(slot).and_then(Option::as_ref) {
            Some(node) => node,
            None => unreachable!("slot {slot} is linked but vacant"),
        }
    }

    fn node_mut(&mut self, slot: Slot) -> &mut Node<V> {
        match self.nodes.get_mut(slot).and_then(Option::as_mut) {
            Some(node) => node,
            None => unreachable!("slot {slot} is linked but vacant"),
        }
    }

    fn alloc(&mut self, node: Node<V>) -> Slot {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, slot: Slot) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, slot: Slot) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn push_back(&mut self, slot: Slot) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.next = None;
            node.prev = old_tail;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Unlink the slot, drop it from the index, release the arena slot and credit its weight.
    fn remove_slot(&mut self, slot: Slot) -> V {
        self.unlink(slot);
        let Some(node) = self.nodes[slot].take() else {
            unreachable!("slot {slot} is linked but vacant");
        };
        self.free.push(slot);
        self.index.remove(&node.key);
        self.occupied_weight -= node.weight;
        node.value
    }

    /// Store `value` under `key`, replacing any previous value, and leave the entry unlinked.
    ///
    /// Returns the slot and whether the key was already present.
    fn store(&mut self, key: String, value: V) -> (Slot, bool) {
        let weight = value.weight();
        if let Some(&slot) = self.index.get(&key) {
            let node = self.node_mut(slot);
            let old_weight = node.weight;
            node.value = value;
            node.weight = weight;
            self.occupied_weight = self.occupied_weight - old_weight + weight;
            (slot, true)
        } else {
            let slot = self.alloc(Node {
                key: key.clone(),
                value,
                weight,
                prev: None,
                next: None,
            });
            self.index.insert(key, slot);
            self.occupied_weight += weight;
            (slot, false)
        }
    }

    fn evict_until_fits(&mut self) -> Vec<V> {
        let mut evicted = Vec::new();
        while self.occupied_weight > self.max_weight {
            let Some(tail) = self.tail else {
                unreachable!("occupied weight is positive but the cache is empty");
            };
            evicted.push(self.remove_slot(tail));
        }
        evicted
    }

    fn insert(&mut self, key: String, value: V) -> Vec<V> {
        let (slot, existed) = self.store(key, value);
        if existed {
            self.unlink(slot);
        }
        self.push_front(slot);
        self.evict_until_fits()
    }

    fn update_in_place(&mut self, key: String, value: V) -> Vec<V> {
        let (slot, existed) = self.store(key, value);
        if !existed {
            self.push_back(slot);
        }
        self.evict_until_fits()
    }

    fn erase(&mut self, key: &str) -> Option<V> {
        let slot = *self.index.get(key)?;
        Some(self.remove_slot(slot))
    }

    fn touch(&mut self, key: &str) -> Option<Slot> {
        let slot = *self.index.get(key)?;
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
        Some(slot)
    }

    /// Slots from most to least recently used.
    fn iter_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        std::iter::successors(self.head, |&slot| self.node(slot).next)
    }

    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.max_weight == 0 {
            return Err(InvariantViolation::ZeroMaxWeight);
        }
        if self.occupied_weight > self.max_weight {
            return Err(InvariantViolation::OverCapacity {
                occupied: self.occupied_weight,
                max: self.max_weight,
            });
        }

        let mut listed = 0usize;
        let mut sum = 0u64;
        let mut prev: Option<Slot> = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.nodes.get(slot).and_then(Option::as_ref) else {
                return Err(InvariantViolation::BrokenLink(slot));
            };
            if node.prev != prev {
                return Err(InvariantViolation::BrokenLink(slot));
            }
            if self.index.get(&node.key) != Some(&slot) {
                return Err(InvariantViolation::IndexMismatch(node.key.clone()));
            }
            let current = node.value.weight();
            if current != node.weight {
                return Err(InvariantViolation::WeightDrift {
                    key: node.key.clone(),
                    charged: node.weight,
                    current,
                });
            }
            listed += 1;
            if listed > self.nodes.len() {
                // A cycle in the list would otherwise spin forever.
                return Err(InvariantViolation::BrokenLink(slot));
            }
            sum += node.weight;
            prev = Some(slot);
            cursor = node.next;
        }
        if self.tail != prev {
            return Err(InvariantViolation::BrokenLink(prev.unwrap_or_default()));
        }
        if listed != self.index.len() {
            return Err(InvariantViolation::LengthMismatch {
                listed,
                indexed: self.index.len(),
            });
        }
        if sum != self.occupied_weight {
            return Err(InvariantViolation::WeightMismatch {
                recorded: self.occupied_weight,
                actual: sum,
            });
        }
        let free_ok = self
            .free
            .iter()
            .all(|&slot| matches!(self.nodes.get(slot), Some(None)));
        if !free_ok || self.nodes.len() != listed + self.free.len() {
            return Err(InvariantViolation::LeakedSlots {
                slots: self.nodes.len(),
                live: listed,
                free: self.free.len(),
            });
        }
        Ok(())
    }
}

/// A capacity-bounded cache of string keys to [`Weighted`] values, evicting the least recently
/// used entries once the total weight exceeds the configured maximum.
///
/// Every public operation takes the cache's single lock, so no operation is ever observed half
/// applied. Callers that need atomicity across operations (check-then-insert) must serialize
/// themselves.
///
/// Evictions are never silent: [`insert`](Self::insert) and
/// [`update_in_place`](Self::update_in_place) hand evicted values back to the caller, in
/// eviction order, so the caller can release whatever the values stand for.
#[derive(Debug)]
pub struct WeightedLruCache<V> {
    state: Mutex<LruState<V>>,
}

impl<V: Weighted> WeightedLruCache<V> {
    /// Create an empty cache that holds at most `max_weight` total weight.
    ///
    /// # Panics
    ///
    /// Panics if `max_weight` is zero. A zero capacity is a caller bug, not a runtime condition.
    #[must_use]
    pub fn new(max_weight: u64) -> Self {
        assert!(max_weight > 0, "WeightedLruCache requires a positive max weight");
        Self {
            state: Mutex::new(LruState::new(max_weight)),
        }
    }

    /// Insert `value` under `key`, overwriting any previous entry, and mark the key as the most
    /// recently used.
    ///
    /// Then evicts least recently used entries until the total weight fits, returning every
    /// evicted value in eviction order. The inserted value itself is evicted if it alone is
    /// heavier than the capacity.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Vec<V> {
        lock(&self.state).insert(key.into(), value)
    }

    /// Like [`insert`](Self::insert), but an existing entry keeps its recency position, and a
    /// new entry is placed at the least recently used end.
    ///
    /// This is the path for bookkeeping updates that are not real accesses, so that such
    /// updates never shield an entry from eviction.
    pub fn update_in_place(&self, key: impl Into<String>, value: V) -> Vec<V> {
        lock(&self.state).update_in_place(key.into(), value)
    }

    /// Like [`update_in_place`](Self::update_in_place), but refused when an existing entry
    /// fails `accept`. Returns `None` if the update was refused.
    pub fn update_in_place_if(
        &self,
        key: impl Into<String>,
        value: V,
        accept: impl FnOnce(&V) -> bool,
    ) -> Option<Vec<V>> {
        let key = key.into();
        let mut state = lock(&self.state);
        if let Some(&slot) = state.index.get(&key)
            && !accept(&state.node(slot).value)
        {
            return None;
        }
        Some(state.update_in_place(key, value))
    }

    /// Remove the entry for `key`, returning its value. No-op if the key is absent.
    pub fn erase(&self, key: &str) -> Option<V> {
        lock(&self.state).erase(key)
    }

    /// The capacity this cache was created with.
    #[must_use]
    pub fn max_weight(&self) -> u64 {
        lock(&self.state).max_weight
    }

    /// The sum of the weights of all cached entries.
    #[must_use]
    pub fn occupied_weight(&self) -> u64 {
        lock(&self.state).occupied_weight
    }

    /// The number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).index.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` is cached. Does not affect recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.state).index.contains_key(key)
    }

    /// Keys from most to least recently used.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .iter_slots()
            .map(|slot| state.node(slot).key.clone())
            .collect()
    }

    /// Verify every internal invariant: positive capacity, occupied weight within capacity and
    /// equal to the sum of entry weights, and a bijection between the index and the recency
    /// list.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        lock(&self.state).check_invariants()
    }
}

impl<V: Weighted + Clone> WeightedLruCache<V> {
    /// Look up `key`, marking it as the most recently used on a hit.
    pub fn look_up(&self, key: &str) -> Option<V> {
        let mut state = lock(&self.state);
        let slot = state.touch(key)?;
        Some(state.node(slot).value.clone())
    }

    /// Look up `key` without affecting recency.
    pub fn peek(&self, key: &str) -> Option<V> {
        let state = lock(&self.state);
        let slot = *state.index.get(key)?;
        Some(state.node(slot).value.clone())
    }

    /// Capture the cache contents, most recently used first.
    #[must_use]
    pub fn to_snapshot(&self) -> LruSnapshot<V> {
        let state = lock(&self.state);
        let entries = state
            .iter_slots()
            .map(|slot| {
                let node = state.node(slot);
                (node.key.clone(), node.value.clone())
            })
            .collect();
        LruSnapshot {
            max_weight: state.max_weight,
            occupied_weight: state.occupied_weight,
            entries,
        }
    }

    /// Rebuild a cache from a snapshot, preserving recency order.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot has a zero capacity, repeats a key, or records an occupied weight
    /// that disagrees with its entries or exceeds its capacity.
    pub fn from_snapshot(snapshot: LruSnapshot<V>) -> Result<Self, SnapshotError> {
        if snapshot.max_weight == 0 {
            return Err(InvariantViolation::ZeroMaxWeight.into());
        }
        let mut state = LruState::new(snapshot.max_weight);
        for (key, value) in snapshot.entries {
            if state.index.contains_key(&key) {
                return Err(SnapshotError::DuplicateKey(key));
            }
            let (slot, _) = state.store(key, value);
            state.push_back(slot);
        }
        if state.occupied_weight != snapshot.occupied_weight {
            return Err(InvariantViolation::WeightMismatch {
                recorded: snapshot.occupied_weight,
                actual: state.occupied_weight,
            }
            .into());
        }
        state.check_invariants()?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl<V: Weighted + Clone + Serialize> WeightedLruCache<V> {
    /// Serialize the cache into its byte snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails to serialize.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(&self.to_snapshot())?)
    }
}

impl<V: Weighted + Clone + DeserializeOwned> WeightedLruCache<V> {
    /// Restore a cache from bytes produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode or describe an inconsistent cache.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: LruSnapshot<V> = bincode::deserialize(bytes)?;
        Self::from_snapshot(snapshot)
    }
}
