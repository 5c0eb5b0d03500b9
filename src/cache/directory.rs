//! Cache Directory
//!
//! Maps block numbers to resident entries and keeps them in recency order.
//! The directory's mutex is the structural lock: it guards membership only,
//! never payloads, and is never held across device I/O.
//!
//! Capacity is enforced on insertion. A victim must be idle: no client holds
//! a [`PinnedEntry`] for it, its lock is free, it is not queued for I/O, and
//! its state is `Ready` or `Free`. Dirty, in-flight and waited-on
//! entries are never dropped. When no victim qualifies the directory stays
//! over capacity until one does.

use std::ops::Deref;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::entry::{BlockEntry, BlockState};
use crate::error::Result;

/// Client handle to a resident entry
///
/// While any handle exists the entry cannot be evicted, so a client that
/// looked a block up always operates on the entry the directory maps.
#[derive(Debug)]
pub struct PinnedEntry {
    entry: Arc<BlockEntry>,
}

impl PinnedEntry {
    /// Must be called with the structural lock held
    fn new(entry: &Arc<BlockEntry>) -> Self {
        entry.pin();
        Self {
            entry: Arc::clone(entry),
        }
    }

    /// Unpinned reference, for handing the entry to the scheduler
    pub fn shared(&self) -> Arc<BlockEntry> {
        Arc::clone(&self.entry)
    }
}

impl Deref for PinnedEntry {
    type Target = BlockEntry;

    fn deref(&self) -> &BlockEntry {
        &self.entry
    }
}

impl Drop for PinnedEntry {
    fn drop(&mut self) {
        self.entry.unpin();
    }
}

/// Outcome of [`CacheDirectory::lookup_or_create`]
#[derive(Debug)]
pub struct Lookup {
    /// The resident entry for the requested block
    pub entry: PinnedEntry,
    /// Entry was already resident
    pub hit: bool,
    /// Entries dropped to make room
    pub evicted: usize,
}

/// Block number -> entry map with LRU eviction
#[derive(Debug)]
pub struct CacheDirectory {
    inner: Mutex<LruCache<u64, Arc<BlockEntry>>>,
    capacity: usize,
}

impl CacheDirectory {
    /// Create an empty directory holding up to `capacity` idle entries
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
            capacity,
        }
    }

    /// Return the entry for `block`, creating a `Free` one if absent
    ///
    /// Marks the entry most recently used. Creating an entry may evict idle
    /// ones; allocation failure leaves the directory unchanged.
    pub fn lookup_or_create(&self, block: u64) -> Result<Lookup> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.get(&block) {
            return Ok(Lookup {
                entry: PinnedEntry::new(entry),
                hit: true,
                evicted: 0,
            });
        }

        let created = Arc::new(BlockEntry::new(block)?);
        let entry = PinnedEntry::new(&created);
        inner.put(block, created);

        let evicted = self.evict_locked(&mut inner, Some(block));

        Ok(Lookup {
            entry,
            hit: false,
            evicted,
        })
    }

    /// Drop idle entries until the directory is back within capacity
    ///
    /// Returns the number of entries evicted.
    pub fn evict_if_over_capacity(&self) -> usize {
        let mut inner = self.inner.lock();
        self.evict_locked(&mut inner, None)
    }

    fn evict_locked(&self, inner: &mut LruCache<u64, Arc<BlockEntry>>, keep: Option<u64>) -> usize {
        let mut evicted = 0;
        while inner.len() > self.capacity {
            match Self::find_victim(inner, keep) {
                Some(victim) => {
                    inner.pop(&victim);
                    evicted += 1;
                    debug!(block = victim, "Evicted idle block");
                }
                None => {
                    warn!(
                        resident = inner.len(),
                        capacity = self.capacity,
                        "No idle block to evict; cache over capacity"
                    );
                    break;
                }
            }
        }
        evicted
    }

    /// Least recently used idle entry, skipping `keep`
    ///
    /// Caller holds the structural lock, so pins cannot be taken while the
    /// candidate is examined.
    fn find_victim(inner: &LruCache<u64, Arc<BlockEntry>>, keep: Option<u64>) -> Option<u64> {
        inner
            .iter()
            .rev()
            .filter(|(block, _)| Some(**block) != keep)
            .find(|&(_, entry)| {
                if entry.pins() != 0 {
                    return false;
                }
                match entry.try_lock() {
                    Some(state) => {
                        !state.queued
                            && matches!(state.state, BlockState::Ready | BlockState::Free)
                    }
                    None => false,
                }
            })
            .map(|(block, _)| *block)
    }

    /// Resident entry for `block`, without touching recency
    pub fn get(&self, block: u64) -> Option<Arc<BlockEntry>> {
        self.inner.lock().peek(&block).cloned()
    }

    /// All resident entries, most recently used first
    pub fn snapshot(&self) -> Vec<Arc<BlockEntry>> {
        self.inner
            .lock()
            .iter()
            .map(|(_, entry)| Arc::clone(entry))
            .collect()
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no entry is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity in blocks
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Tests
// =============================================================================
