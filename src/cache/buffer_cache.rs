//! Buffer Cache
//!
//! Write-back cache of fixed-size blocks in front of a [`StorageDevice`].
//!
//! # Architecture
//!
//! ```text
//! client threads                         scheduler thread
//! ──────────────                         ────────────────
//! read / write / sync
//!   │ structural lock (directory)
//!   │   └─ entry lock ── submit ──▶ WorkSignal ──▶ IoScheduler
//!   │                                                │ entry lock
//!   │◀──────── entry condvar broadcast ──────────────┤ device lock
//! ```
//!
//! Clients never touch the device. A read miss queues a load and parks on
//! the entry; a write updates the payload in place, marks it `Dirty` and
//! queues a flush; `sync` waits until everything dirty at the time of the
//! call has reached the device. Locks are always taken in the order
//! structural, entry, device, and the structural and device locks are never
//! held at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::directory::{CacheDirectory, PinnedEntry};
use super::entry::{alloc_block, BlockState};
use super::metrics::{CacheMetrics, CacheStats};
use super::scheduler::{IoScheduler, WorkKind, WorkSignal};
use crate::device::{check_range, StorageDevice};
use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// State shared between client threads and the scheduler thread
pub(crate) struct CacheCore<D> {
    pub(crate) directory: CacheDirectory,
    pub(crate) device: Mutex<D>,
    pub(crate) work: WorkSignal,
    pub(crate) metrics: CacheMetrics,
    accepting: AtomicBool,
    disk_blocks: u64,
}

/// Concurrent write-back block cache
pub struct BufferCache<D: StorageDevice + 'static = Box<dyn StorageDevice>> {
    core: Arc<CacheCore<D>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    config: CacheConfig,
}

impl<D: StorageDevice + 'static> BufferCache<D> {
    /// Create a cache holding up to `memory_blocks` idle blocks of `device`
    pub fn create(device: D, memory_blocks: usize) -> Result<Self> {
        Self::with_config(device, CacheConfig::with_memory_blocks(memory_blocks))
    }

    /// Create a cache with custom configuration
    ///
    /// Starts the scheduler thread; fails if the configuration is invalid or
    /// the thread or its buffer cannot be created.
    pub fn with_config(device: D, config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let disk_blocks = device.block_count();
        let core = Arc::new(CacheCore {
            directory: CacheDirectory::new(config.memory_blocks),
            device: Mutex::new(device),
            work: WorkSignal::new(),
            metrics: CacheMetrics::new(),
            accepting: AtomicBool::new(true),
            disk_blocks,
        });

        let scheduler = IoScheduler::new(
            Arc::clone(&core),
            alloc_block("scheduler buffer")?,
            config.max_load_burst,
        );
        let handle = thread::Builder::new()
            .name(config.scheduler_thread_name.clone())
            .spawn(move || scheduler.run())
            .map_err(|e| Error::AllocationFailed {
                what: "scheduler thread",
                reason: e.to_string(),
            })?;

        info!(
            memory_blocks = config.memory_blocks,
            disk_blocks,
            block_size = BLOCK_SIZE,
            "Buffer cache created"
        );

        Ok(Self {
            core,
            scheduler: Mutex::new(Some(handle)),
            config,
        })
    }

    /// Copy block `block` into `out`, loading it from the device on a miss
    ///
    /// Blocks while the entry is being loaded or flushed. Concurrent readers
    /// of a cold block share one load and each counts as a miss. A failed
    /// load is reported to every reader that waited on it.
    pub fn read(&self, block: u64, out: &mut [u8]) -> Result<()> {
        self.admit(block, out.len())?;
        let entry = self.lookup(block)?;

        let mut state = entry.lock();
        let mut submitted = false;
        let mut waited_on_load = false;
        loop {
            match state.state {
                BlockState::Ready | BlockState::Dirty => break,
                BlockState::Reading => {
                    waited_on_load = true;
                    entry.wait(&mut state);
                }
                BlockState::Writing => entry.wait(&mut state),
                BlockState::Free => {
                    if waited_on_load {
                        if let Some(err) = state.last_failure.clone() {
                            debug!(block, error = %err, "Read failed");
                            return Err(err);
                        }
                    }
                    self.core.work.submit(WorkKind::Load, entry.shared())?;
                    state.begin_load();
                    submitted = true;
                    debug!(block, "Read miss; load queued");
                }
            }
        }

        out.copy_from_slice(&state.payload[..]);
        drop(state);

        if submitted || waited_on_load {
            self.core.metrics.record_miss();
        } else {
            self.core.metrics.record_hit();
        }
        self.core.metrics.record_read();
        Ok(())
    }

    /// Replace block `block` with `data`
    ///
    /// The block is marked dirty and queued for write-back; the device is
    /// updated asynchronously. Waits only while the entry is in flight.
    pub fn write(&self, block: u64, data: &[u8]) -> Result<()> {
        self.admit(block, data.len())?;
        let entry = self.lookup(block)?;

        let mut state = entry.lock();
        while state.state.is_in_flight() {
            entry.wait(&mut state);
        }
        if !state.queued {
            self.core.work.submit(WorkKind::Flush, entry.shared())?;
            state.queued = true;
        }
        state.store(data);
        drop(state);

        self.core.metrics.record_write();
        Ok(())
    }

    /// Wait until every block dirty at the time of the call is on the device
    ///
    /// Blocks whose earlier flush failed are queued again. Does no device
    /// I/O itself. Returns the first flush failure after all targeted blocks
    /// have settled. Blocks it cleaned count toward capacity again, so idle
    /// entries beyond capacity are evicted before returning.
    #[instrument(skip(self))]
    pub fn sync(&self) -> Result<()> {
        self.ensure_accepting()?;

        let mut targets = Vec::new();
        for entry in self.core.directory.snapshot() {
            let mut state = entry.lock();
            if !state.state.is_dirty() {
                continue;
            }
            if state.state == BlockState::Dirty && !state.queued {
                self.core.work.submit(WorkKind::Flush, Arc::clone(&entry))?;
                state.queued = true;
            }
            let seen = state.completions;
            drop(state);
            targets.push((entry, seen));
        }

        debug!(blocks = targets.len(), "Sync waiting for flushes");

        let mut first_failure = None;
        for (entry, seen) in targets {
            // Writers wait out `Writing`, so the first flush to complete after
            // the snapshot carries the snapshot's data.
            let mut state = entry.lock();
            while state.state.is_dirty() && state.completions == seen {
                entry.wait(&mut state);
            }
            if state.state.is_dirty() {
                if let Some(err) = state.last_failure.clone() {
                    first_failure.get_or_insert(err);
                }
            }
        }

        let evicted = self.core.directory.evict_if_over_capacity();
        if evicted > 0 {
            self.core.metrics.record_evictions(evicted);
        }

        self.core.metrics.record_sync();
        match first_failure {
            Some(err) => {
                warn!(error = %err, "Sync incomplete");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Configured capacity in blocks
    pub fn memory_block_count(&self) -> usize {
        self.core.directory.capacity()
    }

    /// Number of blocks on the device
    pub fn disk_block_count(&self) -> u64 {
        self.core.disk_blocks
    }

    /// Completed `read` calls
    pub fn read_count(&self) -> u64 {
        self.core.metrics.reads()
    }

    /// Completed `write` calls
    pub fn write_count(&self) -> u64 {
        self.core.metrics.writes()
    }

    /// Counters plus current residency
    pub fn stats(&self) -> CacheStats {
        let entries = self.core.directory.snapshot();
        let dirty = entries.iter().filter(|e| e.state().is_dirty()).count();

        CacheStats {
            memory_blocks: self.memory_block_count(),
            disk_blocks: self.core.disk_blocks,
            resident: entries.len(),
            dirty,
            ..self.core.metrics.snapshot()
        }
    }

    /// State of a resident block, `None` if it is not cached
    pub fn state_of(&self, block: u64) -> Option<BlockState> {
        self.core.directory.get(block).map(|entry| entry.state())
    }

    /// Configuration the cache was created with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stop accepting work, drain queued I/O and stop the scheduler
    ///
    /// Later operations fail with [`Error::ShutDown`]. Reports
    /// [`Error::DirtyOnShutdown`] if blocks remain unflushed because their
    /// write-back failed. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.scheduler.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        self.core.accepting.store(false, Ordering::SeqCst);
        self.core.work.close();
        if handle.join().is_err() {
            return Err(Error::Internal("scheduler thread panicked".into()));
        }

        let dirty = self
            .core
            .directory
            .snapshot()
            .iter()
            .filter(|e| e.state().is_dirty())
            .count();
        if dirty > 0 {
            warn!(blocks = dirty, "Buffer cache shut down with dirty blocks");
            return Err(Error::DirtyOnShutdown { blocks: dirty });
        }

        info!(
            reads = self.read_count(),
            writes = self.write_count(),
            "Buffer cache shut down"
        );
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.core.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Validate a request before any entry is created for it
    fn admit(&self, block: u64, buf_len: usize) -> Result<()> {
        if buf_len != BLOCK_SIZE {
            return Err(Error::InvalidBuffer {
                expected: BLOCK_SIZE,
                actual: buf_len,
            });
        }
        check_range(block, self.core.disk_blocks)?;
        self.ensure_accepting()
    }

    fn lookup(&self, block: u64) -> Result<PinnedEntry> {
        let lookup = self.core.directory.lookup_or_create(block)?;
        if lookup.evicted > 0 {
            self.core.metrics.record_evictions(lookup.evicted);
        }
        Ok(lookup.entry)
    }
}

impl<D: StorageDevice + 'static> Drop for BufferCache<D> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "Buffer cache dropped uncleanly");
        }
    }
}

impl<D: StorageDevice + 'static> std::fmt::Debug for BufferCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("memory_blocks", &self.memory_block_count())
            .field("disk_blocks", &self.core.disk_blocks)
            .field("resident", &self.core.directory.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
