//! Background I/O Scheduler
//!
//! A single dedicated thread performs every device operation the cache
//! issues. Clients hand it work through [`WorkSignal`], a mutex-protected
//! pair of queues plus a condition variable; the thread sleeps while both
//! queues are empty and is woken by each submission.
//!
//! # Ordering
//!
//! Loads go first because a client is blocked on every one of them. Flushes
//! are write-back and can wait, but not forever: after `max_load_burst`
//! consecutive loads one pending flush is let through.
//!
//! # Locking
//!
//! The work-queue mutex is a leaf: submitters may hold an entry lock while
//! submitting, the scheduler never holds it while taking any other lock.
//! Device I/O runs with only the device lock held. The scheduler never
//! touches the directory, so the device lock and the structural lock are
//! never held together.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, trace};

use super::buffer_cache::CacheCore;
use super::entry::{BlockEntry, BlockState};
use super::metrics::LatencyTracker;
use crate::device::StorageDevice;
use crate::error::{DeviceOp, Error, Result};
use crate::BLOCK_SIZE;

/// Kind of device operation requested for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Read the block from the device (entry is `Reading`)
    Load,
    /// Write the entry's payload back (entry is `Dirty`)
    Flush,
}

#[derive(Debug)]
struct WorkQueue {
    loads: VecDeque<Arc<BlockEntry>>,
    flushes: VecDeque<Arc<BlockEntry>>,
    closing: bool,
}

/// Work queue shared by clients and the scheduler thread
#[derive(Debug)]
pub struct WorkSignal {
    queue: Mutex<WorkQueue>,
    available: Condvar,
}

impl Default for WorkSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSignal {
    /// Create an open, empty work queue
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(WorkQueue {
                loads: VecDeque::new(),
                flushes: VecDeque::new(),
                closing: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Queue `entry` and wake the scheduler
    ///
    /// Fails with [`Error::ShutDown`] once the queue has been closed.
    pub fn submit(&self, kind: WorkKind, entry: Arc<BlockEntry>) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.closing {
            return Err(Error::ShutDown);
        }
        match kind {
            WorkKind::Load => queue.loads.push_back(entry),
            WorkKind::Flush => queue.flushes.push_back(entry),
        }
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    /// Block until work is available
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn next(&self, prefer_flush: bool) -> Option<(WorkKind, Arc<BlockEntry>)> {
        let mut queue = self.queue.lock();
        loop {
            if prefer_flush {
                if let Some(entry) = queue.flushes.pop_front() {
                    return Some((WorkKind::Flush, entry));
                }
            }
            if let Some(entry) = queue.loads.pop_front() {
                return Some((WorkKind::Load, entry));
            }
            if let Some(entry) = queue.flushes.pop_front() {
                return Some((WorkKind::Flush, entry));
            }
            if queue.closing {
                return None;
            }
            self.available.wait(&mut queue);
        }
    }

    /// Refuse new work; the scheduler exits after draining what is queued
    pub fn close(&self) {
        self.queue.lock().closing = true;
        self.available.notify_all();
    }

    /// Queued (loads, flushes)
    pub fn pending(&self) -> (usize, usize) {
        let queue = self.queue.lock();
        (queue.loads.len(), queue.flushes.len())
    }
}

/// Device failures keep their shape; anything else is wrapped into one
fn as_device_failure(block: u64, op: DeviceOp, err: Error) -> Error {
    if err.is_device_failure() {
        err
    } else {
        Error::device(block, op, err.to_string())
    }
}

/// The scheduler thread's state
pub(crate) struct IoScheduler<D: StorageDevice> {
    core: Arc<CacheCore<D>>,
    scratch: Box<[u8; BLOCK_SIZE]>,
    max_load_burst: usize,
}

impl<D: StorageDevice> IoScheduler<D> {
    pub(crate) fn new(
        core: Arc<CacheCore<D>>,
        scratch: Box<[u8; BLOCK_SIZE]>,
        max_load_burst: usize,
    ) -> Self {
        Self {
            core,
            scratch,
            max_load_burst,
        }
    }

    /// Service the work queue until it is closed and drained
    #[instrument(name = "io_scheduler", skip(self))]
    pub(crate) fn run(mut self) {
        info!(max_load_burst = self.max_load_burst, "I/O scheduler started");

        let mut consecutive_loads = 0usize;
        while let Some((kind, entry)) = self
            .core
            .work
            .next(consecutive_loads >= self.max_load_burst)
        {
            match kind {
                WorkKind::Load => {
                    consecutive_loads = consecutive_loads.saturating_add(1);
                    self.load(&entry);
                }
                WorkKind::Flush => {
                    consecutive_loads = 0;
                    self.flush(&entry);
                }
            }
        }

        info!("I/O scheduler stopped");
    }

    fn load(&mut self, entry: &BlockEntry) {
        let block = entry.block_number();
        {
            let mut state = entry.lock();
            state.queued = false;
            if state.state != BlockState::Reading {
                debug!(block, state = %state.state, "Skipping stale load");
                return;
            }
        }

        let tracker = LatencyTracker::start();
        let outcome = self.core.device.lock().read_block(block, &mut self.scratch);

        let mut state = entry.lock();
        match outcome {
            Ok(()) => {
                state.complete_load(&self.scratch);
                self.core.metrics.record_load(tracker.elapsed());
                trace!(block, "Block loaded");
            }
            Err(err) => {
                let err = as_device_failure(block, DeviceOp::Read, err);
                error!(block, error = %err, "Block load failed");
                self.core.metrics.record_load_failure();
                state.fail_load(err);
            }
        }
        drop(state);
        entry.broadcast();
    }

    fn flush(&mut self, entry: &BlockEntry) {
        let block = entry.block_number();
        {
            let mut state = entry.lock();
            state.queued = false;
            if state.state != BlockState::Dirty {
                debug!(block, state = %state.state, "Skipping stale flush");
                return;
            }
            state.begin_flush(&mut self.scratch);
        }

        let tracker = LatencyTracker::start();
        let outcome = self.core.device.lock().write_block(block, &self.scratch);

        let mut state = entry.lock();
        match outcome {
            Ok(()) => {
                state.complete_flush();
                self.core.metrics.record_flush(tracker.elapsed());
                trace!(block, "Block flushed");
            }
            Err(err) => {
                let err = as_device_failure(block, DeviceOp::Write, err);
                error!(block, error = %err, "Block flush failed; data stays dirty");
                self.core.metrics.record_flush_failure();
                state.fail_flush(err);
            }
        }
        drop(state);
        entry.broadcast();
    }
}

// =============================================================================
// Tests
// =============================================================================
