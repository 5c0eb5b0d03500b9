//! Block Entry Types
//!
//! One [`BlockEntry`] per resident block: the payload, its lifecycle state,
//! and the lock + condition variable pair every waiter parks on.
//!
//! ```text
//! Free --(load queued)--> Reading --(device read ok)--> Ready
//!  ^                         |
//!  +----(device read failed)-+
//!
//! Ready/Free --(client write)--> Dirty --(flush taken)--> Writing --(ok)--> Ready
//!                                  ^                         |
//!                                  +----(device write failed)+
//! ```
//!
//! All transitions happen with the entry lock held and are followed by a
//! broadcast on the entry's condition variable.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Lifecycle state of a cached block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// No valid payload; a load is required before reading
    Free,
    /// Load queued or in progress
    Reading,
    /// Payload matches the device
    Ready,
    /// Payload is newer than the device
    Dirty,
    /// Flush in progress
    Writing,
}

impl BlockState {
    /// Payload may be handed to clients
    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, BlockState::Ready | BlockState::Dirty)
    }

    /// Device I/O owns the entry
    #[inline]
    pub fn is_in_flight(self) -> bool {
        matches!(self, BlockState::Reading | BlockState::Writing)
    }

    /// Holds data the device has not seen yet
    #[inline]
    pub fn is_dirty(self) -> bool {
        matches!(self, BlockState::Dirty | BlockState::Writing)
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Free => write!(f, "Free"),
            BlockState::Reading => write!(f, "Reading"),
            BlockState::Ready => write!(f, "Ready"),
            BlockState::Dirty => write!(f, "Dirty"),
            BlockState::Writing => write!(f, "Writing"),
        }
    }
}

/// Allocate a zeroed block buffer, reporting failure instead of aborting
pub(crate) fn alloc_block(what: &'static str) -> Result<Box<[u8; BLOCK_SIZE]>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(BLOCK_SIZE)
        .map_err(|e| Error::AllocationFailed {
            what,
            reason: e.to_string(),
        })?;
    bytes.resize(BLOCK_SIZE, 0u8);
    bytes
        .into_boxed_slice()
        .try_into()
        .map_err(|_| Error::AllocationFailed {
            what,
            reason: "block buffer has wrong length".into(),
        })
}

/// State guarded by the entry lock
#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) state: BlockState,
    pub(crate) payload: Box<[u8; BLOCK_SIZE]>,
    /// Sitting in the scheduler's work queue
    pub(crate) queued: bool,
    /// Device operations finished on this entry, successful or not
    pub(crate) completions: u64,
    /// Outcome of the most recent failed device operation, cleared on success
    pub(crate) last_failure: Option<Error>,
}

impl EntryState {
    pub(crate) fn begin_load(&mut self) {
        debug_assert_eq!(self.state, BlockState::Free);
        self.state = BlockState::Reading;
        self.queued = true;
        self.last_failure = None;
    }

    pub(crate) fn complete_load(&mut self, data: &[u8; BLOCK_SIZE]) {
        debug_assert_eq!(self.state, BlockState::Reading);
        self.payload.copy_from_slice(data);
        self.state = BlockState::Ready;
        self.completions += 1;
    }

    pub(crate) fn fail_load(&mut self, err: Error) {
        debug_assert_eq!(self.state, BlockState::Reading);
        self.state = BlockState::Free;
        self.completions += 1;
        self.last_failure = Some(err);
    }

    /// Replace the payload with client data
    pub(crate) fn store(&mut self, data: &[u8]) {
        debug_assert!(!self.state.is_in_flight());
        self.payload.copy_from_slice(data);
        self.state = BlockState::Dirty;
    }

    /// Dirty -> Writing, copying the payload out for the device
    pub(crate) fn begin_flush(&mut self, scratch: &mut [u8; BLOCK_SIZE]) {
        debug_assert_eq!(self.state, BlockState::Dirty);
        scratch.copy_from_slice(&self.payload[..]);
        self.state = BlockState::Writing;
    }

    pub(crate) fn complete_flush(&mut self) {
        debug_assert_eq!(self.state, BlockState::Writing);
        self.state = BlockState::Ready;
        self.completions += 1;
        self.last_failure = None;
    }

    pub(crate) fn fail_flush(&mut self, err: Error) {
        debug_assert_eq!(self.state, BlockState::Writing);
        self.state = BlockState::Dirty;
        self.completions += 1;
        self.last_failure = Some(err);
    }
}

/// One cached block
#[derive(Debug)]
pub struct BlockEntry {
    block: u64,
    inner: Mutex<EntryState>,
    ready: Condvar,
    /// Client references handed out by the directory
    pins: AtomicUsize,
}

impl BlockEntry {
    /// Create an entry in state `Free`
    pub(crate) fn new(block: u64) -> Result<Self> {
        Ok(Self {
            block,
            inner: Mutex::new(EntryState {
                state: BlockState::Free,
                payload: alloc_block("block entry")?,
                queued: false,
                completions: 0,
                last_failure: None,
            }),
            ready: Condvar::new(),
            pins: AtomicUsize::new(0),
        })
    }

    /// Block number this entry caches
    #[inline]
    pub fn block_number(&self) -> u64 {
        self.block
    }

    /// Current state (racy by nature; for inspection only)
    pub fn state(&self) -> BlockState {
        self.inner.lock().state
    }

    /// Only called with the structural lock held
    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    /// Clients currently holding this entry
    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.inner.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, EntryState>> {
        self.inner.try_lock()
    }

    /// Park on the ready condition until the next broadcast
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, EntryState>) {
        self.ready.wait(guard);
    }

    /// Wake every waiter after a state transition
    pub(crate) fn broadcast(&self) {
        self.ready.notify_all();
    }
}

// =============================================================================
// Tests
// =============================================================================
