//! Device Concurrency Probe
//!
//! Wraps a device and records how many callers are inside it at once.
//! The cache must never let this exceed one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::StorageDevice;
use crate::error::Result;
use crate::BLOCK_SIZE;

/// Shared view of the in-flight counters of a [`ProbedDevice`]
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    operations: AtomicU64,
}

impl ConcurrencyProbe {
    /// Operations currently inside the device
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous operations ever observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total operations that entered the device
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.operations.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { probe: self }
    }
}

struct InFlightGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Device wrapper feeding a [`ConcurrencyProbe`]
#[derive(Debug)]
pub struct ProbedDevice<D> {
    inner: D,
    probe: Arc<ConcurrencyProbe>,
}

impl<D: StorageDevice> ProbedDevice<D> {
    /// Wrap `inner`
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            probe: Arc::new(ConcurrencyProbe::default()),
        }
    }

    /// Counters shared with the wrapper
    pub fn probe(&self) -> Arc<ConcurrencyProbe> {
        Arc::clone(&self.probe)
    }
}

impl<D: StorageDevice> StorageDevice for ProbedDevice<D> {
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let _guard = self.probe.enter();
        self.inner.read_block(block, buf)
    }

    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let _guard = self.probe.enter();
        self.inner.write_block(block, buf)
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}
