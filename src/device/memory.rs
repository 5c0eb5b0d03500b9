//! In-Memory Storage Device
//!
//! RAM-backed disk used by tests and the load harness. Besides plain storage
//! it can simulate per-operation latency and inject read/write failures on
//! chosen blocks. Both knobs, the I/O counters and the raw contents are
//! reachable through a [`DeviceControl`] handle after the device itself has
//! been moved into a cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{block_offset, check_range, StorageDevice};
use crate::error::{DeviceOp, Error, Result};
use crate::BLOCK_SIZE;

/// Operation counters for a device
#[derive(Debug, Default)]
pub struct DeviceCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl DeviceCounters {
    /// Completed block reads
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Completed block writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Injected failures returned to the caller
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    failing_reads: HashSet<u64>,
    failing_writes: HashSet<u64>,
}

#[derive(Debug)]
struct Shared {
    data: Mutex<Vec<u8>>,
    faults: Mutex<FaultPlan>,
    counters: DeviceCounters,
    block_count: u64,
}

/// RAM-backed block device
#[derive(Debug)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
    latency: Option<Duration>,
}

impl MemoryDevice {
    /// Create a zero-filled device of `block_count` blocks
    pub fn new(block_count: u64) -> Result<Self> {
        let len = usize::try_from(block_count)
            .ok()
            .and_then(|n| n.checked_mul(BLOCK_SIZE))
            .ok_or_else(|| Error::AllocationFailed {
                what: "memory device",
                reason: format!("{} blocks exceed the address space", block_count),
            })?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::AllocationFailed {
                what: "memory device",
                reason: e.to_string(),
            })?;
        data.resize(len, 0);

        Ok(Self {
            shared: Arc::new(Shared {
                data: Mutex::new(data),
                faults: Mutex::new(FaultPlan::default()),
                counters: DeviceCounters::default(),
                block_count,
            }),
            latency: None,
        })
    }

    /// Sleep for `latency` inside every read and write
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency).filter(|d| !d.is_zero());
        self
    }

    /// Handle for inspecting and steering the device from outside the cache
    pub fn control(&self) -> DeviceControl {
        DeviceControl {
            shared: Arc::clone(&self.shared),
        }
    }

    fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl StorageDevice for MemoryDevice {
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block, self.shared.block_count)?;
        self.simulate_latency();

        if self.shared.faults.lock().failing_reads.contains(&block) {
            self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::device(block, DeviceOp::Read, "injected read fault"));
        }

        let start = block_offset(block)? as usize;
        let data = self.shared.data.lock();
        buf.copy_from_slice(&data[start..start + BLOCK_SIZE]);
        self.shared.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block, self.shared.block_count)?;
        self.simulate_latency();

        if self.shared.faults.lock().failing_writes.contains(&block) {
            self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::device(block, DeviceOp::Write, "injected write fault"));
        }

        let start = block_offset(block)? as usize;
        let mut data = self.shared.data.lock();
        data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        self.shared.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.shared.block_count
    }
}

/// Out-of-band handle onto a [`MemoryDevice`]
#[derive(Debug, Clone)]
pub struct DeviceControl {
    shared: Arc<Shared>,
}

impl DeviceControl {
    /// Operation counters
    pub fn counters(&self) -> &DeviceCounters {
        &self.shared.counters
    }

    /// Copy of the stored contents of `block`, bypassing any cache
    pub fn contents(&self, block: u64) -> Result<Vec<u8>> {
        check_range(block, self.shared.block_count)?;
        let start = block_offset(block)? as usize;
        Ok(self.shared.data.lock()[start..start + BLOCK_SIZE].to_vec())
    }

    /// Overwrite `block` directly on the device, bypassing any cache
    pub fn poke(&self, block: u64, bytes: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block, self.shared.block_count)?;
        let start = block_offset(block)? as usize;
        self.shared.data.lock()[start..start + BLOCK_SIZE].copy_from_slice(bytes);
        Ok(())
    }

    /// Make every read of `block` fail until healed
    pub fn fail_reads_of(&self, block: u64) {
        self.shared.faults.lock().failing_reads.insert(block);
    }

    /// Make every write of `block` fail until healed
    pub fn fail_writes_of(&self, block: u64) {
        self.shared.faults.lock().failing_writes.insert(block);
    }

    /// Clear injected faults on `block`
    pub fn heal(&self, block: u64) {
        let mut faults = self.shared.faults.lock();
        faults.failing_reads.remove(&block);
        faults.failing_writes.remove(&block);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_is_zeroed() {
        let mut dev = MemoryDevice::new(8).unwrap();
        assert_eq!(dev.block_count(), 8);

        let mut buf = [0xFFu8; BLOCK_SIZE];
        dev.read_block(7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read() {
        let mut dev = MemoryDevice::new(4).unwrap();
        let ctl = dev.control();

        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 1;
        data[BLOCK_SIZE - 1] = 2;
        dev.write_block(3, &data).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        dev.read_block(3, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(ctl.contents(3).unwrap(), data.to_vec());

        assert_eq!(ctl.counters().reads(), 1);
        assert_eq!(ctl.counters().writes(), 1);
    }

    #[test]
    fn test_out_of_range() {
        let mut dev = MemoryDevice::new(2).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            dev.read_block(2, &mut buf),
            Err(Error::BlockOutOfRange { block: 2, .. })
        ));
        assert!(dev.write_block(9, &buf).is_err());
    }

    #[test]
    fn test_fault_injection_and_heal() {
        let mut dev = MemoryDevice::new(4).unwrap();
        let ctl = dev.control();
        let mut buf = [0u8; BLOCK_SIZE];

        ctl.fail_reads_of(1);
        ctl.fail_writes_of(2);

        let err = dev.read_block(1, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceFailure {
                block: 1,
                op: DeviceOp::Read,
                ..
            }
        ));
        assert!(dev.write_block(2, &buf).is_err());
        assert!(dev.read_block(2, &mut buf).is_ok());
        assert_eq!(ctl.counters().failures(), 2);

        ctl.heal(1);
        ctl.heal(2);
        assert!(dev.read_block(1, &mut buf).is_ok());
        assert!(dev.write_block(2, &buf).is_ok());
    }

    #[test]
    fn test_poke_bypasses_counters() {
        let dev = MemoryDevice::new(2).unwrap();
        let ctl = dev.control();
        ctl.poke(1, &[9u8; BLOCK_SIZE]).unwrap();
        assert_eq!(ctl.contents(1).unwrap()[100], 9);
        assert_eq!(ctl.counters().writes(), 0);
    }

    #[test]
    fn test_zero_latency_is_ignored() {
        let dev = MemoryDevice::new(1).unwrap().with_latency(Duration::ZERO);
        assert!(dev.latency.is_none());
    }
}
