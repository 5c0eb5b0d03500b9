//! Storage Device Abstraction
//!
//! The buffer cache sits in front of exactly one block device. The device
//! is synchronous and not reentrant: every method takes `&mut self`, and the
//! cache owns it behind a single mutex, so two device operations can never
//! overlap.
//!
//! # Implementations
//!
//! - [`MemoryDevice`] - zero-filled RAM disk with latency and fault injection
//! - [`FileDevice`] - block-aligned image file (unix only)
//! - [`ProbedDevice`] - wrapper that measures device-level concurrency

mod memory;
mod probe;
#[cfg(unix)]
mod file;

pub use memory::{DeviceControl, DeviceCounters, MemoryDevice};
pub use probe::{ConcurrencyProbe, ProbedDevice};
#[cfg(unix)]
pub use file::FileDevice;

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Block-addressed storage device
///
/// Reads and writes always move exactly [`BLOCK_SIZE`] bytes.
pub trait StorageDevice: Send {
    /// Read block `block` into `buf`
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Write `buf` to block `block`
    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Total number of blocks on the device
    fn block_count(&self) -> u64;
}

impl<D: StorageDevice + ?Sized> StorageDevice for Box<D> {
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        (**self).write_block(block, buf)
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

/// Reject block numbers past the end of a device
#[inline]
pub(crate) fn check_range(block: u64, disk_blocks: u64) -> Result<()> {
    if block >= disk_blocks {
        return Err(Error::BlockOutOfRange { block, disk_blocks });
    }
    Ok(())
}

/// Byte offset of `block`, or an error if it overflows
#[inline]
pub(crate) fn block_offset(block: u64) -> Result<u64> {
    block
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| Error::Internal(format!("byte offset of block {} overflows u64", block)))
}
