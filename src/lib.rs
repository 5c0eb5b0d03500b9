//! bcache - Concurrent Write-Back Buffer Cache
//!
//! An in-memory cache of fixed-size blocks sitting in front of a slow,
//! non-reentrant block device. Many client threads read, write and sync
//! blocks concurrently; a single background scheduler thread performs all
//! device I/O.
//!
//! # Architecture
//!
//! ```text
//! Client threads → BufferCache (directory + entries) → I/O scheduler → StorageDevice
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Directory, block entries, scheduler and the cache itself
//! - [`device`] - Storage device trait and implementations
//! - [`error`] - Error types

pub mod cache;
pub mod device;
pub mod error;

/// Size of every block in bytes
pub const BLOCK_SIZE: usize = 4096;

// Re-export commonly used types
pub use cache::{BlockState, BufferCache, CacheConfig, CacheStats};
pub use device::{MemoryDevice, StorageDevice};
pub use error::{DeviceOp, Error, Result};
