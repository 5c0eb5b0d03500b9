//! Concurrent Write-Back Block Cache
//!
//! Keeps a bounded set of fixed-size blocks of a slow device in memory and
//! serves many client threads at once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           BufferCache                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  CacheDirectory         │ BlockEntry (x N)       │ IoScheduler        │
//! │  ┌──────────────────┐   │ ┌──────────────────┐   │ ┌────────────────┐ │
//! │  │ LRU map          │──▶│ │ state + payload  │◀──│ │ loads, flushes │ │
//! │  │ structural lock  │   │ │ lock + condvar   │   │ │ device lock    │ │
//! │  └──────────────────┘   │ └──────────────────┘   │ └────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A read returns the most recent completed write to that block, or the
//!   device contents if the block was never written through the cache
//! - At most one device operation is in flight at any time
//! - Dirty, in-flight and waited-on entries are never evicted
//! - `sync` returns only after every block dirty at the time of the call
//!   has been written, or reports the first write failure

mod buffer_cache;
mod config;
mod directory;
mod entry;
mod metrics;
mod proptest;
mod scheduler;

pub use buffer_cache::BufferCache;
pub use config::{
    CacheConfig, DEFAULT_MAX_LOAD_BURST, DEFAULT_MEMORY_BLOCKS, DEFAULT_SCHEDULER_THREAD_NAME,
};
pub use directory::{CacheDirectory, Lookup, PinnedEntry};
pub use entry::{BlockEntry, BlockState};
pub use metrics::{CacheMetrics, CacheStats, LatencyTracker};
pub use scheduler::{WorkKind, WorkSignal};
