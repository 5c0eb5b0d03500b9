//! Buffer cache configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default capacity in blocks (256KB of payload)
pub const DEFAULT_MEMORY_BLOCKS: usize = 64;

/// Default name of the scheduler thread
pub const DEFAULT_SCHEDULER_THREAD_NAME: &str = "bcache-io";

/// Default number of consecutive loads serviced while flushes wait
pub const DEFAULT_MAX_LOAD_BURST: usize = 16;

/// Configuration for a [`BufferCache`](super::BufferCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident blocks before eviction kicks in
    pub memory_blocks: usize,

    /// Name given to the background I/O thread
    pub scheduler_thread_name: String,

    /// Loads are serviced ahead of flushes; after this many loads in a row
    /// one pending flush is let through so write-back is not starved
    pub max_load_burst: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_blocks: DEFAULT_MEMORY_BLOCKS,
            scheduler_thread_name: DEFAULT_SCHEDULER_THREAD_NAME.to_string(),
            max_load_burst: DEFAULT_MAX_LOAD_BURST,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given capacity
    pub fn with_memory_blocks(memory_blocks: usize) -> Self {
        Self {
            memory_blocks,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_blocks == 0 {
            return Err(Error::Config("memory_blocks must be > 0".into()));
        }
        if self.scheduler_thread_name.is_empty() {
            return Err(Error::Config(
                "scheduler_thread_name must not be empty".into(),
            ));
        }
        if self.max_load_burst == 0 {
            return Err(Error::Config("max_load_burst must be > 0".into()));
        }
        Ok(())
    }
}
