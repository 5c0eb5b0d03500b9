//! Property-Based Tests for the Buffer Cache
//!
//! Drives a cache with random operation sequences and checks it against a
//! plain map of the last value written to each block.
//!
//! # Test Properties
//!
//! 1. **Read-your-writes**: a read returns the last write, or zeros
//! 2. **Durability**: after `sync` the device holds exactly the model
//! 3. **Bounded residency**: with all blocks clean, residency never exceeds capacity
//! 4. **Exact counters**: read/write counts equal the calls made

#![cfg(test)]

use std::collections::HashMap;

use proptest::prelude::*;

use super::{BlockState, BufferCache};
use crate::device::MemoryDevice;
use crate::BLOCK_SIZE;

const DISK_BLOCKS: u64 = 12;

#[derive(Debug, Clone)]
enum Op {
    Read(u64),
    Write(u64, u8),
    Sync,
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..DISK_BLOCKS).prop_map(Op::Read),
        4 => (0..DISK_BLOCKS, any::<u8>()).prop_map(|(b, v)| Op::Write(b, v)),
        1 => Just(Op::Sync),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..80)
}

fn capacity_strategy() -> impl Strategy<Value = usize> {
    1usize..=6
}

// =============================================================================
// Model Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Reads always observe the model's value
    #[test]
    fn prop_reads_match_model(capacity in capacity_strategy(), ops in ops_strategy()) {
        let cache = BufferCache::create(MemoryDevice::new(DISK_BLOCKS).unwrap(), capacity).unwrap();
        let mut model: HashMap<u64, u8> = HashMap::new();
        let mut buf = [0u8; BLOCK_SIZE];

        for op in &ops {
            match *op {
                Op::Read(block) => {
                    cache.read(block, &mut buf).unwrap();
                    let expected = model.get(&block).copied().unwrap_or(0);
                    prop_assert!(buf.iter().all(|&b| b == expected));
                }
                Op::Write(block, value) => {
                    cache.write(block, &[value; BLOCK_SIZE]).unwrap();
                    model.insert(block, value);
                }
                Op::Sync => cache.sync().unwrap(),
            }
        }
    }

    /// After a final sync the device matches the model block for block
    #[test]
    fn prop_sync_makes_model_durable(capacity in capacity_strategy(), ops in ops_strategy()) {
        let device = MemoryDevice::new(DISK_BLOCKS).unwrap();
        let control = device.control();
        let cache = BufferCache::create(device, capacity).unwrap();
        let mut model: HashMap<u64, u8> = HashMap::new();
        let mut buf = [0u8; BLOCK_SIZE];

        for op in &ops {
            match *op {
                Op::Read(block) => cache.read(block, &mut buf).unwrap(),
                Op::Write(block, value) => {
                    cache.write(block, &[value; BLOCK_SIZE]).unwrap();
                    model.insert(block, value);
                }
                Op::Sync => cache.sync().unwrap(),
            }
        }
        cache.sync().unwrap();

        for block in 0..DISK_BLOCKS {
            let expected = model.get(&block).copied().unwrap_or(0);
            let contents = control.contents(block).unwrap();
            prop_assert!(contents.iter().all(|&b| b == expected));
            if let Some(state) = cache.state_of(block) {
                prop_assert!(!state.is_dirty());
            }
        }
    }

    /// Once everything is clean, one more miss brings residency back under the cap
    #[test]
    fn prop_clean_cache_respects_capacity(capacity in capacity_strategy(), ops in ops_strategy()) {
        let cache = BufferCache::create(MemoryDevice::new(DISK_BLOCKS).unwrap(), capacity).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];

        for op in &ops {
            match *op {
                Op::Read(block) => cache.read(block, &mut buf).unwrap(),
                Op::Write(block, value) => cache.write(block, &[value; BLOCK_SIZE]).unwrap(),
                Op::Sync => cache.sync().unwrap(),
            }
        }
        cache.sync().unwrap();

        // Pick a block that is not resident so the lookup inserts and evicts
        let absent = (0..DISK_BLOCKS).find(|&b| cache.state_of(b).is_none());
        if let Some(block) = absent {
            cache.read(block, &mut buf).unwrap();
            prop_assert!(cache.stats().resident <= capacity);
            prop_assert_eq!(cache.state_of(block), Some(BlockState::Ready));
        }
    }

    /// Counters equal the number of calls made
    #[test]
    fn prop_counters_are_exact(ops in ops_strategy()) {
        let cache = BufferCache::create(MemoryDevice::new(DISK_BLOCKS).unwrap(), 3).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        let (mut reads, mut writes) = (0u64, 0u64);

        for op in &ops {
            match *op {
                Op::Read(block) => {
                    cache.read(block, &mut buf).unwrap();
                    reads += 1;
                }
                Op::Write(block, value) => {
                    cache.write(block, &[value; BLOCK_SIZE]).unwrap();
                    writes += 1;
                }
                Op::Sync => cache.sync().unwrap(),
            }
        }

        prop_assert_eq!(cache.read_count(), reads);
        prop_assert_eq!(cache.write_count(), writes);
        let stats = cache.stats();
        prop_assert_eq!(stats.hits + stats.misses, reads);
    }
}
