//! bcache Integration Tests
//!
//! Exercises the public cache API from many threads:
//! - Read/write coherence
//! - Sync as a durability barrier
//! - Device serialization
//! - Eviction
//! - Device failures
//! - Shutdown

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use bcache::device::{DeviceControl, MemoryDevice, ProbedDevice};
use bcache::{BlockState, BufferCache, DeviceOp, Error, BLOCK_SIZE};

fn block_of(value: u8) -> [u8; BLOCK_SIZE] {
    [value; BLOCK_SIZE]
}

fn memory_cache(disk_blocks: u64, memory_blocks: usize) -> (BufferCache<MemoryDevice>, DeviceControl) {
    let device = MemoryDevice::new(disk_blocks).unwrap();
    let control = device.control();
    (BufferCache::create(device, memory_blocks).unwrap(), control)
}

/// Small deterministic generator for workload shapes
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

// =============================================================================
// Coherence
// =============================================================================

mod coherence_tests {
    use super::*;

    #[test]
    fn test_write_then_read_same_thread() {
        let (cache, _) = memory_cache(64, 8);
        cache.write(10, &block_of(0x42)).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        cache.read(10, &mut out).unwrap();
        assert_eq!(out, block_of(0x42));
    }

    #[test]
    fn test_read_returns_device_contents_when_never_written() {
        let (cache, control) = memory_cache(64, 8);
        control.poke(20, &block_of(0x11)).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        cache.read(20, &mut out).unwrap();
        assert_eq!(out, block_of(0x11));
    }

    #[test]
    fn test_write_visible_to_other_thread() {
        let (cache, _) = memory_cache(64, 8);
        let cache = Arc::new(cache);
        let barrier = Arc::new(Barrier::new(2));

        let writer = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                cache.write(3, &block_of(0x77)).unwrap();
                barrier.wait();
            })
        };

        barrier.wait();
        let mut out = [0u8; BLOCK_SIZE];
        cache.read(3, &mut out).unwrap();
        assert_eq!(out, block_of(0x77));
        writer.join().unwrap();
    }

    #[test]
    fn test_last_write_wins() {
        let (cache, control) = memory_cache(16, 4);
        for value in 1..=20u8 {
            cache.write(5, &block_of(value)).unwrap();
        }
        cache.sync().unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        cache.read(5, &mut out).unwrap();
        assert_eq!(out, block_of(20));
        assert_eq!(control.contents(5).unwrap(), block_of(20).to_vec());
    }

    #[test]
    fn test_round_trip_after_sync() {
        let (cache, control) = memory_cache(128, 16);
        for block in 0..64u64 {
            cache.write(block, &block_of(block as u8)).unwrap();
        }
        cache.sync().unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        for block in 0..64u64 {
            cache.read(block, &mut out).unwrap();
            assert_eq!(out, block_of(block as u8), "block {}", block);
            assert_eq!(control.contents(block).unwrap(), block_of(block as u8).to_vec());
        }
    }
}

// =============================================================================
// Sync
// =============================================================================

mod sync_tests {
    use super::*;

    #[test]
    fn test_sync_flushes_every_dirty_block() {
        let device = MemoryDevice::new(32).unwrap().with_latency(Duration::from_millis(1));
        let control = device.control();
        let cache = BufferCache::create(device, 32).unwrap();

        for block in 0..16u64 {
            cache.write(block, &block_of(0xA0 + block as u8)).unwrap();
        }
        cache.sync().unwrap();

        for block in 0..16u64 {
            assert_eq!(
                control.contents(block).unwrap(),
                block_of(0xA0 + block as u8).to_vec()
            );
            assert_matches!(cache.state_of(block), Some(BlockState::Ready));
        }
        assert_eq!(cache.stats().dirty, 0);
    }

    #[test]
    fn test_sync_covers_writes_from_other_threads() {
        let (cache, control) = memory_cache(64, 64);
        let cache = Arc::new(cache);

        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..8u64 {
                        let block = t * 8 + i;
                        cache.write(block, &block_of(block as u8 + 1)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        cache.sync().unwrap();
        for block in 0..32u64 {
            assert_eq!(control.contents(block).unwrap()[0], block as u8 + 1);
        }
    }

    #[test]
    fn test_sync_does_not_wait_for_loads() {
        let device = MemoryDevice::new(16).unwrap().with_latency(Duration::from_millis(300));
        let cache = BufferCache::create(device, 8).unwrap();

        crossbeam::scope(|scope| {
            scope.spawn(|_| {
                let mut buf = [0u8; BLOCK_SIZE];
                cache.read(9, &mut buf).unwrap();
            });
            while cache.state_of(9) != Some(BlockState::Reading) {
                thread::yield_now();
            }

            let started = Instant::now();
            cache.sync().unwrap();
            let elapsed = started.elapsed();
            assert!(
                elapsed < Duration::from_millis(150),
                "sync took {:?} with only a load in flight",
                elapsed
            );
        })
        .unwrap();

        assert_eq!(cache.read_count(), 1);
    }

    #[test]
    fn test_sync_does_not_wait_for_later_flushes() {
        let device = MemoryDevice::new(16).unwrap().with_latency(Duration::from_millis(200));
        let control = device.control();
        let cache = BufferCache::create(device, 8).unwrap();

        cache.write(1, &block_of(1)).unwrap();
        while cache.state_of(1) != Some(BlockState::Writing) {
            thread::yield_now();
        }

        crossbeam::scope(|scope| {
            let syncer = scope.spawn(|_| {
                cache.sync().unwrap();
                control.counters().writes()
            });
            thread::sleep(Duration::from_millis(50));

            // Waits out the first flush, then queues a second one
            cache.write(1, &block_of(2)).unwrap();

            // Only the flush in flight at the time of the sync was awaited
            assert_eq!(syncer.join().unwrap(), 1);
        })
        .unwrap();

        cache.sync().unwrap();
        assert_eq!(control.contents(1).unwrap()[0], 2);
        assert_eq!(control.counters().writes(), 2);
    }

    #[test]
    fn test_concurrent_syncs_all_return() {
        let device = MemoryDevice::new(64).unwrap().with_latency(Duration::from_micros(200));
        let cache = Arc::new(BufferCache::create(device, 16).unwrap());

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..20u64 {
                        cache.write((t * 20 + i) % 64, &block_of(t as u8)).unwrap();
                        if i % 5 == 0 {
                            cache.sync().unwrap();
                        }
                    }
                    cache.sync().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.stats().dirty, 0);
    }
}

// =============================================================================
// Device Serialization and Counters
// =============================================================================

mod device_tests {
    use super::*;

    #[test]
    fn test_at_most_one_device_operation_in_flight() {
        let device = ProbedDevice::new(
            MemoryDevice::new(128)
                .unwrap()
                .with_latency(Duration::from_micros(100)),
        );
        let probe = device.probe();
        let cache = BufferCache::create(device, 16).unwrap();

        crossbeam::scope(|scope| {
            for t in 0..16u64 {
                let cache = &cache;
                scope.spawn(move |_| {
                    let mut rng = Lcg(t + 1);
                    let mut buf = [0u8; BLOCK_SIZE];
                    for _ in 0..100 {
                        let block = rng.next() % 128;
                        match rng.next() % 10 {
                            0 => cache.sync().unwrap(),
                            1..=4 => cache.write(block, &block_of(t as u8)).unwrap(),
                            _ => cache.read(block, &mut buf).unwrap(),
                        }
                    }
                });
            }
        })
        .unwrap();
        cache.sync().unwrap();

        assert!(probe.operations() > 0);
        assert_eq!(probe.max_in_flight(), 1);
        assert_eq!(probe.in_flight(), 0);
    }

    #[test]
    fn test_counters_exact_under_concurrency() {
        let (cache, _) = memory_cache(256, 32);
        let threads = 12u64;
        let ops = 250u64;

        crossbeam::scope(|scope| {
            for t in 0..threads {
                let cache = &cache;
                scope.spawn(move |_| {
                    let mut rng = Lcg(t * 31 + 7);
                    let mut buf = [0u8; BLOCK_SIZE];
                    for i in 0..ops {
                        let block = rng.next() % 256;
                        if i % 2 == 0 {
                            cache.write(block, &block_of(i as u8)).unwrap();
                        } else {
                            cache.read(block, &mut buf).unwrap();
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(cache.read_count(), threads * ops / 2);
        assert_eq!(cache.write_count(), threads * ops / 2);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, threads * ops / 2);
    }

    #[test]
    fn test_concurrent_readers_share_one_load() {
        let device = MemoryDevice::new(16).unwrap().with_latency(Duration::from_millis(100));
        let control = device.control();
        control.poke(5, &block_of(0x3C)).unwrap();
        let cache = BufferCache::create(device, 8).unwrap();
        let barrier = Barrier::new(8);

        crossbeam::scope(|scope| {
            for _ in 0..8 {
                let (cache, barrier) = (&cache, &barrier);
                scope.spawn(move |_| {
                    barrier.wait();
                    let mut buf = [0u8; BLOCK_SIZE];
                    cache.read(5, &mut buf).unwrap();
                    assert_eq!(buf, block_of(0x3C));
                });
            }
        })
        .unwrap();

        assert_eq!(control.counters().reads(), 1);
        assert_eq!(cache.read_count(), 8);
        // Every reader waited on the device, so none of them is a hit
        let stats = cache.stats();
        assert_eq!(stats.misses, 8);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_repeated_reads_hit_the_cache() {
        let (cache, control) = memory_cache(16, 16);
        let mut buf = [0u8; BLOCK_SIZE];
        for _ in 0..10 {
            for block in 0..8u64 {
                cache.read(block, &mut buf).unwrap();
            }
        }
        assert_eq!(control.counters().reads(), 8);
        assert_eq!(cache.stats().misses, 8);
        assert_eq!(cache.stats().hits, 72);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_backed_cache_persists() {
        use bcache::device::FileDevice;

        let path = std::env::temp_dir().join(format!("bcache-it-{}.img", std::process::id()));
        {
            let cache = BufferCache::create(FileDevice::create(&path, 16).unwrap(), 4).unwrap();
            for block in 0..16u64 {
                cache.write(block, &block_of(block as u8 + 100)).unwrap();
            }
            cache.shutdown().unwrap();
        }

        let cache = BufferCache::create(FileDevice::open(&path).unwrap(), 4).unwrap();
        assert_eq!(cache.disk_block_count(), 16);
        let mut out = [0u8; BLOCK_SIZE];
        for block in 0..16u64 {
            cache.read(block, &mut out).unwrap();
            assert_eq!(out, block_of(block as u8 + 100));
        }
        drop(cache);
        let _ = std::fs::remove_file(&path);
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    #[test]
    fn test_one_more_block_evicts_exactly_one() {
        let (cache, _) = memory_cache(64, 4);
        for block in 0..4u64 {
            cache.write(block, &block_of(block as u8 + 1)).unwrap();
        }
        cache.sync().unwrap();
        assert_eq!(cache.stats().evictions, 0);

        cache.write(4, &block_of(5)).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.resident, 4);
        // Least recently used goes first
        assert_eq!(cache.state_of(0), None);

        // The evicted block comes back from the device intact
        let mut out = [0u8; BLOCK_SIZE];
        cache.read(0, &mut out).unwrap();
        assert_eq!(out, block_of(1));
    }

    #[test]
    fn test_dirty_blocks_are_never_evicted() {
        let (cache, control) = memory_cache(64, 2);
        for block in 0..6u64 {
            control.fail_writes_of(block);
        }
        for block in 0..6u64 {
            cache.write(block, &block_of(block as u8 + 1)).unwrap();
        }

        // Nothing can be written back, so nothing may leave the cache
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().resident, 6);
        let mut out = [0u8; BLOCK_SIZE];
        for block in 0..6u64 {
            cache.read(block, &mut out).unwrap();
            assert_eq!(out, block_of(block as u8 + 1));
        }

        // Let every pending write-back fail before healing the device
        assert!(cache.sync().is_err());
        for block in 0..6u64 {
            control.heal(block);
        }
        cache.sync().unwrap();

        // Once clean, the next miss shrinks residency back to capacity
        cache.read(10, &mut out).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.resident, 2);
        assert_eq!(stats.evictions, 5);
    }

    #[test]
    fn test_working_set_larger_than_cache() {
        let (cache, control) = memory_cache(256, 8);
        for round in 0..3u8 {
            for block in 0..64u64 {
                cache.write(block, &block_of(round * 64 + block as u8)).unwrap();
            }
        }
        cache.sync().unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        for block in 0..64u64 {
            cache.read(block, &mut out).unwrap();
            assert_eq!(out, block_of(128 + block as u8));
            assert_eq!(control.contents(block).unwrap()[0], 128 + block as u8);
        }
        assert!(cache.stats().evictions > 0);
    }
}

// =============================================================================
// Device Failures
// =============================================================================

mod failure_tests {
    use super::*;

    #[test]
    fn test_load_failure_reaches_every_waiter() {
        let device = MemoryDevice::new(16).unwrap().with_latency(Duration::from_millis(100));
        let control = device.control();
        control.fail_reads_of(3);
        let cache = BufferCache::create(device, 8).unwrap();
        let barrier = Barrier::new(4);

        crossbeam::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let (cache, barrier) = (&cache, &barrier);
                    scope.spawn(move |_| {
                        barrier.wait();
                        let mut buf = [0u8; BLOCK_SIZE];
                        cache.read(3, &mut buf)
                    })
                })
                .collect();
            for handle in handles {
                let result = handle.join().unwrap();
                assert_matches!(
                    result,
                    Err(Error::DeviceFailure {
                        block: 3,
                        op: DeviceOp::Read,
                        ..
                    })
                );
            }
        })
        .unwrap();

        assert_eq!(cache.read_count(), 0);
        assert_matches!(cache.state_of(3), Some(BlockState::Free));
        // All four readers waited on the same failed load
        assert_eq!(cache.stats().load_failures, 1);
        assert_eq!(control.counters().failures(), 1);

        control.heal(3);
        let mut buf = [0u8; BLOCK_SIZE];
        cache.read(3, &mut buf).unwrap();
        assert_eq!(cache.read_count(), 1);
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[test]
    fn test_flush_failure_reported_by_sync() {
        let (cache, control) = memory_cache(16, 8);
        control.fail_writes_of(7);

        cache.write(6, &block_of(6)).unwrap();
        cache.write(7, &block_of(7)).unwrap();

        assert_matches!(
            cache.sync(),
            Err(Error::DeviceFailure {
                block: 7,
                op: DeviceOp::Write,
                ..
            })
        );
        // The healthy block still made it
        assert_eq!(control.contents(6).unwrap()[0], 6);
        assert_matches!(cache.state_of(7), Some(BlockState::Dirty));

        control.heal(7);
        cache.sync().unwrap();
        assert_eq!(control.contents(7).unwrap()[0], 7);
    }

    #[test]
    fn test_write_after_failed_flush_is_written_back() {
        let (cache, control) = memory_cache(16, 8);
        control.fail_writes_of(2);
        cache.write(2, &block_of(1)).unwrap();
        assert!(cache.sync().is_err());

        control.heal(2);
        cache.write(2, &block_of(9)).unwrap();
        cache.sync().unwrap();
        assert_eq!(control.contents(2).unwrap()[0], 9);
    }
}

// =============================================================================
// Shutdown
// =============================================================================

mod shutdown_tests {
    use super::*;

    #[test]
    fn test_shutdown_drains_pending_writes() {
        let device = MemoryDevice::new(32).unwrap().with_latency(Duration::from_millis(1));
        let control = device.control();
        let cache = BufferCache::create(device, 32).unwrap();
        for block in 0..10u64 {
            cache.write(block, &block_of(0xEE)).unwrap();
        }

        cache.shutdown().unwrap();
        for block in 0..10u64 {
            assert_eq!(control.contents(block).unwrap()[0], 0xEE);
        }
    }

    #[test]
    fn test_operations_after_shutdown_fail() {
        let (cache, _) = memory_cache(8, 4);
        cache.shutdown().unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        assert_matches!(cache.read(0, &mut buf), Err(Error::ShutDown));
        assert_matches!(cache.write(0, &buf), Err(Error::ShutDown));
        assert_matches!(cache.sync(), Err(Error::ShutDown));
        assert_matches!(cache.shutdown(), Ok(()));
    }

    #[test]
    fn test_drop_flushes_dirty_blocks() {
        let (cache, control) = memory_cache(8, 4);
        cache.write(1, &block_of(0x5C)).unwrap();
        drop(cache);
        assert_eq!(control.contents(1).unwrap()[0], 0x5C);
    }

    #[test]
    fn test_shutdown_reports_blocks_it_could_not_flush() {
        let (cache, control) = memory_cache(8, 4);
        control.fail_writes_of(0);
        control.fail_writes_of(1);
        cache.write(0, &block_of(1)).unwrap();
        cache.write(1, &block_of(1)).unwrap();
        cache.write(2, &block_of(1)).unwrap();

        assert_matches!(cache.shutdown(), Err(Error::DirtyOnShutdown { blocks: 2 }));
        assert_eq!(control.contents(2).unwrap()[0], 1);
    }
}

// =============================================================================
// Stress
// =============================================================================

mod stress_tests {
    use super::*;

    /// Each thread owns the blocks congruent to its index and must always
    /// read back its own last write; everyone else's blocks must be untorn.
    #[test]
    fn test_fifty_threads_randomized() {
        const THREADS: u64 = 50;
        const BLOCKS: u64 = 200;
        const OPS: u64 = 200;

        let device = ProbedDevice::new(MemoryDevice::new(BLOCKS).unwrap());
        let probe = device.probe();
        let cache = BufferCache::create(device, 24).unwrap();

        let finals = crossbeam::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let cache = &cache;
                    scope.spawn(move |_| {
                        let mut rng = Lcg(t * 7919 + 1);
                        let mut last = std::collections::HashMap::new();
                        let mut buf = [0u8; BLOCK_SIZE];
                        for i in 0..OPS {
                            let block = rng.next() % BLOCKS;
                            let mine = block % THREADS == t;
                            match rng.next() % 20 {
                                0 => cache.sync().unwrap(),
                                1..=8 if mine => {
                                    let value = (i % 251) as u8 + 1;
                                    cache.write(block, &block_of(value)).unwrap();
                                    last.insert(block, value);
                                }
                                _ => {
                                    cache.read(block, &mut buf).unwrap();
                                    assert!(
                                        buf.iter().all(|&b| b == buf[0]),
                                        "torn read of block {}",
                                        block
                                    );
                                    if mine {
                                        let expected = last.get(&block).copied().unwrap_or(0);
                                        assert_eq!(buf[0], expected, "stale read of block {}", block);
                                    }
                                }
                            }
                        }
                        last
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        cache.sync().unwrap();
        assert_eq!(probe.max_in_flight(), 1);

        let mut out = [0u8; BLOCK_SIZE];
        for last in finals {
            for (block, value) in last {
                cache.read(block, &mut out).unwrap();
                assert_eq!(out, block_of(value));
            }
        }
        assert_eq!(cache.stats().dirty, 0);
    }
}
