//! Cache Metrics Collection
//!
//! Counters for the buffer cache. `reads` and `writes` count completed
//! client calls; the rest describe what the cache and scheduler did to
//! serve them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Client operations
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,

    // Directory
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,

    // Scheduler / device
    loads: AtomicU64,
    flushes: AtomicU64,
    load_failures: AtomicU64,
    flush_failures: AtomicU64,

    // Device latencies (microseconds, exponential moving average)
    device_read_latency_us: AtomicU64,
    device_write_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_load(&self, latency: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.device_read_latency_us, latency);
    }

    pub fn record_flush(&self, latency: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.device_write_latency_us, latency);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed `read` calls
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Completed `write` calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn device_read_latency(&self) -> Duration {
        Duration::from_micros(self.device_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn device_write_latency(&self) -> Duration {
        Duration::from_micros(self.device_write_latency_us.load(Ordering::Relaxed))
    }

    /// Snapshot of the counters; residency fields are filled in by the cache
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            reads: self.reads(),
            writes: self.writes(),
            syncs: self.syncs.load(Ordering::Relaxed),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            loads: self.loads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            device_read_latency_us: self.device_read_latency().as_micros() as u64,
            device_write_latency_us: self.device_write_latency().as_micros() as u64,
            ..CacheStats::default()
        }
    }
}

/// Point-in-time view of a buffer cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Configured capacity in blocks
    pub memory_blocks: usize,
    /// Blocks on the underlying device
    pub disk_blocks: u64,
    /// Entries currently resident
    pub resident: usize,
    /// Resident entries awaiting or undergoing a flush
    pub dirty: usize,

    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,

    pub loads: u64,
    pub flushes: u64,
    pub load_failures: u64,
    pub flush_failures: u64,
    pub device_read_latency_us: u64,
    pub device_write_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
