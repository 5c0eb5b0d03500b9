//! bcache Load Harness
//!
//! Hammers a buffer cache from many threads and checks that every read is
//! coherent, then syncs, verifies what reached the device and prints the
//! cache statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          bcache harness                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workers    │───▶│ BufferCache  │───▶│   Device     │       │
//! │  │ (N threads)  │    │ + scheduler  │    │ (RAM/image)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every block written carries a stamp (block number, writer, sequence)
//! repeated across the whole payload. Workers only write blocks they own,
//! so each knows exactly what its own blocks must contain; blocks owned by
//! others are checked for being a single untorn stamp.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bcache::device::{MemoryDevice, StorageDevice};
use bcache::{BufferCache, CacheConfig, BLOCK_SIZE};

// =============================================================================
// CLI Arguments
// =============================================================================

/// bcache - concurrent write-back buffer cache load harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(long, env = "BCACHE_THREADS", default_value = "8")]
    threads: usize,

    /// Operations per worker
    #[arg(long, env = "BCACHE_OPS", default_value = "10000")]
    ops: usize,

    /// Blocks touched by the workload (must not exceed --disk-blocks)
    #[arg(long, env = "BCACHE_WORKING_SET", default_value = "256")]
    working_set: u64,

    /// Blocks on the device
    #[arg(long, env = "BCACHE_DISK_BLOCKS", default_value = "1024")]
    disk_blocks: u64,

    /// Cache capacity in blocks (overrides the config file)
    #[arg(long, env = "BCACHE_MEMORY_BLOCKS")]
    memory_blocks: Option<usize>,

    /// Percentage of operations that are writes
    #[arg(long, env = "BCACHE_WRITE_PERCENT", default_value = "30")]
    write_percent: u8,

    /// Each worker syncs after this many operations (0 = never)
    #[arg(long, env = "BCACHE_SYNC_EVERY", default_value = "0")]
    sync_every: usize,

    /// Simulated device latency per operation in microseconds
    #[arg(long, env = "BCACHE_LATENCY_US", default_value = "0")]
    latency_us: u64,

    /// Workload seed
    #[arg(long, env = "BCACHE_SEED", default_value = "42")]
    seed: u64,

    /// Back the cache with a freshly created image file instead of RAM
    #[arg(long, env = "BCACHE_IMAGE")]
    image: Option<PathBuf>,

    /// Cache configuration (JSON)
    #[arg(long, env = "BCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Print final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    if args.threads == 0 {
        bail!("--threads must be > 0");
    }
    if args.working_set == 0 || args.working_set > args.disk_blocks {
        bail!(
            "--working-set must be in 1..={} (got {})",
            args.disk_blocks,
            args.working_set
        );
    }
    if args.write_percent > 100 {
        bail!("--write-percent must be <= 100");
    }

    let config = load_config(&args)?;

    info!("Starting bcache harness");
    info!("  Threads: {}", args.threads);
    info!("  Ops per thread: {}", args.ops);
    info!("  Working set: {} blocks", args.working_set);
    info!(
        "  Memory / disk: {} / {} blocks",
        config.memory_blocks, args.disk_blocks
    );
    info!("  Seed: {}", args.seed);

    let device = open_device(&args)?;
    let cache = BufferCache::with_config(device, config).context("creating buffer cache")?;

    let started = Instant::now();
    let outcomes = run_workers(&cache, &args)?;
    let elapsed = started.elapsed();

    let mut expected = HashMap::new();
    let mut violations = 0u64;
    for outcome in outcomes {
        violations += outcome.violations;
        expected.extend(outcome.owned);
    }

    cache.sync().context("final sync")?;
    violations += verify(&cache, &expected)?;

    let stats = cache.stats();
    cache.shutdown().context("shutting down cache")?;

    info!(
        "Workload finished in {:.2?} ({:.0} ops/s)",
        elapsed,
        ops_per_second(args.threads, args.ops, elapsed)
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("reads={} writes={} syncs={}", stats.reads, stats.writes, stats.syncs);
        println!(
            "hits={} misses={} hit_ratio={:.3} evictions={}",
            stats.hits, stats.misses, stats.hit_ratio, stats.evictions
        );
        println!(
            "device loads={} flushes={} read_latency_us={} write_latency_us={}",
            stats.loads, stats.flushes, stats.device_read_latency_us, stats.device_write_latency_us
        );
        println!(
            "resident={}/{} dirty={}",
            stats.resident, stats.memory_blocks, stats.dirty
        );
    }

    if violations > 0 {
        error!(violations, "Coherence violations detected");
        bail!("{} coherence violation(s)", violations);
    }

    info!("bcache harness completed");
    Ok(())
}

/// Throughput of the whole run; computed in floating point so huge
/// `--threads`/`--ops` values cannot overflow
fn ops_per_second(threads: usize, ops: usize, elapsed: Duration) -> f64 {
    threads as f64 * ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
}

/// Initialize logging
fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config: CacheConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CacheConfig::default(),
    };
    if let Some(memory_blocks) = args.memory_blocks {
        config.memory_blocks = memory_blocks;
    }
    config.validate()?;
    Ok(config)
}

fn open_device(args: &Args) -> anyhow::Result<Box<dyn StorageDevice>> {
    let latency = Duration::from_micros(args.latency_us);

    if let Some(path) = &args.image {
        #[cfg(unix)]
        {
            if args.latency_us > 0 {
                warn!("--latency-us is ignored for image devices");
            }
            let device = bcache::device::FileDevice::create(path, args.disk_blocks)
                .with_context(|| format!("creating image {}", path.display()))?;
            info!("  Device: image {}", path.display());
            return Ok(Box::new(device));
        }
        #[cfg(not(unix))]
        bail!("--image is only supported on unix ({})", path.display());
    }

    let mut device = MemoryDevice::new(args.disk_blocks)?;
    if !latency.is_zero() {
        device = device.with_latency(latency);
    }
    info!("  Device: memory");
    Ok(Box::new(device))
}

// =============================================================================
// Workload
// =============================================================================

/// SplitMix64; deterministic per (seed, worker)
struct Mixer(u64);

impl Mixer {
    fn new(seed: u64, worker: usize) -> Self {
        Self(seed ^ (worker as u64).wrapping_mul(0xA076_1D64_78BD_642F))
    }

    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Fill `buf` with `(block, stamp)` records
fn stamp(buf: &mut [u8; BLOCK_SIZE], block: u64, stamp: u64) {
    for record in buf.chunks_exact_mut(16) {
        record[..8].copy_from_slice(&block.to_le_bytes());
        record[8..].copy_from_slice(&stamp.to_le_bytes());
    }
}

/// Stamp carried by `buf`: `Some(0)` for a never-written block, `None` if torn
fn read_stamp(buf: &[u8; BLOCK_SIZE], block: u64) -> Option<u64> {
    if buf.iter().all(|&b| b == 0) {
        return Some(0);
    }
    let first = &buf[..16];
    if buf.chunks_exact(16).any(|record| record != first) {
        return None;
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&first[..8]);
    if u64::from_le_bytes(word) != block {
        return None;
    }
    word.copy_from_slice(&first[8..]);
    Some(u64::from_le_bytes(word))
}

struct WorkerOutcome {
    /// Last stamp written to each owned block
    owned: HashMap<u64, u64>,
    violations: u64,
}

fn run_workers(
    cache: &BufferCache,
    args: &Args,
) -> anyhow::Result<Vec<WorkerOutcome>> {
    let results = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| scope.spawn(move |_| run_worker(cache, args, worker)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    })
    .map_err(|_| anyhow::anyhow!("worker scope panicked"))?;

    results
        .into_iter()
        .map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("worker thread panicked")),
        })
        .collect()
}

fn run_worker(cache: &BufferCache, args: &Args, worker: usize) -> anyhow::Result<WorkerOutcome> {
    let threads = args.threads as u64;
    let mut rng = Mixer::new(args.seed, worker);
    let mut owned: HashMap<u64, u64> = HashMap::new();
    let mut violations = 0u64;
    let mut sequence = 0u64;
    let mut buf = [0u8; BLOCK_SIZE];

    for op in 0..args.ops {
        let block = rng.below(args.working_set);
        let owner = block % threads;
        let is_write = rng.below(100) < u64::from(args.write_percent);

        if is_write && owner == worker as u64 {
            sequence += 1;
            let value = ((worker as u64 + 1) << 32) | sequence;
            stamp(&mut buf, block, value);
            cache
                .write(block, &buf)
                .with_context(|| format!("worker {} writing block {}", worker, block))?;
            owned.insert(block, value);
        } else {
            cache
                .read(block, &mut buf)
                .with_context(|| format!("worker {} reading block {}", worker, block))?;
            match read_stamp(&buf, block) {
                None => {
                    warn!(worker, block, "Torn or misplaced block");
                    violations += 1;
                }
                Some(found) if owner == worker as u64 => {
                    let expected = owned.get(&block).copied().unwrap_or(0);
                    if found != expected {
                        warn!(worker, block, found, expected, "Stale read of own block");
                        violations += 1;
                    }
                }
                Some(_) => {}
            }
        }

        if args.sync_every > 0 && (op + 1) % args.sync_every == 0 {
            cache.sync().context("periodic sync")?;
        }
    }

    debug!(worker, written = owned.len(), violations, "Worker finished");
    Ok(WorkerOutcome { owned, violations })
}

/// Re-read every written block after the final sync
fn verify(cache: &BufferCache, expected: &HashMap<u64, u64>) -> anyhow::Result<u64> {
    let mut buf = [0u8; BLOCK_SIZE];
    let mut violations = 0;
    for (&block, &value) in expected {
        cache.read(block, &mut buf)?;
        if read_stamp(&buf, block) != Some(value) {
            warn!(block, "Final contents do not match last write");
            violations += 1;
        }
    }
    info!(blocks = expected.len(), violations, "Verified final contents");
    Ok(violations)
}

// =============================================================================
// Tests
// =============================================================================
