#![forbid(unsafe_code)]
//! Multithreaded workload driver for the block cache.
//!
//! [`run_workload`] builds a seeded in-memory store behind a simulated-latency
//! device, puts a [`BlockCache`] in front of it, and lets a pool of workers
//! issue Zipf-distributed reads and writes. After the workers join it checks
//! the cache's structural invariants, then pushes every resident block out
//! through ordinary misses and compares the store with what the cache held.
//! Counters from every layer go into the report.

pub mod rng;

pub use rng::{DeterministicRng, ZipfPicker};

use anyhow::{Context, Result, anyhow, bail};
use bc_block::{DiskStats, LatencyConfig, LatencyDevice, MemoryBlockDevice};
use bc_cache::{BlockCache, CacheConfig, CacheMetrics, SlotStatus};
use bc_error::CacheError;
use bc_types::{
    BlockNumber, BlockSize, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY,
    decode_block_value, encode_block_value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Workload parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Worker threads.
    pub threads: usize,
    /// Operations issued by each worker.
    pub ops_per_thread: usize,
    /// Cache slots.
    pub capacity: usize,
    /// Blocks on the backing store.
    pub block_count: u64,
    /// Bytes per block.
    pub block_size: u32,
    /// Upper bound of the simulated per-request disk latency.
    pub max_latency_us: u64,
    /// Base seed for the workers and the disk jitter.
    pub seed: u64,
    /// Share of operations that are writes, `0..=100`.
    pub write_percent: u8,
    /// Print one line per operation.
    pub verbose: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            ops_per_thread: 10,
            capacity: DEFAULT_CAPACITY,
            block_count: DEFAULT_BLOCK_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            max_latency_us: 100,
            seed: 0,
            write_percent: 50,
            verbose: false,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be greater than zero");
        }
        if self.capacity == 0 {
            bail!("capacity must be greater than zero");
        }
        if self.block_count == 0 {
            bail!("block_count must be greater than zero");
        }
        if self.write_percent > 100 {
            bail!("write_percent must be at most 100, got {}", self.write_percent);
        }
        BlockSize::new(self.block_size).context("invalid block_size")?;
        Ok(())
    }

    fn latency(&self) -> LatencyConfig {
        LatencyConfig {
            max_latency: Duration::from_micros(self.max_latency_us),
            seed: self.seed,
        }
    }
}

/// Post-run structural checks. Every field is `true` on a healthy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantChecks {
    /// The recency order is a permutation of every slot index.
    pub recency_permutation: bool,
    /// No more distinct blocks are resident than there are slots.
    pub capacity_bound: bool,
    /// No block is resident in two slots.
    pub unique_residency: bool,
    /// Every read returned a value some worker could have stored in that block.
    pub reads_matched_blocks: bool,
    /// Dirty blocks evicted at the end of the run reached the store intact.
    pub writebacks_persisted: bool,
}

impl InvariantChecks {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.recency_permutation
            && self.capacity_bound
            && self.unique_residency
            && self.reads_matched_blocks
            && self.writebacks_persisted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessReport {
    pub config: HarnessConfig,
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    /// Reads whose value did not belong to the requested block.
    pub foreign_reads: u64,
    pub duration_us: u64,
    pub hit_rate: f64,
    pub cache: CacheMetrics,
    pub disk: DiskStats,
    /// Whether the store had enough other blocks to evict every resident one.
    pub store_checked: bool,
    /// Writebacks caused by the end-of-run evictions.
    pub final_writebacks: u64,
    pub resident_blocks: Vec<u64>,
    pub checks: InvariantChecks,
    pub passed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    reads: u64,
    writes: u64,
    foreign_reads: u64,
}

type HarnessCache = BlockCache<LatencyDevice<MemoryBlockDevice>>;

#[derive(Debug, Clone, Copy)]
struct StoreCheck {
    checked: bool,
    writebacks: u64,
    persisted: bool,
}

/// Value worker `thread` writes into `block`.
#[must_use]
pub fn payload_value(thread: usize, block: u64, block_count: u64) -> u64 {
    u64::try_from(thread)
        .unwrap_or(u64::MAX)
        .wrapping_mul(block_count)
        .wrapping_add(block)
}

/// Whether `value` is what the seeded store or some worker put in `block`,
/// after truncation to the block size.
fn is_plausible(value: u64, block: u64, config: &HarnessConfig, block_size: BlockSize) -> bool {
    (0..config.threads).any(|thread| {
        let stored = payload_value(thread, block, config.block_count);
        decode_block_value(&encode_block_value(stored, block_size)) == value
    })
}

fn worker(
    cache: &HarnessCache,
    config: &HarnessConfig,
    block_size: BlockSize,
    thread: usize,
) -> std::result::Result<WorkerTally, CacheError> {
    let mut rng = DeterministicRng::for_worker(config.seed, thread);
    let picker = ZipfPicker::new(config.block_count);
    let mut tally = WorkerTally::default();

    for _ in 0..config.ops_per_thread {
        let block = picker.pick(&mut rng);
        if rng.chance_percent(config.write_percent) {
            let value = payload_value(thread, block, config.block_count);
            cache.write(BlockNumber(block), &encode_block_value(value, block_size))?;
            tally.writes += 1;
            if config.verbose {
                println!("Wrote block {block:2} in thread {thread}: {value:3}");
            }
        } else {
            let buf = cache.read(BlockNumber(block))?;
            let value = decode_block_value(buf.as_slice());
            tally.reads += 1;
            if !is_plausible(value, block, config, block_size) {
                tally.foreign_reads += 1;
                warn!(
                    target: "bc::harness",
                    event = "foreign_read",
                    thread,
                    block,
                    value
                );
            }
            if config.verbose {
                println!("Read  block {block:2} in thread {thread}: {value:3}");
            }
        }
    }
    debug!(
        target: "bc::harness",
        event = "worker_done",
        thread,
        reads = tally.reads,
        writes = tally.writes
    );
    Ok(tally)
}

/// Evict every resident block by missing on `capacity` blocks the cache does
/// not hold, then check that each block that was dirty reached the store
/// with the bytes the cache held for it.
///
/// Every miss recycles the least recent slot and the loaded block becomes
/// the most recent, so `capacity` misses recycle each slot exactly once.
fn evict_and_verify(cache: &HarnessCache, block_count: u64) -> Result<StoreCheck> {
    let dirty: Vec<BlockNumber> = cache
        .slots_snapshot()
        .into_iter()
        .filter(|slot| slot.status == SlotStatus::Dirty)
        .filter_map(|slot| slot.block)
        .collect();
    let mut held = Vec::with_capacity(dirty.len());
    for block in dirty {
        held.push((block, cache.read(block)?.into_inner()));
    }

    let resident: BTreeSet<_> = cache.resident_blocks().into_iter().collect();
    let fresh: Vec<BlockNumber> = (0..block_count)
        .map(BlockNumber)
        .filter(|block| !resident.contains(block))
        .take(cache.capacity())
        .collect();
    if fresh.len() < cache.capacity() {
        debug!(
            target: "bc::harness",
            event = "store_check_skipped",
            resident = resident.len(),
            block_count
        );
        return Ok(StoreCheck {
            checked: false,
            writebacks: 0,
            persisted: true,
        });
    }

    let before = cache.metrics().writebacks;
    for block in fresh {
        let _ = cache
            .read(block)
            .with_context(|| format!("evicting read of block {}", block.0))?;
    }
    let store = cache.inner().inner();
    let mut persisted = cache.dirty_count() == 0;
    for (block, bytes) in &held {
        if store.snapshot(*block)? != *bytes {
            warn!(target: "bc::harness", event = "lost_writeback", block = block.0);
            persisted = false;
        }
    }
    Ok(StoreCheck {
        checked: true,
        writebacks: cache.metrics().writebacks - before,
        persisted,
    })
}

/// Run the workload described by `config` to completion.
pub fn run_workload(config: &HarnessConfig) -> Result<HarnessReport> {
    config.validate()?;
    let block_size = BlockSize::new(config.block_size).context("invalid block_size")?;
    let store = MemoryBlockDevice::seeded(config.block_count, block_size)
        .context("failed to create backing store")?;
    let cache = BlockCache::new(
        LatencyDevice::new(store, config.latency()),
        CacheConfig {
            capacity: config.capacity,
        },
    )
    .context("failed to create cache")?;

    info!(
        target: "bc::harness",
        event = "workload_start",
        threads = config.threads,
        ops_per_thread = config.ops_per_thread,
        capacity = config.capacity,
        block_count = config.block_count,
        seed = config.seed
    );

    let start = Instant::now();
    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|thread| {
                let cache = &cache;
                scope.spawn(move || worker(cache, config, block_size, thread))
            })
            .collect();
        handles.into_iter().map(|handle| handle.join()).collect()
    });
    let elapsed = start.elapsed();

    let mut tally = WorkerTally::default();
    for (thread, outcome) in outcomes.into_iter().enumerate() {
        let worker_tally = outcome
            .map_err(|_| anyhow!("worker {thread} panicked"))?
            .with_context(|| format!("worker {thread} failed"))?;
        tally.reads += worker_tally.reads;
        tally.writes += worker_tally.writes;
        tally.foreign_reads += worker_tally.foreign_reads;
    }

    let resident = cache.resident_blocks();
    let distinct: BTreeSet<_> = resident.iter().copied().collect();
    let recency_permutation = cache.recency_is_permutation();
    let metrics = cache.metrics();
    let disk = cache.inner().stats();
    let store_check =
        evict_and_verify(&cache, config.block_count).context("end-of-run eviction failed")?;
    let checks = InvariantChecks {
        recency_permutation,
        capacity_bound: distinct.len() <= cache.capacity(),
        unique_residency: distinct.len() == resident.len(),
        reads_matched_blocks: tally.foreign_reads == 0,
        writebacks_persisted: store_check.persisted,
    };
    let passed = checks.all_passed();

    if passed {
        info!(
            target: "bc::harness",
            event = "workload_done",
            reads = tally.reads,
            writes = tally.writes,
            hits = metrics.hits,
            misses = metrics.misses,
            duration_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
        );
    } else {
        warn!(target: "bc::harness", event = "invariant_failure", ?checks);
    }

    Ok(HarnessReport {
        config: config.clone(),
        operations: tally.reads + tally.writes,
        reads: tally.reads,
        writes: tally.writes,
        foreign_reads: tally.foreign_reads,
        duration_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        hit_rate: metrics.hit_rate(),
        cache: metrics,
        disk,
        store_checked: store_check.checked,
        final_writebacks: store_check.writebacks,
        resident_blocks: distinct.into_iter().map(|b| b.0).collect(),
        checks,
        passed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(threads: usize, ops: usize) -> HarnessConfig {
        HarnessConfig {
            threads,
            ops_per_thread: ops,
            max_latency_us: 0,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn defaults_match_reference_workload() {
        let config = HarnessConfig::default();
        assert_eq!(config.threads, 10);
        assert_eq!(config.ops_per_thread, 10);
        assert_eq!(config.capacity, 10);
        assert_eq!(config.block_count, 100);
        assert_eq!(config.block_size, 4);
        assert_eq!(config.max_latency_us, 100);
        assert_eq!(config.write_percent, 50);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let parsed: HarnessConfig =
            serde_json::from_str(r#"{"threads": 3, "capacity": 2}"#).expect("parse");
        assert_eq!(parsed.threads, 3);
        assert_eq!(parsed.capacity, 2);
        assert_eq!(parsed.block_count, 100);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cases = [
            HarnessConfig {
                threads: 0,
                ..HarnessConfig::default()
            },
            HarnessConfig {
                capacity: 0,
                ..HarnessConfig::default()
            },
            HarnessConfig {
                block_count: 0,
                ..HarnessConfig::default()
            },
            HarnessConfig {
                block_size: 0,
                ..HarnessConfig::default()
            },
            HarnessConfig {
                write_percent: 101,
                ..HarnessConfig::default()
            },
        ];
        for config in &cases {
            assert!(run_workload(config).is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn payload_encodes_thread_and_block() {
        assert_eq!(payload_value(3, 42, 100), 342);
        assert_eq!(payload_value(0, 7, 100), 7);
    }

    #[test]
    fn seeded_values_are_plausible() {
        let config = HarnessConfig::default();
        let bs = BlockSize::default();
        assert!(is_plausible(42, 42, &config, bs));
        assert!(is_plausible(942, 42, &config, bs));
        assert!(!is_plausible(43, 42, &config, bs));
        assert!(!is_plausible(1_042, 42, &config, bs));
    }

    #[test]
    fn small_run_passes_every_check() {
        let report = run_workload(&quick(4, 50)).expect("run");
        assert!(report.passed, "{:?}", report.checks);
        assert_eq!(report.operations, 200);
        assert_eq!(report.reads + report.writes, 200);
        assert_eq!(report.cache.hits + report.cache.misses, 200);
        assert!(report.resident_blocks.len() <= 10);
    }

    #[test]
    fn read_only_run_never_writes_back() {
        let config = HarnessConfig {
            write_percent: 0,
            ..quick(3, 40)
        };
        let report = run_workload(&config).expect("run");
        assert_eq!(report.writes, 0);
        assert_eq!(report.cache.writebacks, 0);
        assert_eq!(report.final_writebacks, 0);
        assert_eq!(report.disk.writes, 0);
        assert_eq!(report.foreign_reads, 0);
    }

    #[test]
    fn write_only_run_persists_every_dirty_block() {
        let config = HarnessConfig {
            write_percent: 100,
            ..quick(3, 40)
        };
        let report = run_workload(&config).expect("run");
        assert_eq!(report.reads, 0);
        assert_eq!(report.disk.reads, 0, "write misses never fetch");
        assert_eq!(report.disk.writes, report.cache.writebacks);
        assert!(report.store_checked);
        // Every resident block was written, so each one is written back.
        assert_eq!(
            report.final_writebacks,
            u64::try_from(report.resident_blocks.len()).expect("fits")
        );
        assert!(report.checks.writebacks_persisted);
    }

    #[test]
    fn store_check_is_skipped_when_nothing_can_be_evicted() {
        let config = HarnessConfig {
            capacity: 8,
            block_count: 8,
            ..quick(2, 30)
        };
        let report = run_workload(&config).expect("run");
        assert!(!report.store_checked);
        assert_eq!(report.final_writebacks, 0);
        assert!(report.passed);
    }

    #[test]
    fn single_worker_runs_are_reproducible() {
        let config = HarnessConfig {
            seed: 1234,
            ..quick(1, 300)
        };
        let a = run_workload(&config).expect("first");
        let b = run_workload(&config).expect("second");
        assert_eq!(a.reads, b.reads);
        assert_eq!(a.writes, b.writes);
        assert_eq!(a.cache.hits, b.cache.hits);
        assert_eq!(a.cache.evictions, b.cache.evictions);
        assert_eq!(a.resident_blocks, b.resident_blocks);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = run_workload(&quick(2, 5)).expect("run");
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["operations"], 10);
        assert_eq!(json["passed"], true);
        assert!(json["cache"]["gate"]["exclusive_entries"].as_u64().is_some());
    }
}
