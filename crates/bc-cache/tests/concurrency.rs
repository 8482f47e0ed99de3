#![forbid(unsafe_code)]

use bc_block::{BlockDevice, LatencyConfig, LatencyDevice, MemoryBlockDevice};
use bc_cache::{BlockCache, CacheConfig};
use bc_types::{BlockNumber, BlockSize, decode_block_value, encode_block_value};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Values written to `block` are `block + STRIDE * n` with `n >= 1`, so any
/// value read back identifies the block it belongs to.
const STRIDE: u64 = 1_000;

fn bs() -> BlockSize {
    BlockSize::new(4).expect("bs")
}

fn slow_cache(
    capacity: usize,
    blocks: u64,
    seed: u64,
) -> Arc<BlockCache<LatencyDevice<MemoryBlockDevice>>> {
    let mem = MemoryBlockDevice::seeded(blocks, bs()).expect("device");
    let dev = LatencyDevice::new(
        mem,
        LatencyConfig {
            max_latency: Duration::from_micros(50),
            seed,
        },
    );
    Arc::new(BlockCache::new(dev, CacheConfig { capacity }).expect("cache"))
}

/// Tiny xorshift so each worker draws its own reproducible block sequence.
fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

struct StormOutcome {
    /// Last value each block's owner wrote, if any.
    expected: HashMap<u64, u64>,
}

/// Random reads and writes from `threads` workers. Block `b` is only
/// written by worker `b % threads`, so its final value is known.
fn storm<D: BlockDevice + 'static>(
    cache: &Arc<BlockCache<D>>,
    threads: usize,
    ops: usize,
    blocks: u64,
    seed: u64,
) -> StormOutcome {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|worker| {
            let cache = Arc::clone(cache);
            let barrier = Arc::clone(&barrier);
            let worker_id = u64::try_from(worker).expect("fits");
            let threads_u64 = u64::try_from(threads).expect("fits");
            std::thread::spawn(move || {
                let mut rng = (seed ^ (worker_id + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)) | 1;
                let mut mine: HashMap<u64, u64> = HashMap::new();
                barrier.wait();
                for _ in 0..ops {
                    let roll = next(&mut rng);
                    let block = roll % blocks;
                    let owned = block % threads_u64 == worker_id;
                    if owned && roll % 3 == 0 {
                        let generation = mine.get(&block).map_or(1, |v| (v - block) / STRIDE + 1);
                        let value = block + STRIDE * generation;
                        cache
                            .write(BlockNumber(block), &encode_block_value(value, bs()))
                            .expect("write");
                        mine.insert(block, value);
                    } else {
                        let buf = cache.read(BlockNumber(block)).expect("read");
                        let value = decode_block_value(buf.as_slice());
                        assert_eq!(
                            value % STRIDE,
                            block,
                            "block {block} returned foreign data {value}"
                        );
                        if let Some(&last) = mine.get(&block) {
                            assert_eq!(value, last, "owner lost its own write to block {block}");
                        }
                    }
                }
                mine
            })
        })
        .collect();

    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().expect("worker should not panic"));
    }
    StormOutcome { expected }
}

fn assert_consistent<D: BlockDevice>(cache: &BlockCache<D>, outcome: &StormOutcome, blocks: u64) {
    assert!(cache.recency_is_permutation());
    let order: BTreeSet<usize> = cache.recency_order().iter().map(|s| s.get()).collect();
    assert_eq!(order, (0..cache.capacity()).collect());

    let resident = cache.resident_blocks();
    let distinct: BTreeSet<_> = resident.iter().copied().collect();
    assert_eq!(distinct.len(), resident.len(), "block resident twice: {resident:?}");
    assert!(resident.len() <= cache.capacity());

    for block in 0..blocks {
        let want = outcome.expected.get(&block).copied().unwrap_or(block);
        let got = decode_block_value(cache.read(BlockNumber(block)).expect("read").as_slice());
        assert_eq!(got, want, "block {block}");
    }
}

/// Miss on `capacity` blocks the cache does not hold. Each miss recycles the
/// least recent slot, so every previously resident block is evicted.
fn evict_resident<D: BlockDevice>(cache: &BlockCache<D>, blocks: u64) {
    let resident: BTreeSet<_> = cache.resident_blocks().into_iter().collect();
    let fresh: Vec<_> = (0..blocks)
        .map(BlockNumber)
        .filter(|block| !resident.contains(block))
        .take(cache.capacity())
        .collect();
    assert_eq!(fresh.len(), cache.capacity(), "not enough other blocks");
    for block in fresh {
        let _ = cache.read(block).expect("evicting read");
    }
}

#[test]
fn ten_threads_read_the_same_cached_block() {
    let cache = slow_cache(10, 100, 1);
    let _ = cache.read(BlockNumber(7)).expect("warm");
    let barrier = Arc::new(Barrier::new(10));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                (0..100)
                    .map(|_| cache.read(BlockNumber(7)).expect("read").into_inner())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for handle in handles {
        for bytes in handle.join().expect("reader should not panic") {
            assert_eq!(decode_block_value(&bytes), 7);
        }
    }
    let metrics = cache.metrics();
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 1_000);
    assert_eq!(cache.inner().stats().reads, 1);
}

#[test]
fn write_on_one_thread_is_read_on_another() {
    let cache = slow_cache(4, 32, 2);
    for block in 0_u64..32 {
        let value = block + STRIDE;
        {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                cache
                    .write(BlockNumber(block), &encode_block_value(value, bs()))
                    .expect("write");
            })
            .join()
            .expect("writer");
        }
        let cache = Arc::clone(&cache);
        let got = std::thread::spawn(move || cache.read(BlockNumber(block)).expect("read"))
            .join()
            .expect("reader");
        assert_eq!(decode_block_value(got.as_slice()), value);
    }
    // Capacity 4 over 32 written blocks: 28 dirty victims went to disk.
    assert_eq!(cache.metrics().writebacks, 28);
}

#[test]
fn concurrent_misses_on_one_block_load_it_once() {
    let cache = slow_cache(4, 16, 3);
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                cache.read(BlockNumber(9)).expect("read")
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(decode_block_value(handle.join().expect("reader").as_slice()), 9);
    }
    assert_eq!(cache.inner().stats().reads, 1);
    assert_eq!(cache.resident_blocks(), vec![BlockNumber(9)]);
}

#[test]
fn storm_keeps_cache_consistent() {
    const BLOCKS: u64 = 100;
    let cache = slow_cache(10, BLOCKS, 4);
    let outcome = storm(&cache, 8, 400, BLOCKS, 0xC0FF_EE00);
    assert_consistent(&cache, &outcome, BLOCKS);

    evict_resident(&cache, BLOCKS);
    assert_eq!(cache.dirty_count(), 0);
    for block in 0..BLOCKS {
        let want = outcome.expected.get(&block).copied().unwrap_or(block);
        let disk = cache.inner().inner().read_block(BlockNumber(block)).expect("disk");
        assert_eq!(decode_block_value(disk.as_slice()), want, "disk block {block}");
    }
}

#[test]
fn single_slot_cache_survives_contention() {
    const BLOCKS: u64 = 12;
    let cache = slow_cache(1, BLOCKS, 5);
    let outcome = storm(&cache, 6, 150, BLOCKS, 17);
    assert_consistent(&cache, &outcome, BLOCKS);
    assert!(cache.metrics().evictions > 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn proptest_random_storms_preserve_invariants(
        capacity in 1_usize..8,
        threads in 2_usize..6,
        blocks in 4_u64..40,
        seed in any::<u64>(),
    ) {
        let mem = MemoryBlockDevice::seeded(blocks, bs()).expect("device");
        let cache = Arc::new(BlockCache::new(mem, CacheConfig { capacity }).expect("cache"));
        let outcome = storm(&cache, threads, 200, blocks, seed);
        assert_consistent(&cache, &outcome, blocks);
        // One exclusive recency update per storm op and per verification read.
        let ops = u64::try_from(threads * 200).expect("fits");
        prop_assert_eq!(cache.metrics().gate.exclusive_entries, ops + blocks);
    }
}
