//! Reproducible randomness for workload generation.

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// xorshift* generator. One instance per worker; never shared.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let state = seed ^ GOLDEN_GAMMA;
        Self {
            // xorshift never leaves zero.
            state: if state == 0 { GOLDEN_GAMMA } else { state },
        }
    }

    /// Generator for worker `worker` of a run seeded with `seed`.
    #[must_use]
    pub fn for_worker(seed: u64, worker: usize) -> Self {
        let salt = u64::try_from(worker)
            .unwrap_or(u64::MAX)
            .wrapping_add(1)
            .wrapping_mul(GOLDEN_GAMMA);
        Self::new(seed.rotate_left(17) ^ salt)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `0..upper_exclusive`; `0` when the range is empty.
    pub fn next_below(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive <= 1 {
            return 0;
        }
        self.next_u64() % upper_exclusive
    }

    /// Uniform value in `[0, 1)`.
    #[allow(clippy::cast_precision_loss)]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1_u64 << 53) as f64
    }

    /// True with probability `percent / 100`.
    pub fn chance_percent(&mut self, percent: u8) -> bool {
        self.next_below(100) < u64::from(percent)
    }
}

/// Zipf-like block picker using the rejection method.
///
/// A uniform candidate `k` in `0..block_count` is kept with probability
/// `1 / (k + 1)`, so block 0 is always accepted and low-numbered blocks
/// dominate the workload.
#[derive(Debug, Clone, Copy)]
pub struct ZipfPicker {
    block_count: u64,
}

impl ZipfPicker {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self { block_count }
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn pick(&self, rng: &mut DeterministicRng) -> u64 {
        loop {
            let candidate = rng.next_below(self.block_count);
            if rng.next_f64() < 1.0 / (candidate + 1) as f64 {
                return candidate;
            }
        }
    }
}
