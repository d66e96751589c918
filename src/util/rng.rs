//! Per-worker random number streams
//!
//! Each worker owns two independent xoshiro streams: one that drives offset
//! selection, and one that decides the read/write mix. Keeping them separate
//! means the offset sequence for a given seed is stable regardless of the
//! configured write percentage.

use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Dual-stream RNG owned by a single worker thread. Not thread-safe.
pub struct WorkerRng {
    offsets: Xoshiro256PlusPlus,
    coin: Xoshiro256PlusPlus,
}

impl WorkerRng {
    /// Deterministic offset stream from a user-supplied seed. The read/write
    /// coin stream is always entropy-seeded.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            offsets: Xoshiro256PlusPlus::seed_from_u64(seed),
            coin: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Entropy-seeded streams for time-seeded runs.
    pub fn from_entropy() -> Self {
        Self {
            offsets: Xoshiro256PlusPlus::from_entropy(),
            coin: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Uniform draw in `[0, range)`, used to pick an aligned offset index.
    #[inline]
    pub fn offset_index(&mut self, range: u64) -> u64 {
        debug_assert!(range > 0);
        self.offsets.gen_range(0..range)
    }

    /// Uniform draw in `[1, 100]` for the write-percentage coin flip: an op
    /// is a write when the draw is `<= write_percentage`.
    #[inline]
    pub fn percentage(&mut self) -> u32 {
        self.coin.gen_range(1..=100)
    }

    /// Fill a buffer with random bytes from the offset stream.
    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.offsets.fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_offset_stream_is_deterministic() {
        let mut a = WorkerRng::from_seed(42);
        let mut b = WorkerRng::from_seed(42);
        for _ in 0..1_000 {
            assert_eq!(a.offset_index(256), b.offset_index(256));
        }
    }

    #[test]
    fn test_offset_index_stays_in_range() {
        let mut rng = WorkerRng::from_seed(7);
        for range in [1u64, 2, 3, 255, 4096] {
            for _ in 0..200 {
                assert!(rng.offset_index(range) < range);
            }
        }
    }

    #[test]
    fn test_percentage_bounds() {
        let mut rng = WorkerRng::from_entropy();
        for _ in 0..10_000 {
            let p = rng.percentage();
            assert!((1..=100).contains(&p));
        }
    }

    #[test]
    fn test_write_mix_fraction() {
        // 30% write mix over 100k flips lands within [0.27, 0.33].
        let mut rng = WorkerRng::from_seed(7);
        let write_percentage = 30;
        let total = 100_000;
        let writes = (0..total)
            .filter(|_| rng.percentage() <= write_percentage)
            .count();
        let fraction = writes as f64 / total as f64;
        assert!(
            (0.27..=0.33).contains(&fraction),
            "write fraction {fraction} outside tolerance"
        );
    }

    #[test]
    fn test_offset_distribution_roughly_uniform() {
        let mut rng = WorkerRng::from_seed(42);
        let range = 256u64;
        let draws = 10_000usize;
        let mut counts = vec![0u32; range as usize];
        for _ in 0..draws {
            counts[rng.offset_index(range) as usize] += 1;
        }
        let expected = draws as f64 / range as f64;
        // chi-squared against uniform; df=255, the 99.9th percentile is ~330
        let chi2: f64 = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi2 < 350.0, "chi-squared {chi2} too large for uniform draw");
        assert!(counts.iter().all(|&c| c > 0), "some positions never drawn");
    }
}
