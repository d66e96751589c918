//! Time-bucketed completion counter
//!
//! Counts I/O completions into fixed-width time buckets so the reporter can
//! compute IOPS stability (standard deviation across buckets) over the
//! measurement window. Completions that straggle past the window still land
//! in buckets, but only the declared number of valid buckets contributes to
//! statistics.

/// Sentinel for "not yet initialized"; `initialize` must be called with a
/// non-zero width before the first `add`.
const INVALID_BUCKET_WIDTH: u64 = 0;

#[derive(Debug, Clone, Default)]
pub struct IoBucketizer {
    width: u64,
    valid: usize,
    buckets: Vec<u64>,
}

impl IoBucketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket width and the number of buckets inside the measurement
    /// window. Must be called exactly once, with `width > 0`, before any
    /// sample is added.
    pub fn initialize(&mut self, width: u64, valid: usize) {
        assert_eq!(self.width, INVALID_BUCKET_WIDTH, "bucketizer already initialized");
        assert_ne!(width, INVALID_BUCKET_WIDTH, "bucket width must be non-zero");

        self.width = width;
        self.valid = valid;
        self.buckets.reserve(valid);
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.width != INVALID_BUCKET_WIDTH
    }

    /// Count a completion at time `t` (same unit as the bucket width, relative
    /// to the start of the measurement window). Grows the sequence as needed.
    pub fn add(&mut self, t: u64) {
        assert!(self.is_initialized(), "bucketizer used before initialize");

        let bucket = (t / self.width) as usize;
        if self.buckets.len() < bucket + 1 {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] += 1;
    }

    /// Buckets that fall inside the measurement window. Buckets past this
    /// count exist when I/Os straggle over the boundary; they are retained
    /// but excluded from statistics.
    pub fn valid_bucket_count(&self) -> usize {
        self.buckets.len().min(self.valid)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, i: usize) -> u64 {
        self.buckets[i]
    }

    /// Element-wise sum; the merged window is the larger of the two.
    pub fn merge(&mut self, other: &IoBucketizer) {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        if other.valid > self.valid {
            self.valid = other.valid;
        }
        if self.width == INVALID_BUCKET_WIDTH {
            self.width = other.width;
        }
        for (i, &count) in other.buckets.iter().enumerate() {
            self.buckets[i] += count;
        }
    }

    fn mean(&self) -> f64 {
        let n = self.valid_bucket_count();
        let mut sum = 0.0;
        for i in 0..n {
            sum += self.buckets[i] as f64 / n as f64;
        }
        sum
    }

    /// Standard deviation of per-bucket counts over the valid prefix;
    /// 0 when no valid buckets exist.
    pub fn standard_deviation(&self) -> f64 {
        let n = self.valid_bucket_count();
        if n == 0 {
            return 0.0;
        }

        let mean = self.mean();
        let mut ssd = 0.0;
        for i in 0..n {
            let dev = self.buckets[i] as f64 - mean;
            ssd += dev * dev;
        }
        (ssd / n as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_placement() {
        let mut b = IoBucketizer::new();
        b.initialize(1000, 10);

        b.add(0);
        b.add(999);
        b.add(1000);
        b.add(2500);

        assert_eq!(b.bucket_count(), 3);
        assert_eq!(b.bucket(0), 2);
        assert_eq!(b.bucket(1), 1);
        assert_eq!(b.bucket(2), 1);
    }

    #[test]
    #[should_panic(expected = "before initialize")]
    fn test_add_requires_initialize() {
        let mut b = IoBucketizer::new();
        b.add(5);
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn test_double_initialize_panics() {
        let mut b = IoBucketizer::new();
        b.initialize(100, 5);
        b.initialize(100, 5);
    }

    #[test]
    fn test_valid_window_caps_bucket_count() {
        let mut b = IoBucketizer::new();
        b.initialize(10, 3);

        b.add(5); // bucket 0
        assert_eq!(b.valid_bucket_count(), 1);

        b.add(55); // bucket 5, past the window
        assert_eq!(b.bucket_count(), 6);
        assert_eq!(b.valid_bucket_count(), 3);
    }

    #[test]
    fn test_stragglers_do_not_move_standard_deviation() {
        let mut b = IoBucketizer::new();
        b.initialize(10, 2);
        for t in [0, 1, 12, 13] {
            b.add(t); // two in each valid bucket
        }
        let before = b.standard_deviation();

        b.add(95); // straggler far past the window
        b.add(97);
        assert_eq!(b.standard_deviation(), before);
        assert_eq!(before, 0.0);
    }

    #[test]
    fn test_standard_deviation_of_known_counts() {
        let mut b = IoBucketizer::new();
        b.initialize(10, 4);
        // bucket counts 2, 4, 4, 6 -> mean 4, population stddev sqrt(2)
        for (bucket, count) in [(0u64, 2u64), (1, 4), (2, 4), (3, 6)] {
            for _ in 0..count {
                b.add(bucket * 10);
            }
        }
        let sd = b.standard_deviation();
        assert!((sd - 2.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_empty_standard_deviation_is_zero() {
        let mut b = IoBucketizer::new();
        b.initialize(10, 4);
        assert_eq!(b.standard_deviation(), 0.0);
    }

    #[test]
    fn test_merge_sums_and_widens_window() {
        let mut a = IoBucketizer::new();
        a.initialize(10, 2);
        a.add(0);
        a.add(15);

        let mut b = IoBucketizer::new();
        b.initialize(10, 4);
        b.add(0);
        b.add(35);

        a.merge(&b);
        assert_eq!(a.valid_bucket_count(), 4);
        assert_eq!(a.bucket(0), 2);
        assert_eq!(a.bucket(1), 1);
        assert_eq!(a.bucket(3), 1);
    }

    #[test]
    fn test_merge_into_uninitialized_total() {
        // The reporter merges per-target bucketizers into a fresh total.
        let mut src = IoBucketizer::new();
        src.initialize(1000, 3);
        src.add(100);
        src.add(1100);

        let mut total = IoBucketizer::new();
        total.merge(&src);
        assert_eq!(total.valid_bucket_count(), 2);
        assert_eq!(total.bucket(0), 1);
        assert_eq!(total.bucket(1), 1);
    }
}
