//! Latency histogram
//!
//! A frequency distribution over integer samples (microseconds in practice).
//! Inserts go through a hash map so the hot path stays O(1); percentile and
//! extrema queries materialize a sorted view on demand. Workers keep one
//! histogram per (target, direction) and the reporter merges them after the
//! run.

use std::collections::HashMap;

use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct Histogram {
    data: HashMap<u64, u64>,
    samples: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample.
    #[inline]
    pub fn add(&mut self, value: u64) {
        *self.data.entry(value).or_insert(0) += 1;
        self.samples += 1;
    }

    /// Sum another histogram into this one.
    pub fn merge(&mut self, other: &Histogram) {
        for (&value, &count) in &other.data {
            *self.data.entry(value).or_insert(0) += count;
        }
        self.samples += other.samples;
    }

    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn min(&self) -> Result<u64> {
        self.data
            .keys()
            .min()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("histogram is empty"))
    }

    pub fn max(&self) -> Result<u64> {
        self.data
            .keys()
            .max()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("histogram is empty"))
    }

    /// Arithmetic mean over all samples. Accumulates `value * count / samples`
    /// per bucket to limit precision loss on large sample counts.
    pub fn mean(&self) -> Result<f64> {
        if self.samples == 0 {
            anyhow::bail!("histogram is empty");
        }

        let mut sum = 0.0f64;
        for (&value, &count) in &self.data {
            sum += value as f64 * count as f64 / self.samples as f64;
            if !sum.is_finite() {
                anyhow::bail!("overflow while accumulating histogram mean");
            }
        }
        Ok(sum)
    }

    /// Population standard deviation.
    pub fn standard_deviation(&self) -> Result<f64> {
        let mean = self.mean()?;
        let mut ssd = 0.0f64;
        for (&value, &count) in &self.data {
            let dev = value as f64 - mean;
            ssd += count as f64 * dev * dev;
        }
        Ok((ssd / self.samples as f64).sqrt())
    }

    /// Smallest sample value whose cumulative count reaches `p` of the total.
    /// `percentile(0.0)` is the minimum and `percentile(1.0)` the maximum.
    pub fn percentile(&self, p: f64) -> Result<u64> {
        if !(0.0..=1.0).contains(&p) {
            anyhow::bail!("percentile must be within [0, 1], got {p}");
        }
        if self.samples == 0 {
            anyhow::bail!("histogram is empty");
        }

        let target = self.samples as f64 * p;
        let mut sorted: Vec<(u64, u64)> = self.data.iter().map(|(&v, &c)| (v, c)).collect();
        sorted.sort_unstable_by_key(|&(v, _)| v);

        let mut cumulative = 0u64;
        for (value, count) in sorted {
            cumulative += count;
            if cumulative as f64 >= target {
                return Ok(value);
            }
        }

        // cumulative == samples >= target always holds on the last bucket
        unreachable!("percentile target not reached");
    }
}
