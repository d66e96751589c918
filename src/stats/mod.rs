//! Measurement accumulators
//!
//! Workers update one [`TargetResults`] per assigned target during the record
//! window; the controller collects them after join and the reporter merges
//! across workers. Nothing here is shared while the job runs.

pub mod bucketizer;
pub mod histogram;

use std::sync::Arc;

use crate::engine::OpKind;
use crate::stats::bucketizer::IoBucketizer;
use crate::stats::histogram::Histogram;
use crate::target::Target;

/// Per-(worker, target) counters and distributions.
///
/// All counters are monotonically increasing and only touched while the
/// record flag is set, so they describe exactly the measurement window.
#[derive(Debug)]
pub struct TargetResults {
    pub target: Arc<Target>,

    pub bytes_count: u64,
    pub read_bytes_count: u64,
    pub write_bytes_count: u64,

    pub iops_count: u64,
    pub read_iops_count: u64,
    pub write_iops_count: u64,

    /// Latency samples in microseconds.
    pub read_latency: Histogram,
    pub write_latency: Histogram,

    /// Completion counts bucketed by milliseconds since the window start.
    pub read_buckets: IoBucketizer,
    pub write_buckets: IoBucketizer,
}

impl TargetResults {
    pub fn new(target: Arc<Target>) -> Self {
        Self {
            target,
            bytes_count: 0,
            read_bytes_count: 0,
            write_bytes_count: 0,
            iops_count: 0,
            read_iops_count: 0,
            write_iops_count: 0,
            read_latency: Histogram::new(),
            write_latency: Histogram::new(),
            read_buckets: IoBucketizer::new(),
            write_buckets: IoBucketizer::new(),
        }
    }

    /// Count one completed operation of `bytes` bytes.
    #[inline]
    pub fn record_completion(&mut self, kind: OpKind, bytes: u64) {
        self.bytes_count += bytes;
        self.iops_count += 1;
        match kind {
            OpKind::Read => {
                self.read_bytes_count += bytes;
                self.read_iops_count += 1;
            }
            OpKind::Write => {
                self.write_bytes_count += bytes;
                self.write_iops_count += 1;
            }
        }
    }

    #[inline]
    pub fn record_latency(&mut self, kind: OpKind, latency_us: u64) {
        match kind {
            OpKind::Read => self.read_latency.add(latency_us),
            OpKind::Write => self.write_latency.add(latency_us),
        }
    }

    #[inline]
    pub fn record_bucket(&mut self, kind: OpKind, since_window_start_ms: u64) {
        match kind {
            OpKind::Read => self.read_buckets.add(since_window_start_ms),
            OpKind::Write => self.write_buckets.add(since_window_start_ms),
        }
    }
}

/// Everything a single worker measured, returned through its join handle.
#[derive(Debug)]
pub struct WorkerResults {
    pub worker_id: usize,
    pub targets: Vec<TargetResults>,
}

/// CPU usage over the measurement interval, as fractions of total time.
#[derive(Debug, Clone, Copy)]
pub struct CpuUsage {
    pub cpu: u32,
    /// Non-idle time excluding iowait.
    pub usage: f64,
    /// User plus nice time.
    pub user: f64,
    pub kernel: f64,
    pub iowait: f64,
    pub idle: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> TargetResults {
        TargetResults::new(Arc::new(Target::new("/tmp/x")))
    }

    #[test]
    fn test_read_write_split_invariant() {
        let mut r = results();
        for i in 0..100u64 {
            let kind = if i % 3 == 0 { OpKind::Write } else { OpKind::Read };
            r.record_completion(kind, 4096);
        }
        assert_eq!(r.read_iops_count + r.write_iops_count, r.iops_count);
        assert_eq!(r.read_bytes_count + r.write_bytes_count, r.bytes_count);
        assert_eq!(r.iops_count, 100);
        assert_eq!(r.bytes_count, 100 * 4096);
    }

    #[test]
    fn test_latency_routed_by_direction() {
        let mut r = results();
        r.record_latency(OpKind::Read, 120);
        r.record_latency(OpKind::Read, 80);
        r.record_latency(OpKind::Write, 500);
        assert_eq!(r.read_latency.sample_count(), 2);
        assert_eq!(r.write_latency.sample_count(), 1);
        assert_eq!(r.write_latency.max().unwrap(), 500);
    }

    #[test]
    fn test_buckets_routed_by_direction() {
        let mut r = results();
        r.read_buckets.initialize(1000, 4);
        r.write_buckets.initialize(1000, 4);
        r.record_bucket(OpKind::Read, 1500);
        r.record_bucket(OpKind::Write, 2500);
        assert_eq!(r.read_buckets.bucket(1), 1);
        assert_eq!(r.write_buckets.bucket(2), 1);
    }
}
