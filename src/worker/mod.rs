//! Worker threads
//!
//! One worker per thread. A worker owns its assigned targets' per-thread
//! state (open file, aligned buffers, result accumulators), drives a steady
//! queue of `overlap` outstanding operations per target through its I/O
//! group, and records measurements while the record flag is up.
//!
//! Shutdown is cooperative: the controller clears `run`, the worker notices
//! after its next completion, drains whatever the OS still owes it, closes
//! its files and returns its results through the join handle.

pub mod affinity;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error};

use crate::config::{JobOptions, SeedMode};
use crate::engine::{IoBackend, OpKind};
use crate::stats::{TargetResults, WorkerResults};
use crate::target::Target;
use crate::util::buffer::AlignedBuffer;
use crate::util::clock::PerfClock;
use crate::util::rng::WorkerRng;
use crate::Result;

/// Flags and rendezvous state shared between the controller and all workers.
///
/// `run`, `record` and `error` are monotonic one-shot signals; relaxed loads
/// at completion boundaries are sufficient for workers, the controller pairs
/// its stores with release ordering and a condvar notification on the error
/// path.
pub struct Shared {
    pub run: AtomicBool,
    pub record: AtomicBool,
    pub error: AtomicBool,
    /// Monotonic start of the measurement window, written before `record`
    /// flips on.
    pub window_start_us: AtomicU64,
    pub window_start_ms: AtomicU64,

    /// Count of workers that finished initialization.
    pub init: Mutex<usize>,
    pub init_cv: Condvar,
    /// Wakes the controller out of its warm-up/measurement sleep on error.
    pub error_cv: Condvar,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            run: AtomicBool::new(true),
            record: AtomicBool::new(false),
            error: AtomicBool::new(false),
            window_start_us: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(0),
            init: Mutex::new(0),
            init_cv: Condvar::new(),
            error_cv: Condvar::new(),
        }
    }

    /// Stop the job and mark it failed. Wakes the controller only once the
    /// failing worker had signalled initialization; before that the
    /// controller is already polling the error flag on a 1 ms tick.
    pub fn abort(&self, initialized: bool) {
        self.run.store(false, Ordering::Release);
        self.error.store(true, Ordering::Release);
        if initialized {
            let _guard = self.init.lock().unwrap();
            self.error_cv.notify_all();
        }
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread state for one assigned target.
struct ActiveTarget {
    target: Arc<Target>,
    file: std::fs::File,
    buffer: AlignedBuffer,
    write_buffer: Option<AlignedBuffer>,
    results: TargetResults,
}

pub struct Worker {
    id: usize,
    /// Position among the threads sharing each assigned target; equals `id`
    /// when all threads operate on all targets.
    rel_id: u32,
    cpu: Option<u32>,
    targets: Vec<Arc<Target>>,
    manager: Arc<IoBackend>,
    options: Arc<JobOptions>,
    shared: Arc<Shared>,
    initialized: bool,
}

impl Worker {
    pub fn new(
        id: usize,
        rel_id: u32,
        cpu: Option<u32>,
        targets: Vec<Arc<Target>>,
        manager: Arc<IoBackend>,
        options: Arc<JobOptions>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            rel_id,
            cpu,
            targets,
            manager,
            options,
            shared,
            initialized: false,
        }
    }

    /// Thread entry point. Any failure aborts the whole job before the error
    /// propagates through the join handle.
    pub fn run(mut self) -> Result<WorkerResults> {
        let result = self.execute();
        if let Err(ref e) = result {
            error!(worker = self.id, "worker aborting: {e:#}");
            self.shared.abort(self.initialized);
        }
        result
    }

    fn execute(&mut self) -> Result<WorkerResults> {
        if let Some(cpu) = self.cpu {
            affinity::pin_to_cpu(cpu)?;
        }

        let mut rng = match self.options.seed {
            SeedMode::Seeded(seed) => WorkerRng::from_seed(seed),
            SeedMode::TimeSeeded => WorkerRng::from_entropy(),
        };

        let bucket_ms = self.options.io_bucket_ms as u64;
        let valid_buckets = (self.options.duration_secs as u64 * 1000).div_ceil(bucket_ms.max(1));

        // open files and allocate buffers for every assigned target
        let mut active: Vec<ActiveTarget> = Vec::with_capacity(self.targets.len());
        let mut total_overlap = 0usize;
        for target in &self.targets {
            total_overlap += target.overlap as usize;

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(target.custom_open_flags())
                .open(&target.path)
                .with_context(|| format!("opening target {}", target.path.display()))?;

            let alignment = if target.direct {
                target.sector_size as usize
            } else {
                1
            };
            let mut buffer = AlignedBuffer::new(
                (target.overlap as u64 * target.block_size) as usize,
                alignment,
            );
            buffer.fill(target.fill, &mut rng);

            let write_buffer = if target.separate_write_buffer {
                let mut wb = AlignedBuffer::new(target.block_size as usize, alignment);
                wb.fill(target.fill, &mut rng);
                Some(wb)
            } else {
                None
            };

            let mut results = TargetResults::new(Arc::clone(target));
            if self.options.measure_iops_std_dev {
                results.read_buckets.initialize(bucket_ms, valid_buckets as usize);
                results.write_buckets.initialize(bucket_ms, valid_buckets as usize);
            }

            active.push(ActiveTarget {
                target: Arc::clone(target),
                file,
                buffer,
                write_buffer,
                results,
            });
        }

        self.manager.create_group(self.id, total_overlap)?;

        // with multiple targets, only the first target's cap governs this
        // thread's throttle
        let throttle = active
            .first()
            .map(|a| a.target.max_throughput)
            .unwrap_or(0);

        // pre-construct the full overlap budget at successive offsets
        for (idx, at) in active.iter_mut().enumerate() {
            let mut offset = at.target.start_offset(self.rel_id, &mut rng);
            for i in 0..at.target.overlap {
                let read_buf = unsafe {
                    at.buffer
                        .as_mut_ptr()
                        .add((i as u64 * at.target.block_size) as usize)
                };
                let write_buf = match at.write_buffer.as_mut() {
                    Some(wb) => wb.as_mut_ptr(),
                    None => read_buf,
                };
                let kind = if rng.percentage() <= at.target.write_percentage {
                    OpKind::Write
                } else {
                    OpKind::Read
                };

                let op = self.manager.construct(
                    kind,
                    at.file.as_raw_fd(),
                    offset,
                    read_buf,
                    write_buf,
                    at.target.block_size as usize,
                    self.id,
                    idx,
                    PerfClock::now_us(),
                );
                self.manager.enqueue(op)?;

                offset = at.target.next_offset(self.rel_id, offset, &mut rng);
            }
        }
        self.manager.submit(self.id)?;

        // unblock the controller so warm-up can start
        {
            let mut count = self.shared.init.lock().unwrap();
            *count += 1;
            self.shared.init_cv.notify_one();
        }
        self.initialized = true;
        debug!(worker = self.id, total_overlap, "worker initialized");

        let mut in_flight = total_overlap;
        let mut thread_bytes: u64 = 0;

        let loop_result = (|| -> Result<()> {
            while self.shared.run.load(Ordering::Acquire) {
                // throughput throttle: estimate bytes/ms since the window
                // start and back off for a millisecond when over the cap
                if throttle != 0 && self.shared.record.load(Ordering::Acquire) {
                    let since_ms = PerfClock::now_ms()
                        .saturating_sub(self.shared.window_start_ms.load(Ordering::Acquire));
                    if since_ms != 0 && thread_bytes / since_ms > throttle {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                }

                let mut op = self.manager.wait(self.id)?;
                in_flight -= 1;

                // re-check promptly after waking; improves duration accuracy
                if !self.shared.run.load(Ordering::Acquire) {
                    break;
                }

                let at = &mut active[op.target];
                let block = at.target.block_size;

                if op.os_error() != 0 {
                    anyhow::bail!(
                        "async {} failed at offset {}: {}",
                        op.kind,
                        op.offset,
                        std::io::Error::from_raw_os_error(op.os_error())
                    );
                }
                if op.result() != block as i64 {
                    anyhow::bail!(
                        "short {} at offset {}: {} of {} bytes",
                        op.kind,
                        op.offset,
                        op.result(),
                        block
                    );
                }

                let now_us = PerfClock::now_us();

                if self.shared.record.load(Ordering::Acquire) {
                    thread_bytes += block;
                    at.results.record_completion(op.kind, op.result() as u64);

                    if self.options.measure_iops_std_dev || self.options.measure_latency {
                        let since_start_us = now_us
                            .saturating_sub(self.shared.window_start_us.load(Ordering::Acquire));
                        let op_time_us = now_us.saturating_sub(op.submitted_at_us);

                        if self.options.measure_iops_std_dev {
                            at.results.record_bucket(op.kind, since_start_us / 1000);
                        }
                        if self.options.measure_latency {
                            at.results.record_latency(op.kind, op_time_us);
                        }
                    }
                }

                // recycle the op: new timestamp, next offset, fresh coin flip
                op.submitted_at_us = now_us;
                op.offset = at.target.next_offset(self.rel_id, op.offset, &mut rng);
                op.kind = if rng.percentage() <= at.target.write_percentage {
                    OpKind::Write
                } else {
                    OpKind::Read
                };

                self.manager.enqueue(op)?;
                self.manager.submit(self.id)?;
                in_flight += 1;
            }
            Ok(())
        })();

        // drain: everything handed to the OS must come back before the
        // buffers can be dropped, even when the loop failed; results of the
        // stragglers are discarded
        while in_flight > 0 {
            match self.manager.wait(self.id) {
                Ok(_) => in_flight -= 1,
                Err(drain_err) => {
                    // a loop failure is the root cause; report it first
                    loop_result?;
                    return Err(drain_err).context("draining in-flight operations");
                }
            }
        }
        loop_result?;
        debug!(worker = self.id, "worker drained and exiting");

        Ok(WorkerResults {
            worker_id: self.id,
            targets: active.into_iter().map(|a| a.results).collect(),
        })
    }
}
