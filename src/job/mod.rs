//! Job lifecycle control
//!
//! The controller prepares targets, starts the I/O manager, spawns workers,
//! and walks the run through its phases: initialization rendezvous, warm-up,
//! the recorded measurement window (bracketed by two CPU snapshots), optional
//! cool-down, then cooperative shutdown and result aggregation.
//!
//! Phase sleeps are condition-variable timed waits on the shared error
//! condvar, so a failing worker wakes the controller immediately; a wake
//! before the timeout always means the run is invalid.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info};

use crate::config::JobOptions;
use crate::engine::IoBackend;
use crate::stats::{CpuUsage, WorkerResults};
use crate::sysinfo::{CpuTimes, SysInfo};
use crate::target::{setup, Target};
use crate::util::clock::PerfClock;
use crate::worker::{Shared, Worker};
use crate::Result;

/// Hard ceiling on worker initialization (file opens, buffer allocation,
/// pre-submission). Everything after initialization is bounded by the
/// configured phase durations instead.
const INIT_DEADLINE_SECS: u64 = 10_000;

pub struct Job {
    options: JobOptions,
    targets: Vec<Target>,
    sys: SysInfo,
}

#[derive(Debug)]
pub struct JobResults {
    pub cpu_usage: Vec<CpuUsage>,
    /// Per-worker results, ordered by worker id.
    pub workers: Vec<WorkerResults>,
    pub targets: Vec<Arc<Target>>,
}

impl Job {
    pub fn new(options: JobOptions, targets: Vec<Target>, sys: SysInfo) -> Self {
        Self {
            options,
            targets,
            sys,
        }
    }

    pub fn run(mut self) -> Result<JobResults> {
        setup::prepare_targets(&mut self.targets).context("target setup failed")?;

        let targets: Vec<Arc<Target>> = self.targets.drain(..).map(Arc::new).collect();
        let options = Arc::new(self.options.clone());
        let worker_count = options.total_threads as usize;

        // hand each worker its targets: -F gives every worker every target,
        // -t walks workers across targets so each serves exactly one
        let mut assignments: Vec<Vec<Arc<Target>>> = vec![Vec::new(); worker_count];
        let mut rel_ids: Vec<u32> = vec![0; worker_count];
        let mut total_overlap = 0usize;
        if options.use_total_threads {
            for target in &targets {
                for (i, slot) in assignments.iter_mut().enumerate() {
                    slot.push(Arc::clone(target));
                    rel_ids[i] = i as u32;
                    total_overlap += target.overlap as usize;
                }
            }
        } else {
            let mut index = 0usize;
            for target in &targets {
                for inner in 0..target.threads_per_target {
                    assignments[index].push(Arc::clone(target));
                    rel_ids[index] = inner;
                    total_overlap += target.overlap as usize;
                    index += 1;
                }
            }
        }

        let manager = Arc::new(IoBackend::new(options.engine));
        manager
            .start(total_overlap)
            .context("I/O engine failed to start")?;
        let shared = Arc::new(Shared::new());

        info!(threads = worker_count, total_overlap, "starting workers");
        let mut cpus = self.sys.affinity_cpus.iter().cycle();
        let mut handles: Vec<JoinHandle<Result<WorkerResults>>> =
            Vec::with_capacity(worker_count);
        for (id, worker_targets) in assignments.into_iter().enumerate() {
            let cpu = if options.disable_affinity {
                None
            } else {
                Some(*cpus.next().unwrap())
            };
            let worker = Worker::new(
                id,
                rel_ids[id],
                cpu,
                worker_targets,
                Arc::clone(&manager),
                Arc::clone(&options),
                Arc::clone(&shared),
            );
            let handle = std::thread::Builder::new()
                .name(format!("iodrill-worker-{id}"))
                .spawn(move || worker.run())
                .context("spawning worker thread")?;
            handles.push(handle);
        }

        // initialization rendezvous: 1 ms ticks keep the error flag visible
        // promptly, the deadline catches workers that never come up
        let deadline = Instant::now() + Duration::from_secs(INIT_DEADLINE_SECS);
        let mut timed_out = false;
        {
            let mut count = shared.init.lock().unwrap();
            while *count < worker_count {
                if shared.error.load(Ordering::Acquire) {
                    break;
                }
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                let (guard, _) = shared
                    .init_cv
                    .wait_timeout(count, Duration::from_millis(1))
                    .unwrap();
                count = guard;
            }
        }
        if timed_out {
            // don't wait on threads that never came up; the process is about
            // to exit with an error anyway
            shared.run.store(false, Ordering::Release);
            drop(handles);
            anyhow::bail!("thread initialization timed out");
        }
        if shared.error.load(Ordering::Acquire) {
            return Err(first_failure(handles)).context("error during thread initialization");
        }
        debug!("all workers initialized");

        // first CPU snapshot; the record window sits strictly between the two
        let cpu_before = self.sys.cpu_stats()?;

        if options.warmup_secs > 0 {
            info!(seconds = options.warmup_secs, "warming up");
            if !phase_sleep(&shared, options.warmup_secs) {
                shared.run.store(false, Ordering::Release);
                return Err(first_failure(handles)).context("error during warm-up");
            }
        }

        info!(seconds = options.duration_secs, "measuring");
        let start_ns = PerfClock::now_ns();
        shared
            .window_start_us
            .store(start_ns / 1_000, Ordering::Release);
        shared
            .window_start_ms
            .store(start_ns / 1_000_000, Ordering::Release);
        shared.record.store(true, Ordering::Release);
        let clean = phase_sleep(&shared, options.duration_secs);
        shared.record.store(false, Ordering::Release);
        if !clean {
            shared.run.store(false, Ordering::Release);
            return Err(first_failure(handles)).context("error during the measurement window");
        }

        let cpu_after = self.sys.cpu_stats()?;

        if options.cooldown_secs > 0 {
            info!(seconds = options.cooldown_secs, "cooling down");
            if !phase_sleep(&shared, options.cooldown_secs) {
                shared.run.store(false, Ordering::Release);
                return Err(first_failure(handles)).context("error during cool-down");
            }
        }

        shared.run.store(false, Ordering::Release);
        let workers = join_workers(handles)?;
        debug!("all workers joined");

        Ok(JobResults {
            cpu_usage: cpu_usage_deltas(&cpu_before, &cpu_after),
            workers,
            targets,
        })
    }
}

/// Sleep for a phase, waking early if a worker signals an error. Returns
/// true when the phase ran to completion.
fn phase_sleep(shared: &Shared, secs: u32) -> bool {
    let guard = shared.init.lock().unwrap();
    let (_guard, timeout) = shared
        .error_cv
        .wait_timeout(guard, Duration::from_secs(secs as u64))
        .unwrap();
    timeout.timed_out() && !shared.error.load(Ordering::Acquire)
}

/// Join every worker, keeping results in worker-id order. The first worker
/// error wins; a panicking worker is reported as such.
fn join_workers(handles: Vec<JoinHandle<Result<WorkerResults>>>) -> Result<Vec<WorkerResults>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_err: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(r)) => results.push(r),
            Ok(Err(e)) => first_err = first_err.or(Some(e)),
            Err(_) => first_err = first_err.or_else(|| Some(anyhow::anyhow!("worker panicked"))),
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Reap the workers after a failed phase and surface the first error.
fn first_failure(handles: Vec<JoinHandle<Result<WorkerResults>>>) -> anyhow::Error {
    match join_workers(handles) {
        Err(e) => e,
        Ok(_) => anyhow::anyhow!("a worker signalled an error"),
    }
}

/// Convert two `/proc/stat` snapshots into per-CPU usage fractions.
fn cpu_usage_deltas(
    before: &BTreeMap<u32, CpuTimes>,
    after: &BTreeMap<u32, CpuTimes>,
) -> Vec<CpuUsage> {
    let mut usage = Vec::with_capacity(before.len());
    for (&cpu, b) in before {
        let Some(a) = after.get(&cpu) else {
            continue;
        };
        let total = (a.total() - b.total()).max(f64::EPSILON);
        let user = (a.user + a.nice) - (b.user + b.nice);
        let kernel = a.system - b.system;
        let iowait = a.iowait - b.iowait;
        let idle = a.idle - b.idle;

        usage.push(CpuUsage {
            cpu,
            usage: (user + kernel) / total,
            user: user / total,
            kernel: kernel / total,
            iowait: iowait / total,
            idle: idle / total,
        });
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeedMode;
    use crate::engine::EngineKind;
    use tempfile::TempDir;

    fn quick_options(engine: EngineKind) -> JobOptions {
        JobOptions {
            duration_secs: 1,
            warmup_secs: 0,
            cooldown_secs: 0,
            measure_latency: true,
            measure_iops_std_dev: true,
            io_bucket_ms: 100,
            seed: SeedMode::Seeded(1),
            disable_affinity: true,
            use_total_threads: false,
            total_threads: 1,
            engine,
        }
    }

    fn small_target(dir: &TempDir, name: &str) -> Target {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; 1024 * 1024]).unwrap();

        let mut t = Target::new(&path);
        t.size = 1024 * 1024;
        t.max_size = 1024 * 1024;
        t.block_size = 4096;
        t.stride = 4096;
        t.overlap = 1;
        t
    }

    #[test]
    fn test_sequential_read_job_end_to_end() {
        let dir = TempDir::new().unwrap();
        let target = small_target(&dir, "job.dat");
        let sys = SysInfo::probe(None).unwrap();

        let job = Job::new(quick_options(EngineKind::Posix), vec![target], sys.clone());
        let results = job.run().unwrap();

        assert_eq!(results.workers.len(), 1);
        let r = &results.workers[0].targets[0];
        assert!(r.read_iops_count > 0, "no reads completed in the window");
        assert_eq!(r.write_iops_count, 0);
        assert_eq!(r.read_iops_count + r.write_iops_count, r.iops_count);
        assert_eq!(r.read_bytes_count + r.write_bytes_count, r.bytes_count);
        assert_eq!(r.read_latency.sample_count(), r.read_iops_count);

        // one usage row per online CPU, every fraction sane
        assert_eq!(results.cpu_usage.len(), sys.online_cpus.len());
        for u in &results.cpu_usage {
            for v in [u.usage, u.user, u.kernel, u.iowait, u.idle] {
                assert!((0.0..=1.01).contains(&v), "cpu{} fraction {v}", u.cpu);
            }
        }
    }

    #[test]
    fn test_two_workers_share_target_with_total_threads() {
        let dir = TempDir::new().unwrap();
        let target = small_target(&dir, "shared.dat");
        let sys = SysInfo::probe(None).unwrap();

        let mut options = quick_options(EngineKind::Posix);
        options.use_total_threads = true;
        options.total_threads = 2;

        let job = Job::new(options, vec![target], sys);
        let results = job.run().unwrap();

        assert_eq!(results.workers.len(), 2);
        for (i, w) in results.workers.iter().enumerate() {
            assert_eq!(w.worker_id, i);
            assert_eq!(w.targets.len(), 1);
            assert!(w.targets[0].read_iops_count > 0);
        }
    }

    #[test]
    fn test_short_read_fails_the_job() {
        // a block size larger than the file forces a short completion, which
        // must abort the worker and invalidate the whole run
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.dat");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut target = Target::new(&path);
        target.size = 8192;
        target.max_size = 8192;
        target.block_size = 8192;
        target.stride = 8192;
        target.overlap = 1;

        let sys = SysInfo::probe(None).unwrap();
        let job = Job::new(quick_options(EngineKind::Posix), vec![target], sys);
        let err = job.run().unwrap_err();
        assert!(format!("{err:#}").contains("short read"), "got: {err:#}");
    }

    #[test]
    fn test_cpu_usage_deltas_fractions() {
        let mut before = BTreeMap::new();
        let mut after = BTreeMap::new();
        before.insert(
            0,
            CpuTimes {
                user: 100.0,
                nice: 0.0,
                system: 50.0,
                idle: 800.0,
                iowait: 50.0,
            },
        );
        after.insert(
            0,
            CpuTimes {
                user: 160.0,
                nice: 0.0,
                system: 70.0,
                idle: 860.0,
                iowait: 60.0,
            },
        );

        let usage = cpu_usage_deltas(&before, &after);
        assert_eq!(usage.len(), 1);
        let u = &usage[0];
        // deltas: user 60, kernel 20, idle 60, iowait 10, total 150
        assert!((u.usage - 80.0 / 150.0).abs() < 1e-9);
        assert!((u.user - 60.0 / 150.0).abs() < 1e-9);
        assert!((u.kernel - 20.0 / 150.0).abs() < 1e-9);
        assert!((u.iowait - 10.0 / 150.0).abs() < 1e-9);
        assert!((u.idle - 60.0 / 150.0).abs() < 1e-9);
    }
}
