//! Text report
//!
//! Mirrors the layout operators expect from disk benchmarking tools: the
//! command line echo, system info, the per-job parameter block, a CPU usage
//! table, one I/O table each for total, read and write traffic, and the
//! latency percentile table when latency measurement was on.
//!
//! MB means 2^20 bytes throughout. Latencies are recorded in microseconds
//! and reported in milliseconds.

use crate::config::{JobOptions, SeedMode};
use crate::job::JobResults;
use crate::stats::bucketizer::IoBucketizer;
use crate::stats::histogram::Histogram;
use crate::stats::TargetResults;
use crate::sysinfo::SysInfo;
use crate::target::AccessMode;
use crate::util::buffer::FillPolicy;
use crate::Result;

const MIB: f64 = (1u64 << 20) as f64;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Total,
    Read,
    Write,
}

pub fn print_report(
    cmd_line: &str,
    sys: &SysInfo,
    options: &JobOptions,
    results: &JobResults,
) -> Result<()> {
    println!("\nCommand Line: {cmd_line}\n");

    println!("System info:");
    println!("\tprocessor count: {}", sys.online_cpus.len());
    println!("\taffinity cpus: {}", sys.affinity_cpus.len());
    println!();

    print_parameters(options, results);

    println!("Results for job 1:\n");
    println!("test time:         {}s", options.duration_secs);
    println!("*****************************************************\n");

    print_cpu_table(sys, results);

    println!("Total IO");
    print_iops(options, results, Direction::Total)?;
    println!("Read IO");
    print_iops(options, results, Direction::Read)?;
    println!("Write IO");
    print_iops(options, results, Direction::Write)?;
    println!();

    if options.measure_latency {
        print_percentiles(results)?;
    }

    Ok(())
}

fn print_parameters(options: &JobOptions, results: &JobResults) {
    println!("Input parameters:\n");
    println!("\tjob:   1");
    println!("\t________");
    println!("\tduration: {}s", options.duration_secs);
    println!("\twarm up time: {}s", options.warmup_secs);
    if options.measure_latency {
        println!("\tmeasuring latency");
    }
    if options.measure_iops_std_dev {
        println!("\tgathering IOPs at intervals of {}ms", options.io_bucket_ms);
    }
    match options.seed {
        SeedMode::TimeSeeded => println!("\tusing system entropy for seed"),
        SeedMode::Seeded(seed) => println!("\trandom seed: {seed}"),
    }
    println!("\ttotal threads: {}", options.total_threads);

    for target in &results.targets {
        println!("\tpath: '{}'", target.path.display());
        println!("\t\tsize: {}B", target.size);
        if target.direct {
            println!("\t\tusing O_DIRECT");
        }
        if target.sync {
            println!("\t\tusing O_SYNC");
        }
        println!(
            "\t\tperforming mix test (read/write ratio: {}/{})",
            100 - target.write_percentage,
            target.write_percentage
        );
        println!("\t\tblock size: {}", target.block_size);
        match target.access {
            AccessMode::RandomAligned => {
                println!("\t\tusing random I/O (alignment: {})", target.stride)
            }
            AccessMode::SequentialInterlocked => {
                println!(
                    "\t\tusing interlocked sequential I/O (stride: {})",
                    target.stride
                )
            }
            AccessMode::SequentialPerThread => {
                println!("\t\tusing sequential I/O (stride: {})", target.stride)
            }
        }
        println!(
            "\t\tnumber of outstanding I/O operations: {}",
            target.overlap
        );
        if target.base_offset != 0 {
            println!("\t\tbase file offset: {} bytes", target.base_offset);
        }
        if target.max_size != target.size {
            println!("\t\tmax file size: {} bytes", target.max_size);
        }
        println!("\t\tthread stride size: {}", target.thread_stride);
        match target.fill {
            FillPolicy::Zero => println!("\t\tzeroing I/O buffers"),
            FillPolicy::Random => println!("\t\tfilling I/O buffers with random data"),
            FillPolicy::Ascending => {}
        }
        if target.separate_write_buffer {
            println!("\t\tseparating read and write buffers");
        }
        if !options.use_total_threads {
            println!("\t\tthreads per file: {}", target.threads_per_target);
        }
        println!("\t\tblock device: {}", target.device);
        println!("\t\tdevice scheduler: {}", target.scheduler);
    }
    println!();
}

fn print_cpu_table(sys: &SysInfo, results: &JobResults) {
    println!(" CPU  |  Usage  |   User  |  Kernel | IO Wait |   Idle ");
    println!("-------------------------------------------------------");

    let mut totals = [0.0f64; 5];
    for u in &results.cpu_usage {
        let cols = [u.usage, u.user, u.kernel, u.iowait, u.idle];
        print!("{:5} ", u.cpu);
        for (total, value) in totals.iter_mut().zip(cols) {
            let pct = value * 100.0;
            *total += pct;
            print!("| {pct:6.2}% ");
        }
        println!();
    }

    println!("-------------------------------------------------------");
    print!(" avg: ");
    let cpus = sys.online_cpus.len().max(1) as f64;
    for (i, total) in totals.iter().enumerate() {
        print!("| {:6.2}% ", total / cpus);
        if i == totals.len() - 1 {
            println!();
        }
    }
    println!();
}

fn bytes_for(r: &TargetResults, dir: Direction) -> u64 {
    match dir {
        Direction::Total => r.bytes_count,
        Direction::Read => r.read_bytes_count,
        Direction::Write => r.write_bytes_count,
    }
}

fn iops_for(r: &TargetResults, dir: Direction) -> u64 {
    match dir {
        Direction::Total => r.iops_count,
        Direction::Read => r.read_iops_count,
        Direction::Write => r.write_iops_count,
    }
}

/// Merge the per-direction bucketizers of one result row.
fn buckets_for(r: &TargetResults, dir: Direction) -> IoBucketizer {
    let mut merged = IoBucketizer::new();
    if dir != Direction::Write {
        merged.merge(&r.read_buckets);
    }
    if dir != Direction::Read {
        merged.merge(&r.write_buckets);
    }
    merged
}

/// Merge the per-direction latency histograms of one result row.
fn latency_for(r: &TargetResults, dir: Direction) -> Histogram {
    let mut merged = Histogram::new();
    if dir != Direction::Write {
        merged.merge(&r.read_latency);
    }
    if dir != Direction::Read {
        merged.merge(&r.write_latency);
    }
    merged
}

fn print_iops(options: &JobOptions, results: &JobResults, dir: Direction) -> Result<()> {
    let bar_extra = options.measure_iops_std_dev as usize * 12
        + options.measure_latency as usize * 24;
    let bar = "-".repeat(79 + bar_extra);

    println!(
        "thread |           bytes |         I/Os |       MB/s |  I/O per s |{}{} file",
        if options.measure_iops_std_dev {
            " IopsStdDev |"
        } else {
            ""
        },
        if options.measure_latency {
            " AvgLat(ms) | LatStdDev  |"
        } else {
            ""
        },
    );
    println!("{bar}");

    let duration = options.duration_secs as f64;
    let bucket_secs = options.io_bucket_ms as f64 / 1000.0;

    let mut total_bytes = 0u64;
    let mut total_iops = 0u64;
    let mut total_buckets = IoBucketizer::new();
    let mut total_latency = Histogram::new();

    for worker in &results.workers {
        for r in &worker.targets {
            let bytes = bytes_for(r, dir);
            let iops = iops_for(r, dir);
            print!(
                "{:6} | {:15} | {:12} | {:10.2} | {:10.2} ",
                worker.worker_id,
                bytes,
                iops,
                bytes as f64 / MIB / duration,
                iops as f64 / duration,
            );

            if options.measure_iops_std_dev {
                let buckets = buckets_for(r, dir);
                total_buckets.merge(&buckets);
                print!("| {:10.2} ", buckets.standard_deviation() / bucket_secs);
            }

            if options.measure_latency {
                let latency = latency_for(r, dir);
                if latency.is_empty() {
                    print!("|    {:8.3} |       N/A ", 0.0);
                } else {
                    print!(
                        "|    {:8.3} |    {:8.3} ",
                        latency.mean()? / 1000.0,
                        latency.standard_deviation()? / 1000.0,
                    );
                }
                total_latency.merge(&latency);
            }

            total_bytes += bytes;
            total_iops += iops;
            println!("| {} ({}B)", r.target.path.display(), r.target.size);
        }
    }

    println!("{bar}");
    print!(
        "total:   {:15} | {:12} | {:10.2} | {:10.2} ",
        total_bytes,
        total_iops,
        total_bytes as f64 / MIB / duration,
        total_iops as f64 / duration,
    );
    if options.measure_iops_std_dev {
        print!(
            "| {:10.2} ",
            total_buckets.standard_deviation() / bucket_secs
        );
    }
    if options.measure_latency {
        if total_latency.is_empty() {
            print!("|    {:8.3} |       N/A ", 0.0);
        } else {
            print!(
                "|    {:8.3} |    {:8.3} ",
                total_latency.mean()? / 1000.0,
                total_latency.standard_deviation()? / 1000.0,
            );
        }
    }
    println!("\n");

    Ok(())
}

fn print_percentiles(results: &JobResults) -> Result<()> {
    // read and write accumulate every per-(worker, target) histogram once;
    // total is their disjoint union
    let mut read = Histogram::new();
    let mut write = Histogram::new();
    for worker in &results.workers {
        for r in &worker.targets {
            read.merge(&r.read_latency);
            write.merge(&r.write_latency);
        }
    }
    let mut total = Histogram::new();
    total.merge(&read);
    total.merge(&write);

    if total.is_empty() {
        return Ok(());
    }

    let fmt_us = |value: u64| format!("{:10.3}", value as f64 / 1000.0);
    let cell = |h: &Histogram, p: Option<f64>| -> Result<String> {
        if h.is_empty() {
            return Ok(format!("{:>10}", "N/A"));
        }
        let value = match p {
            Some(p) => h.percentile(p)?,
            None => h.min()?,
        };
        Ok(fmt_us(value))
    };

    println!("  %-ile |  Read (ms) | Write (ms) | Total (ms)");
    println!("----------------------------------------------");

    println!(
        "    min | {} | {} | {}",
        cell(&read, None)?,
        cell(&write, None)?,
        fmt_us(total.min()?)
    );

    let percentiles: [(f64, &str); 13] = [
        (0.25, "25th"),
        (0.50, "50th"),
        (0.75, "75th"),
        (0.90, "90th"),
        (0.95, "95th"),
        (0.99, "99th"),
        (0.999, "3-nines"),
        (0.9999, "4-nines"),
        (0.99999, "5-nines"),
        (0.999999, "6-nines"),
        (0.9999999, "7-nines"),
        (0.99999999, "8-nines"),
        (0.999999999, "9-nines"),
    ];
    for (p, label) in percentiles {
        println!(
            "{label:>7} | {} | {} | {}",
            cell(&read, Some(p))?,
            cell(&write, Some(p))?,
            fmt_us(total.percentile(p)?)
        );
    }

    let max_cell = |h: &Histogram| -> Result<String> {
        if h.is_empty() {
            return Ok(format!("{:>10}", "N/A"));
        }
        Ok(fmt_us(h.max()?))
    };
    println!(
        "    max | {} | {} | {}",
        max_cell(&read)?,
        max_cell(&write)?,
        fmt_us(total.max()?)
    );
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpKind;
    use crate::target::Target;
    use std::sync::Arc;

    fn sample_results() -> (JobOptions, JobResults) {
        let mut target = Target::new("/tmp/report.dat");
        target.size = 1024 * 1024;
        target.max_size = 1024 * 1024;
        let target = Arc::new(target);

        let mut r = TargetResults::new(Arc::clone(&target));
        r.read_buckets.initialize(1000, 2);
        r.write_buckets.initialize(1000, 2);
        for i in 0..100u64 {
            let kind = if i % 4 == 0 { OpKind::Write } else { OpKind::Read };
            r.record_completion(kind, 4096);
            r.record_latency(kind, 100 + i);
            r.record_bucket(kind, i * 20);
        }

        let options = JobOptions {
            duration_secs: 2,
            warmup_secs: 0,
            cooldown_secs: 0,
            measure_latency: true,
            measure_iops_std_dev: true,
            io_bucket_ms: 1000,
            seed: SeedMode::Seeded(0),
            disable_affinity: true,
            use_total_threads: false,
            total_threads: 1,
            engine: crate::engine::EngineKind::Posix,
        };
        let results = JobResults {
            cpu_usage: vec![],
            workers: vec![crate::stats::WorkerResults {
                worker_id: 0,
                targets: vec![r],
            }],
            targets: vec![target],
        };
        (options, results)
    }

    #[test]
    fn test_direction_selectors() {
        let (_, results) = sample_results();
        let r = &results.workers[0].targets[0];
        assert_eq!(bytes_for(r, Direction::Total), 100 * 4096);
        assert_eq!(
            iops_for(r, Direction::Read) + iops_for(r, Direction::Write),
            iops_for(r, Direction::Total)
        );
    }

    #[test]
    fn test_latency_merge_is_disjoint_union() {
        let (_, results) = sample_results();
        let r = &results.workers[0].targets[0];
        let total = latency_for(r, Direction::Total);
        assert_eq!(
            total.sample_count(),
            r.read_latency.sample_count() + r.write_latency.sample_count()
        );
    }

    #[test]
    fn test_print_report_runs_clean() {
        let (options, results) = sample_results();
        let sys = SysInfo::probe(None).unwrap();
        print_report("iodrill -L -D /tmp/report.dat", &sys, &options, &results).unwrap();
    }

    #[test]
    fn test_print_report_without_samples() {
        let (mut options, mut results) = sample_results();
        results.workers[0].targets[0] = TargetResults::new(Arc::clone(&results.targets[0]));
        options.measure_iops_std_dev = false;
        let sys = SysInfo::probe(None).unwrap();
        print_report("iodrill /tmp/report.dat", &sys, &options, &results).unwrap();
    }
}
