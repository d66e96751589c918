//! Configuration resolution and validation
//!
//! Turns the raw CLI surface into a validated [`JobOptions`] plus one
//! [`Target`] per positional argument. Every `ConfigError` the engine can
//! detect is surfaced here, before any file is touched for I/O.

pub mod cli;

use std::fs;

use anyhow::Context;

use crate::config::cli::Cli;
use crate::engine::EngineKind;
use crate::sysinfo;
use crate::target::{AccessMode, Target};
use crate::util::buffer::FillPolicy;
use crate::Result;

/// How worker RNG streams are seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    Seeded(u64),
    TimeSeeded,
}

/// Job-wide options, fixed before any worker starts.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub duration_secs: u32,
    pub warmup_secs: u32,
    /// Seconds to keep I/O flowing after the window closes; 0 skips the phase.
    pub cooldown_secs: u32,
    pub measure_latency: bool,
    pub measure_iops_std_dev: bool,
    pub io_bucket_ms: u32,
    pub seed: SeedMode,
    pub disable_affinity: bool,
    /// All threads operate on all targets (-F) rather than each target
    /// getting its own group of threads (-t).
    pub use_total_threads: bool,
    pub total_threads: u32,
    pub engine: EngineKind,
}

/// Parse a byte count with an optional `K`/`M`/`G`/`b` suffix, where `b`
/// multiplies by the block size.
pub fn parse_byte_size(arg: &str, block_size: u64) -> Result<u64> {
    let digits_end = arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len());
    let (digits, suffix) = arg.split_at(digits_end);
    if digits.is_empty() {
        anyhow::bail!("invalid byte size '{arg}'");
    }

    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid byte size '{arg}'"))?;
    let multiplier = match suffix {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "b" => block_size,
        _ => anyhow::bail!("invalid size suffix '{suffix}' in '{arg}'"),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("byte size '{arg}' overflows"))
}

/// Resolve and validate the whole command line.
pub fn resolve(cli: &Cli) -> Result<(JobOptions, Vec<Target>)> {
    let block_size = parse_byte_size(&cli.block_size, 1).context("invalid block size (-b)")?;
    if block_size == 0 || !block_size.is_power_of_two() {
        anyhow::bail!("block size (-b) must be a non-zero power of two");
    }

    let base_offset = match &cli.base_offset {
        Some(s) => parse_byte_size(s, block_size).context("invalid base offset (-B)")?,
        None => 0,
    };

    let create_size = match &cli.create_files {
        Some(s) => {
            let size = parse_byte_size(s, block_size).context("invalid create size (-c)")?;
            if size == 0 {
                anyhow::bail!("create size (-c) must be non-zero");
            }
            Some(size)
        }
        None => None,
    };

    if cli.duration == 0 {
        anyhow::bail!("duration (-d) must be non-zero");
    }

    let measure_iops_std_dev = cli.iops_std_dev.is_some();
    let io_bucket_ms = cli.iops_std_dev.unwrap_or(1000);
    if measure_iops_std_dev && io_bucket_ms == 0 {
        anyhow::bail!("IOPS bucket interval (-D) must be non-zero");
    }

    let max_size_arg = match &cli.target_size {
        Some(s) => {
            let size = parse_byte_size(s, block_size).context("invalid target size (-f)")?;
            if size == 0 {
                anyhow::bail!("target size (-f) must be non-zero");
            }
            Some(size)
        }
        None => None,
    };

    if cli.total_threads.is_some() && cli.threads_per_target.is_some() {
        anyhow::bail!("can't use -t and -F at the same time");
    }
    let use_total_threads = cli.total_threads.is_some();
    let threads_per_target = cli.threads_per_target.unwrap_or(1);
    if !use_total_threads && threads_per_target == 0 {
        anyhow::bail!("threads per target (-t) must be non-zero");
    }

    let max_throughput = match &cli.throughput {
        Some(s) => {
            let cap = parse_byte_size(s, block_size).context("invalid throughput cap (-g)")?;
            if cap == 0 {
                anyhow::bail!("throughput cap (-g) must be non-zero");
            }
            cap
        }
        None => 0,
    };

    if cli.overlap == 0 {
        anyhow::bail!("overlap (-o) must be non-zero");
    }

    // access mode: random overrides interlocked overrides plain sequential
    let (access, stride) = if let Some(align) = &cli.random_align {
        let stride = if align.is_empty() {
            block_size
        } else {
            let a = parse_byte_size(align, block_size).context("invalid random alignment (-r)")?;
            if a == 0 {
                anyhow::bail!("random alignment (-r) must be non-zero");
            }
            a
        };
        (AccessMode::RandomAligned, stride)
    } else if let Some(arg) = &cli.stride {
        let (interlocked, rest) = match arg.strip_prefix('i') {
            Some(rest) => (true, rest),
            None => (false, arg.as_str()),
        };
        let stride = if rest.is_empty() {
            block_size
        } else {
            let s = parse_byte_size(rest, block_size).context("invalid stride (-s)")?;
            if s == 0 {
                anyhow::bail!("stride (-s) must be non-zero");
            }
            s
        };
        let access = if interlocked {
            AccessMode::SequentialInterlocked
        } else {
            AccessMode::SequentialPerThread
        };
        (access, stride)
    } else {
        (AccessMode::SequentialPerThread, block_size)
    };

    let (mut direct, mut sync) = (false, false);
    if let Some(arg) = &cli.caching {
        for c in arg.chars() {
            match c {
                'd' => direct = true,
                's' => sync = true,
                'h' => {
                    direct = true;
                    sync = true;
                }
                other => anyhow::bail!("invalid caching option -S{other}"),
            }
        }
    }

    let thread_stride = match &cli.thread_stride {
        Some(s) => {
            let stride = parse_byte_size(s, block_size).context("invalid thread stride (-T)")?;
            if access == AccessMode::SequentialInterlocked && stride != 0 {
                anyhow::bail!("thread stride (-T) must be 0 when using an interlocked offset (-si)");
            }
            stride
        }
        None => 0,
    };

    let write_percentage = cli.write_percentage.unwrap_or(0);
    if write_percentage > 100 {
        anyhow::bail!("write percentage (-w) must be 0-100");
    }

    let engine = match cli.engine.as_deref() {
        None | Some("k") => EngineKind::Kernel,
        Some("p") => EngineKind::Posix,
        Some(other) => anyhow::bail!("invalid I/O engine '{other}', choose from k, p"),
    };

    let seed = match cli.rand_seed.as_deref() {
        None => SeedMode::Seeded(0),
        Some("") => SeedMode::TimeSeeded,
        Some(s) => SeedMode::Seeded(
            s.parse()
                .with_context(|| format!("invalid random seed '{s}'"))?,
        ),
    };

    let (mut zero_buffers, mut rand_buffers, mut separate_buffers) = (false, false, false);
    if let Some(arg) = &cli.buffers {
        for c in arg.chars() {
            match c {
                'z' => zero_buffers = true,
                'r' => rand_buffers = true,
                's' => separate_buffers = true,
                other => anyhow::bail!("invalid io-buffers option -Z{other}"),
            }
        }
        if zero_buffers && rand_buffers {
            anyhow::bail!("conflicting buffer options: -Zz and -Zr");
        }
    }
    let fill = if zero_buffers {
        FillPolicy::Zero
    } else if rand_buffers {
        FillPolicy::Random
    } else {
        FillPolicy::Ascending
    };

    let mut targets = Vec::with_capacity(cli.targets.len());
    for path in &cli.targets {
        let mut target = Target::new(path);
        target.block_size = block_size;
        target.base_offset = base_offset;
        target.stride = stride;
        target.thread_stride = thread_stride;
        target.access = access;
        target.overlap = cli.overlap;
        target.write_percentage = write_percentage;
        target.threads_per_target = threads_per_target;
        target.direct = direct;
        target.sync = sync;
        target.fill = fill;
        target.separate_write_buffer = separate_buffers;
        target.max_throughput = max_throughput;
        target.create_file = create_size.is_some();

        resolve_target_size(&mut target, create_size, max_size_arg)?;
        validate_target(&target, cli.total_threads)?;

        if access == AccessMode::SequentialInterlocked {
            target.prime_cursor();
        }
        targets.push(target);
    }

    let total_threads = match cli.total_threads {
        Some(n) => {
            if n == 0 {
                anyhow::bail!("total threads (-F) must be non-zero");
            }
            n
        }
        None => threads_per_target * targets.len() as u32,
    };

    let options = JobOptions {
        duration_secs: cli.duration,
        warmup_secs: cli.warmup,
        cooldown_secs: 0,
        measure_latency: cli.latency,
        measure_iops_std_dev,
        io_bucket_ms,
        seed,
        disable_affinity: cli.no_affinity,
        use_total_threads,
        total_threads,
        engine,
    };

    Ok((options, targets))
}

/// Establish the target's actual size and its usable `max_size`.
fn resolve_target_size(
    target: &mut Target,
    create_size: Option<u64>,
    max_size_arg: Option<u64>,
) -> Result<()> {
    let meta = match fs::metadata(&target.path) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| format!("stat on target {}", target.path.display()))
        }
    };

    let is_device = sysinfo::is_block_device(&target.path);

    match create_size {
        Some(size) => {
            if is_device {
                anyhow::bail!(
                    "target {} is an existing device, don't use -c",
                    target.path.display()
                );
            }
            // an existing file at least as large doesn't need re-creation
            if let Some(meta) = &meta {
                if meta.len() >= size {
                    target.create_file = false;
                }
            }
            target.size = size;
        }
        None => {
            let meta = meta.ok_or_else(|| {
                anyhow::anyhow!("target {} does not exist", target.path.display())
            })?;
            target.size = if is_device {
                use std::os::unix::fs::MetadataExt;
                sysinfo::partition_size(meta.rdev()).with_context(|| {
                    format!("sizing block device {}", target.path.display())
                })?
            } else {
                meta.len()
            };
        }
    }

    target.max_size = max_size_arg.unwrap_or(target.size);
    if target.max_size > target.size {
        anyhow::bail!(
            "target size (-f) can't be larger than the actual size of {}",
            target.path.display()
        );
    }
    Ok(())
}

fn validate_target(target: &Target, total_threads: Option<u32>) -> Result<()> {
    if target.max_size <= target.base_offset
        || target.max_size - target.base_offset < target.block_size
    {
        anyhow::bail!(
            "target {} is too small for a block size of {} bytes at base offset {}",
            target.path.display(),
            target.block_size,
            target.base_offset
        );
    }

    if target.direct {
        let mask = target.sector_size - 1;
        if target.block_size & mask != 0
            || target.stride & mask != 0
            || target.thread_stride & mask != 0
        {
            anyhow::bail!(
                "O_DIRECT requires block size, stride and thread stride (-b, -s, -r, -T) \
                 to be multiples of the {}-byte sector size",
                target.sector_size
            );
        }
    }

    // starting offsets of all threads must stay inside the usable interval
    let threads = total_threads.unwrap_or(target.threads_per_target);
    let max_offset = target.max_size - target.base_offset - target.block_size;
    if threads > 1 && target.thread_stride * (threads as u64 - 1) > max_offset {
        anyhow::bail!(
            "thread starting offsets would overrun {}; reduce -T, -t or -F, or grow the target",
            target.path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["iodrill".to_string()];
        full.extend(args.iter().map(|s| s.to_string()));
        Cli::parse_args(full)
    }

    fn scratch_file(dir: &TempDir, size: usize) -> String {
        let path = dir.path().join("cfg.dat");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_byte_size_suffixes() {
        assert_eq!(parse_byte_size("512", 1).unwrap(), 512);
        assert_eq!(parse_byte_size("4K", 1).unwrap(), 4096);
        assert_eq!(parse_byte_size("2M", 1).unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_byte_size("1G", 1).unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("8b", 4096).unwrap(), 32768);
        assert_eq!(parse_byte_size("0", 1).unwrap(), 0);
    }

    #[test]
    fn test_parse_byte_size_rejects_garbage() {
        assert!(parse_byte_size("", 1).is_err());
        assert!(parse_byte_size("K", 1).is_err());
        assert!(parse_byte_size("12Q", 1).is_err());
        assert!(parse_byte_size("4KB", 1).is_err());
        assert!(parse_byte_size("99999999999G", 1).is_err());
    }

    #[test]
    fn test_resolve_defaults() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let (opts, targets) = resolve(&cli(&[&path])).unwrap();

        assert_eq!(opts.duration_secs, 10);
        assert_eq!(opts.warmup_secs, 5);
        assert_eq!(opts.total_threads, 1);
        assert_eq!(opts.engine, EngineKind::Kernel);
        assert_eq!(opts.seed, SeedMode::Seeded(0));
        assert!(!opts.measure_latency);

        let t = &targets[0];
        assert_eq!(t.block_size, 64 * 1024);
        assert_eq!(t.stride, 64 * 1024);
        assert_eq!(t.size, 1024 * 1024);
        assert_eq!(t.max_size, 1024 * 1024);
        assert_eq!(t.access, AccessMode::SequentialPerThread);
        assert_eq!(t.overlap, 2);
    }

    #[test]
    fn test_t_and_f_conflict() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let err = resolve(&cli(&["-t2", "-F4", &path])).unwrap_err();
        assert!(err.to_string().contains("-t and -F"));
    }

    #[test]
    fn test_buffer_policy_conflict() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        assert!(resolve(&cli(&["-Zzr", &path])).is_err());

        let (_, targets) = resolve(&cli(&["-Zzs", &path])).unwrap();
        assert_eq!(targets[0].fill, FillPolicy::Zero);
        assert!(targets[0].separate_write_buffer);
    }

    #[test]
    fn test_interlocked_rejects_thread_stride() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        assert!(resolve(&cli(&["-si", "-T4K", &path])).is_err());
        // a zero thread stride is fine
        assert!(resolve(&cli(&["-si", "-T0", &path])).is_ok());
    }

    #[test]
    fn test_random_overrides_stride() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let (_, targets) = resolve(&cli(&["-b4K", "-r8K", "-s16K", &path])).unwrap();
        assert_eq!(targets[0].access, AccessMode::RandomAligned);
        assert_eq!(targets[0].stride, 8192);

        let (_, targets) = resolve(&cli(&["-b4K", "-r", &path])).unwrap();
        assert_eq!(targets[0].stride, 4096);
    }

    #[test]
    fn test_interlocked_stride_parsing() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let (_, targets) = resolve(&cli(&["-b4K", "-si8K", &path])).unwrap();
        assert_eq!(targets[0].access, AccessMode::SequentialInterlocked);
        assert_eq!(targets[0].stride, 8192);

        let (_, targets) = resolve(&cli(&["-b4K", "-si", &path])).unwrap();
        assert_eq!(targets[0].stride, 4096);
    }

    #[test]
    fn test_direct_requires_aligned_sizes() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let err = resolve(&cli(&["-b1K", "-Sd", &path])).unwrap_err();
        assert!(err.to_string().contains("O_DIRECT"));

        assert!(resolve(&cli(&["-b4K", "-Sd", &path])).is_ok());
    }

    #[test]
    fn test_target_too_small_for_block() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 4096);
        assert!(resolve(&cli(&["-b64K", &path])).is_err());
        assert!(resolve(&cli(&["-b4K", &path])).is_ok());
    }

    #[test]
    fn test_max_size_cannot_exceed_actual() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 64 * 1024);
        assert!(resolve(&cli(&["-b4K", "-f1M", &path])).is_err());
        assert!(resolve(&cli(&["-b4K", "-f32K", &path])).is_ok());
    }

    #[test]
    fn test_thread_offsets_must_fit() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 64 * 1024);
        // 4 threads spaced 32K apart overrun a 64K target
        assert!(resolve(&cli(&["-b4K", "-t4", "-T32K", &path])).is_err());
        assert!(resolve(&cli(&["-b4K", "-t2", "-T16K", &path])).is_ok());
    }

    #[test]
    fn test_missing_target_without_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.dat");
        assert!(resolve(&cli(&[path.to_str().unwrap()])).is_err());
    }

    #[test]
    fn test_create_sets_size_without_touching_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.dat");
        let (_, targets) = resolve(&cli(&["-c1M", "-b4K", path.to_str().unwrap()])).unwrap();
        assert!(targets[0].create_file);
        assert_eq!(targets[0].size, 1024 * 1024);
        // resolution never creates the file; setup does
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_large_file_skips_creation() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 2 * 1024 * 1024);
        let (_, targets) = resolve(&cli(&["-c1M", "-b4K", &path])).unwrap();
        assert!(!targets[0].create_file);
        assert_eq!(targets[0].size, 1024 * 1024);
    }

    #[test]
    fn test_write_percentage_bounds() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        assert!(resolve(&cli(&["-w101", &path])).is_err());
        let (_, targets) = resolve(&cli(&["-w30", &path])).unwrap();
        assert_eq!(targets[0].write_percentage, 30);
    }

    #[test]
    fn test_engine_selection() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let (opts, _) = resolve(&cli(&["-xp", &path])).unwrap();
        assert_eq!(opts.engine, EngineKind::Posix);
        assert!(resolve(&cli(&["-xq", &path])).is_err());
    }

    #[test]
    fn test_seed_modes() {
        let dir = TempDir::new().unwrap();
        let path = scratch_file(&dir, 1024 * 1024);
        let (opts, _) = resolve(&cli(&["-z", &path])).unwrap();
        assert_eq!(opts.seed, SeedMode::TimeSeeded);
        let (opts, _) = resolve(&cli(&["-z42", &path])).unwrap();
        assert_eq!(opts.seed, SeedMode::Seeded(42));
    }

    #[test]
    fn test_total_threads_sums_targets() {
        let dir = TempDir::new().unwrap();
        let a = scratch_file(&dir, 1024 * 1024);
        let b = dir.path().join("b.dat");
        std::fs::write(&b, vec![0u8; 1024 * 1024]).unwrap();

        let (opts, targets) =
            resolve(&cli(&["-t3", &a, b.to_str().unwrap()])).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(opts.total_threads, 6);
        assert!(!opts.use_total_threads);

        let (opts, _) = resolve(&cli(&["-F4", &a, b.to_str().unwrap()])).unwrap();
        assert_eq!(opts.total_threads, 4);
        assert!(opts.use_total_threads);
    }
}
