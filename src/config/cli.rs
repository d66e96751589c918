//! CLI argument surface
//!
//! Single-letter flags in the tradition of disk benchmarking tools. Byte-size
//! arguments (`-b`, `-B`, `-c`, `-f`, `-g`, `-r`, `-s`, `-T`) accept `K`, `M`
//! and `G` suffixes plus `b` for "multiples of the block size", so they stay
//! strings here and are resolved against the parsed block size in
//! [`crate::config::resolve`].

use clap::Parser;

/// Flags that take an *optional* value must carry it attached (`-D1000`,
/// `-r4K`, `-si`), never space-separated; a detached token is always a
/// target. clap models this with `require_equals`, so this pass rewrites the
/// attached form into the `=` form before parsing.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    const OPTIONAL_VALUE_FLAGS: [char; 5] = ['D', 'r', 's', 'w', 'z'];

    args.into_iter()
        .map(|arg| {
            let mut chars = arg.chars();
            if chars.next() == Some('-') {
                if let Some(flag) = chars.next() {
                    let rest: String = chars.collect();
                    if OPTIONAL_VALUE_FLAGS.contains(&flag)
                        && !rest.is_empty()
                        && !rest.starts_with('=')
                    {
                        return format!("-{flag}={rest}");
                    }
                }
            }
            arg
        })
        .collect()
}

impl Cli {
    /// Parse a command line, applying the attached-value rewrite first.
    pub fn parse_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self::parse_from(normalize_args(args))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "iodrill", version)]
#[command(about = "Disk I/O benchmarking tool")]
#[command(long_about = "Disk I/O benchmarking tool. Specify the desired options followed by the \
name(s) of at least one file or block device to do I/O against. A write test will destroy \
existing data without warning.")]
pub struct Cli {
    /// Restrict worker threads to this CPU set, e.g. "0-3,7". By default
    /// threads are affinitized round-robin across all online CPUs.
    #[arg(short = 'a', value_name = "CPU_SET")]
    pub cpu_affinity: Option<String>,

    /// Block size in bytes, KiB(K), MiB(M) or GiB(G)
    #[arg(short = 'b', value_name = "SIZE[K|M|G]", default_value = "64K")]
    pub block_size: String,

    /// Base target offset; I/O stays inside [base, target-size)
    #[arg(short = 'B', value_name = "OFFSET[K|M|G|b]")]
    pub base_offset: Option<String>,

    /// Create target files of the given size before the run
    #[arg(short = 'c', value_name = "SIZE[K|M|G|b]")]
    pub create_files: Option<String>,

    /// Duration of the measurement period in seconds, not counting warm-up
    #[arg(short = 'd', value_name = "SECONDS", default_value_t = 10)]
    pub duration: u32,

    /// Calculate IOPS standard deviation, bucketing completions at the given
    /// millisecond interval (default 1000 ms)
    #[arg(
        short = 'D',
        value_name = "INTERVAL_MS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "1000"
    )]
    pub iops_std_dev: Option<u32>,

    /// Use only the first SIZE bytes of each target
    #[arg(short = 'f', value_name = "SIZE[K|M|G|b]")]
    pub target_size: Option<String>,

    /// Total number of threads, each operating on every target; conflicts
    /// with -t
    #[arg(short = 'F', value_name = "THREADS")]
    pub total_threads: Option<u32>,

    /// Throttle throughput per thread per target to the given number of
    /// bytes per millisecond
    #[arg(short = 'g', value_name = "BYTES_PER_MS[K|M|G|b]")]
    pub throughput: Option<String>,

    /// Measure per-operation latency histograms
    #[arg(short = 'L')]
    pub latency: bool,

    /// Disable CPU affinity
    #[arg(short = 'n')]
    pub no_affinity: bool,

    /// Outstanding I/O requests per thread per target (queue depth)
    #[arg(short = 'o', value_name = "OVERLAP", default_value_t = 2)]
    pub overlap: u32,

    /// Random I/O aligned to the given byte count (defaults to the block
    /// size); overrides -s
    #[arg(
        short = 'r',
        value_name = "ALIGNMENT[K|M|G|b]",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = ""
    )]
    pub random_align: Option<String>,

    /// Sequential stride. Prefix with 'i' for a single interlocked offset
    /// shared by all threads on a target (e.g. -si, -si1M)
    #[arg(
        short = 's',
        value_name = "[i]STRIDE[K|M|G|b]",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = ""
    )]
    pub stride: Option<String>,

    /// Caching options: d = O_DIRECT, s = O_SYNC, h = both
    #[arg(short = 'S', value_name = "d|s|h")]
    pub caching: Option<String>,

    /// Number of threads per target; conflicts with -F
    #[arg(short = 't', value_name = "THREADS")]
    pub threads_per_target: Option<u32>,

    /// Stride between the starting offsets of threads sharing a target
    #[arg(short = 'T', value_name = "STRIDE[K|M|G|b]")]
    pub thread_stride: Option<String>,

    /// Verbose diagnostics on stderr
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Percentage of write requests (0-100, default 0 = pure read)
    #[arg(
        short = 'w',
        value_name = "PERCENTAGE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "0"
    )]
    pub write_percentage: Option<u32>,

    /// Seconds to run before results start being recorded
    #[arg(short = 'W', value_name = "SECONDS", default_value_t = 5)]
    pub warmup: u32,

    /// I/O engine: k = kernel native AIO, p = POSIX AIO
    #[arg(short = 'x', value_name = "k|p")]
    pub engine: Option<String>,

    /// Random seed. With no value the seed comes from system entropy; without
    /// -z the seed is 0
    #[arg(
        short = 'z',
        value_name = "SEED",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = ""
    )]
    pub rand_seed: Option<String>,

    /// I/O buffer options: z = zero buffers, r = random buffers, s =
    /// separate write buffer. z and r conflict
    #[arg(short = 'Z', value_name = "[zrs]")]
    pub buffers: Option<String>,

    /// Target files or block devices
    #[arg(value_name = "FILE", required = true)]
    pub targets: Vec<String>,
}
