//! iodrill - disk I/O benchmarking engine
//!
//! iodrill drives configurable read/write workloads against files or block
//! devices and reports throughput, I/O rates, CPU usage, latency percentiles
//! and IOPS stability.
//!
//! # Architecture
//!
//! - **Async I/O backends**: Linux native AIO (batch submission) and POSIX AIO
//!   (portable, per-op submission)
//! - **Worker threads**: each keeps a fixed number of operations in flight per
//!   target and records per-target measurements
//! - **Offset engines**: sequential with stride, thread-partitioned,
//!   interlocked shared cursor, random-aligned
//! - **Job lifecycle**: warm-up, timed measurement window, drain

pub mod config;
pub mod engine;
pub mod job;
pub mod output;
pub mod stats;
pub mod sysinfo;
pub mod target;
pub mod util;
pub mod worker;

pub use config::JobOptions;
pub use engine::IoBackend;
pub use job::Job;

/// Result type used throughout iodrill
pub type Result<T> = anyhow::Result<T>;
