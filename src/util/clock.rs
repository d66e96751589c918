//! Monotonic clock for measurement timestamps
//!
//! Thin wrapper around `clock_gettime(CLOCK_MONOTONIC)` that yields absolute
//! monotonic timestamps usable across threads. `configure()` verifies the
//! clock resolution once at startup and fails the run if the kernel clock is
//! too coarse for latency measurement.

use crate::Result;
use anyhow::Context;

/// Process-wide monotonic time source.
///
/// All timestamps share the same (arbitrary) epoch, so differences between
/// values taken on different threads are meaningful. There are no wall-clock
/// semantics here.
pub struct PerfClock;

impl PerfClock {
    /// Verify that `CLOCK_MONOTONIC` is at least as fine as
    /// `min_resolution_ns`. Called once during startup, before any worker
    /// thread exists.
    pub fn configure(min_resolution_ns: u64) -> Result<()> {
        let mut res: libc::timespec = unsafe { std::mem::zeroed() };
        let err = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) };
        if err != 0 {
            return Err(std::io::Error::last_os_error()).context("clock_getres failed");
        }
        if res.tv_sec != 0 || res.tv_nsec as u64 > min_resolution_ns {
            anyhow::bail!(
                "monotonic clock resolution ({}s {}ns) is coarser than the required {}ns",
                res.tv_sec,
                res.tv_nsec,
                min_resolution_ns
            );
        }
        Ok(())
    }

    /// Absolute monotonic time in nanoseconds.
    #[inline]
    pub fn now_ns() -> u64 {
        let mut t: libc::timespec = unsafe { std::mem::zeroed() };
        // clock_gettime cannot fail for CLOCK_MONOTONIC with a valid timespec
        let err = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut t) };
        debug_assert_eq!(err, 0);
        t.tv_sec as u64 * 1_000_000_000 + t.tv_nsec as u64
    }

    /// Absolute monotonic time in microseconds.
    #[inline]
    pub fn now_us() -> u64 {
        Self::now_ns() / 1_000
    }

    /// Absolute monotonic time in milliseconds.
    #[inline]
    pub fn now_ms() -> u64 {
        Self::now_ns() / 1_000_000
    }
}
