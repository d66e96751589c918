//! Target model and offset generation
//!
//! A [`Target`] describes one file or block device under test, shared by every
//! worker assigned to it. All per-run parameters are fixed before workers
//! start; the only mutable piece is the interlocked cursor, a mutex-guarded
//! scalar that threads in interlocked mode advance cooperatively.
//!
//! Offset generation precedence: random-aligned overrides interlocked, which
//! overrides plain per-thread sequential access.

pub mod setup;

use std::path::PathBuf;
use std::sync::Mutex;

use crate::util::buffer::FillPolicy;
use crate::util::rng::WorkerRng;

/// How successive offsets are generated on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Each thread advances its own cursor by `stride`, starting at
    /// `base_offset + rel_thread_id * thread_stride`.
    SequentialPerThread,
    /// All threads on the target share one cursor under a mutex, issuing a
    /// single cooperative sequential pattern. Requires `thread_stride == 0`.
    SequentialInterlocked,
    /// Uniform random offsets aligned to `stride`.
    RandomAligned,
}

/// One file or device under test. Immutable once workers start, except for
/// the interlocked cursor.
#[derive(Debug)]
pub struct Target {
    pub path: PathBuf,
    /// Actual size of the file or device in bytes.
    pub size: u64,
    pub block_size: u64,
    pub base_offset: u64,
    /// I/O stays inside `[base_offset, max_size)`.
    pub max_size: u64,
    /// Distance between successive offsets; doubles as the random alignment.
    pub stride: u64,
    /// Gap between starting offsets of threads sharing this target.
    pub thread_stride: u64,
    pub access: AccessMode,
    /// Outstanding operations per thread on this target.
    pub overlap: u32,
    /// 0..=100; an op is a write when the coin flip lands at or below this.
    pub write_percentage: u32,
    pub threads_per_target: u32,
    pub direct: bool,
    pub sync: bool,
    /// Payload content for I/O buffers.
    pub fill: FillPolicy,
    /// Use a distinct single-block buffer for writes.
    pub separate_write_buffer: bool,
    /// Throughput cap in bytes per millisecond; 0 means unlimited.
    pub max_throughput: u64,
    pub create_file: bool,
    /// Physical sector size; buffer and offset alignment unit under O_DIRECT.
    pub sector_size: u64,
    /// Backing block device name, probed during setup.
    pub device: String,
    /// The device's I/O scheduler, probed during setup.
    pub scheduler: String,

    /// Shared cursor for interlocked mode, holding the last issued offset.
    cursor: Mutex<u64>,
}

impl Target {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            block_size: 64 * 1024,
            base_offset: 0,
            max_size: 0,
            stride: 64 * 1024,
            thread_stride: 0,
            access: AccessMode::SequentialPerThread,
            overlap: 2,
            write_percentage: 0,
            threads_per_target: 1,
            direct: false,
            sync: false,
            fill: FillPolicy::Ascending,
            separate_write_buffer: false,
            max_throughput: 0,
            create_file: false,
            sector_size: 512,
            device: String::new(),
            scheduler: String::new(),
            cursor: Mutex::new(0),
        }
    }

    /// Reset the interlocked cursor to the base offset. Called once during
    /// config resolution, before any worker exists.
    pub fn prime_cursor(&mut self) {
        *self.cursor.get_mut().unwrap() = self.base_offset;
    }

    /// Flags for `open(2)` beyond read/write access.
    pub fn custom_open_flags(&self) -> i32 {
        let mut flags = 0;
        if self.direct {
            flags |= libc::O_DIRECT;
        }
        if self.sync {
            flags |= libc::O_SYNC;
        }
        flags
    }

    /// Where a thread's own sequential cursor starts on this target.
    #[inline]
    pub fn thread_base(&self, rel_thread_id: u32) -> u64 {
        self.base_offset + rel_thread_id as u64 * self.thread_stride
    }

    /// Wrap an offset back to the thread base once a block at `offset` would
    /// cross `max_size`.
    #[inline]
    fn overflow_correct(&self, rel_thread_id: u32, offset: u64) -> u64 {
        if offset + self.block_size > self.max_size {
            self.thread_base(rel_thread_id)
        } else {
            offset
        }
    }

    /// First offset a thread issues on this target.
    pub fn start_offset(&self, rel_thread_id: u32, rng: &mut WorkerRng) -> u64 {
        match self.access {
            AccessMode::RandomAligned => self.random_offset(rng),
            // The interlocked cursor starts at the base offset and
            // thread_stride is zero, so the first advance is the general
            // next-offset rule.
            AccessMode::SequentialInterlocked => self.next_offset(rel_thread_id, 0, rng),
            AccessMode::SequentialPerThread => self.thread_base(rel_thread_id),
        }
    }

    /// Offset for the next operation, given the previous one.
    pub fn next_offset(&self, rel_thread_id: u32, current: u64, rng: &mut WorkerRng) -> u64 {
        match self.access {
            AccessMode::RandomAligned => self.random_offset(rng),
            AccessMode::SequentialInterlocked => {
                // current is ignored; all threads advance the shared cursor
                let mut cursor = self.cursor.lock().unwrap();
                *cursor = self.overflow_correct(rel_thread_id, *cursor + self.stride);
                *cursor
            }
            AccessMode::SequentialPerThread => {
                self.overflow_correct(rel_thread_id, current + self.stride)
            }
        }
    }

    /// Uniform random offset aligned to the stride, never placing a block
    /// past `max_size`.
    fn random_offset(&self, rng: &mut WorkerRng) -> u64 {
        let alignment = self.stride;
        let mut interval = self.max_size - self.base_offset - self.block_size;
        interval -= interval % alignment;
        let range = interval / alignment + 1;

        self.base_offset + rng.offset_index(range) * alignment
    }
}
