//! Asynchronous I/O submission and completion
//!
//! Operations are organized into groups; a group belongs to exactly one
//! worker thread, which enqueues, submits and waits on it. The backend keeps
//! per-group in-flight bookkeeping so a completed operation can be handed
//! back to its owner, mutated (offset, kind, timestamp) and resubmitted
//! without reallocation.
//!
//! Two backends share the contract:
//!
//! - [`kernel::KernelAio`]: Linux native AIO. One `io_submit` per batch, one
//!   completion pulled per `io_getevents` call.
//! - [`posix::PosixAio`]: POSIX AIO. One `aio_read`/`aio_write` syscall per
//!   operation, `aio_suspend` to block until any completes.
//!
//! Both guarantee exactly one completion per accepted submission, never drop
//! an operation silently, and never move operations between groups.

pub mod kernel;
pub mod posix;

use std::os::unix::io::RawFd;

use crate::Result;

/// Direction of a single I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Read => write!(f, "read"),
            OpKind::Write => write!(f, "write"),
        }
    }
}

/// One asynchronous operation.
///
/// Constructed once per slot of a worker's overlap budget and recycled for
/// the whole run: on each completion the worker re-stamps the timestamp,
/// moves the offset, possibly flips the kind, and enqueues it again. Both
/// payload pointers are retained; the active one is selected by `kind`.
///
/// # Safety
///
/// The buffer pointers must stay valid from `submit` until the completion is
/// returned by `wait` (workers own their buffers and drain all in-flight
/// operations before dropping them).
#[derive(Debug)]
pub struct IoOp {
    pub kind: OpKind,
    pub fd: RawFd,
    pub offset: u64,
    pub nbytes: usize,
    pub read_buf: *mut u8,
    pub write_buf: *mut u8,
    /// Owning group; operations never migrate between groups.
    pub group: usize,
    /// Index of the owning per-thread target state within the worker.
    pub target: usize,
    /// Monotonic submission timestamp in microseconds.
    pub submitted_at_us: u64,

    result: i64,
    error: i32,
}

// Raw payload pointers are only dereferenced by the kernel and by the single
// owning worker thread.
unsafe impl Send for IoOp {}

impl IoOp {
    /// The payload buffer selected by the operation kind.
    #[inline]
    pub fn buf(&self) -> *mut u8 {
        match self.kind {
            OpKind::Read => self.read_buf,
            OpKind::Write => self.write_buf,
        }
    }

    /// Bytes transferred on success, negative errno on failure. Meaningful
    /// only after the op was returned by `wait`.
    #[inline]
    pub fn result(&self) -> i64 {
        self.result
    }

    /// OS error code of the completion; zero on success.
    #[inline]
    pub fn os_error(&self) -> i32 {
        self.error
    }

    /// Record the OS completion status.
    pub(crate) fn finish(&mut self, res: i64) {
        if res < 0 {
            self.result = res;
            self.error = (-res) as i32;
        } else {
            self.result = res;
            self.error = 0;
        }
    }

    pub(crate) fn finish_with_error(&mut self, res: i64, errno: i32) {
        self.result = res;
        self.error = errno;
    }
}

/// Which backend drives the I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Linux native AIO, batch submission.
    Kernel,
    /// POSIX AIO, portable per-op submission.
    Posix,
}

/// The I/O manager, a tagged variant over the two backends.
///
/// Shared by the controller and all workers; group state is internally
/// synchronized, but each group is only ever driven by its owning worker.
pub enum IoBackend {
    Kernel(kernel::KernelAio),
    Posix(posix::PosixAio),
}

impl IoBackend {
    pub fn new(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Kernel => IoBackend::Kernel(kernel::KernelAio::new()),
            EngineKind::Posix => IoBackend::Posix(posix::PosixAio::new()),
        }
    }

    /// One-time global initialization for `total_outstanding` concurrent
    /// operations across all groups.
    pub fn start(&self, total_outstanding: usize) -> Result<()> {
        match self {
            IoBackend::Kernel(b) => b.start(total_outstanding),
            IoBackend::Posix(b) => b.start(total_outstanding),
        }
    }

    /// Register a group able to hold `outstanding` concurrent operations.
    /// Fails if the group id is already taken.
    pub fn create_group(&self, group: usize, outstanding: usize) -> Result<()> {
        match self {
            IoBackend::Kernel(b) => b.create_group(group, outstanding),
            IoBackend::Posix(b) => b.create_group(group, outstanding),
        }
    }

    /// Allocate an operation record, configured but not yet queued.
    #[allow(clippy::too_many_arguments)]
    pub fn construct(
        &self,
        kind: OpKind,
        fd: RawFd,
        offset: u64,
        read_buf: *mut u8,
        write_buf: *mut u8,
        nbytes: usize,
        group: usize,
        target: usize,
        timestamp_us: u64,
    ) -> IoOp {
        IoOp {
            kind,
            fd,
            offset,
            nbytes,
            read_buf,
            write_buf,
            group,
            target,
            submitted_at_us: timestamp_us,
            result: 0,
            error: 0,
        }
    }

    /// Append an operation to its group's pending queue.
    pub fn enqueue(&self, op: IoOp) -> Result<()> {
        match self {
            IoBackend::Kernel(b) => b.enqueue(op),
            IoBackend::Posix(b) => b.enqueue(op),
        }
    }

    /// Hand all pending operations of the group to the OS.
    pub fn submit(&self, group: usize) -> Result<()> {
        match self {
            IoBackend::Kernel(b) => b.submit(group),
            IoBackend::Posix(b) => b.submit(group),
        }
    }

    /// Block until one operation in the group completes and return it with
    /// its OS result attached.
    pub fn wait(&self, group: usize) -> Result<IoOp> {
        match self {
            IoBackend::Kernel(b) => b.wait(group),
            IoBackend::Posix(b) => b.wait(group),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_selects_the_buffer() {
        let mut read_buf = [0u8; 8];
        let mut write_buf = [0u8; 8];
        let backend = IoBackend::new(EngineKind::Posix);
        let mut op = backend.construct(
            OpKind::Read,
            -1,
            0,
            read_buf.as_mut_ptr(),
            write_buf.as_mut_ptr(),
            8,
            0,
            0,
            0,
        );

        assert_eq!(op.buf(), read_buf.as_mut_ptr());
        op.kind = OpKind::Write;
        assert_eq!(op.buf(), write_buf.as_mut_ptr());
    }

    #[test]
    fn test_finish_splits_result_and_errno() {
        let backend = IoBackend::new(EngineKind::Posix);
        let mut op = backend.construct(
            OpKind::Read,
            -1,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
            0,
            0,
            0,
        );

        op.finish(4096);
        assert_eq!(op.result(), 4096);
        assert_eq!(op.os_error(), 0);

        op.finish(-(libc::EIO as i64));
        assert_eq!(op.os_error(), libc::EIO);
        assert!(op.result() < 0);
    }
}
