//! POSIX AIO backend
//!
//! Portable fallback built on `aio_read`/`aio_write`/`aio_suspend`. Unlike
//! the native backend there is no batch syscall: `submit` starts each pending
//! operation individually and appends its control block to the group's
//! suspend vector; `wait` blocks until any control completes, then scans for
//! the first finished one.
//!
//! glibc implements these calls with a userspace thread pool, which makes the
//! backend usable on filesystems and kernels where native AIO misbehaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::debug;

use crate::engine::{IoOp, OpKind};
use crate::Result;

/// In-flight state of one group: stable control blocks for `aio_suspend`
/// plus the operation map keyed by a monotonically advancing tag. The tag
/// rides in the control block's `sigev_value`.
#[derive(Default)]
struct SuspendSet {
    controls: Vec<Box<libc::aiocb>>,
    ops: HashMap<u64, IoOp>,
    next_tag: u64,
}

// Control blocks hold raw buffer pointers; only the owning worker thread and
// the AIO implementation ever touch them.
unsafe impl Send for SuspendSet {}

struct PosixGroup {
    pending: Mutex<Vec<IoOp>>,
    inflight: Mutex<SuspendSet>,
}

pub struct PosixAio {
    started: std::sync::atomic::AtomicBool,
    groups: Mutex<HashMap<usize, Arc<PosixGroup>>>,
}

impl PosixAio {
    pub fn new() -> Self {
        Self {
            started: std::sync::atomic::AtomicBool::new(false),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// glibc sizes its AIO thread pool on demand, so global init only
    /// records that the manager is live.
    pub fn start(&self, total_outstanding: usize) -> Result<()> {
        debug!(total_outstanding, "starting POSIX AIO manager");
        self.started.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    fn group(&self, group: usize) -> Result<Arc<PosixGroup>> {
        let groups = self.groups.lock().unwrap();
        groups
            .get(&group)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown I/O group {group}"))
    }

    pub fn create_group(&self, group: usize, _outstanding: usize) -> Result<()> {
        if !self.started.load(std::sync::atomic::Ordering::Acquire) {
            anyhow::bail!("I/O manager not started");
        }

        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(&group) {
            anyhow::bail!("I/O group {group} already exists");
        }
        groups.insert(
            group,
            Arc::new(PosixGroup {
                pending: Mutex::new(Vec::new()),
                inflight: Mutex::new(SuspendSet::default()),
            }),
        );
        Ok(())
    }

    pub fn enqueue(&self, op: IoOp) -> Result<()> {
        let group = self.group(op.group)?;
        group.pending.lock().unwrap().push(op);
        Ok(())
    }

    /// Start every pending operation of the group, one syscall each. An
    /// operation the OS refuses stays in the pending queue; previously
    /// started members of the batch remain in flight.
    pub fn submit(&self, group_id: usize) -> Result<()> {
        let group = self.group(group_id)?;
        let mut pending = group.pending.lock().unwrap();
        let mut set = group.inflight.lock().unwrap();

        while let Some(op) = pending.pop() {
            let mut tag = set.next_tag;
            while set.ops.contains_key(&tag) {
                tag = tag.wrapping_add(1);
            }
            set.next_tag = tag.wrapping_add(1);

            let mut cb: Box<libc::aiocb> = Box::new(unsafe { std::mem::zeroed() });
            cb.aio_fildes = op.fd;
            cb.aio_buf = op.buf() as *mut libc::c_void;
            cb.aio_nbytes = op.nbytes;
            cb.aio_offset = op.offset as libc::off_t;
            cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
            cb.aio_sigevent.sigev_value = libc::sigval {
                sival_ptr: tag as *mut libc::c_void,
            };

            let kind = op.kind;
            let ret = unsafe {
                match kind {
                    OpKind::Read => libc::aio_read(&mut *cb),
                    OpKind::Write => libc::aio_write(&mut *cb),
                }
            };
            if ret != 0 {
                pending.push(op);
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("aio {kind} submission failed"));
            }

            set.controls.push(cb);
            set.ops.insert(tag, op);
        }

        Ok(())
    }

    /// Block until any in-flight operation of the group completes, remove
    /// its control block and return the operation.
    pub fn wait(&self, group_id: usize) -> Result<IoOp> {
        let group = self.group(group_id)?;
        let mut set = group.inflight.lock().unwrap();
        if set.controls.is_empty() {
            anyhow::bail!("wait on group {group_id} with no operations in flight");
        }

        loop {
            let list: Vec<*const libc::aiocb> =
                set.controls.iter().map(|cb| &**cb as *const libc::aiocb).collect();

            let ret = unsafe {
                libc::aio_suspend(list.as_ptr(), list.len() as libc::c_int, std::ptr::null())
            };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => return Err(err).context("aio_suspend failed"),
                }
            }

            for i in 0..set.controls.len() {
                let status = unsafe { libc::aio_error(&*set.controls[i]) };
                if status == libc::EINPROGRESS {
                    continue;
                }

                let mut cb = set.controls.remove(i);
                let res = unsafe { libc::aio_return(&mut *cb) };
                let tag = cb.aio_sigevent.sigev_value.sival_ptr as u64;

                let mut op = set
                    .ops
                    .remove(&tag)
                    .ok_or_else(|| anyhow::anyhow!("completion for unknown tag {tag}"))?;
                if status == 0 {
                    op.finish(res as i64);
                } else {
                    op.finish_with_error(res as i64, status);
                }
                return Ok(op);
            }
            // woken without a finished control; suspend again
        }
    }
}

impl Default for PosixAio {
    fn default() -> Self {
        Self::new()
    }
}
