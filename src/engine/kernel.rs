//! Linux native AIO backend
//!
//! Each group owns an AIO context (`io_setup`). Submission batches every
//! pending operation of the group into a single `io_submit` call; completions
//! are pulled one at a time with `io_getevents`. Operations in flight are
//! tracked in a per-group map keyed by a group-unique tag carried in the
//! iocb's `aio_data` field.
//!
//! Raw syscalls are used instead of linking the LGPL libaio wrapper library.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::debug;

use crate::engine::{IoOp, OpKind};
use crate::Result;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Matches `struct iocb` from linux/aio_abi.h on little-endian targets.
#[repr(C)]
#[derive(Clone, Copy)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Matches `struct io_event` from linux/aio_abi.h.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(nr_events: libc::c_int, ctx: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, ctx)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbs: *mut *mut Iocb) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbs)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

unsafe fn io_cancel(ctx: AioContext, iocb: *mut Iocb, result: *mut IoEvent) -> libc::c_long {
    libc::syscall(libc::SYS_io_cancel, ctx, iocb, result)
}

/// Operations accepted by the kernel but not yet returned by `wait`, keyed
/// by the tag stored in the iocb. The map's key set always equals the set of
/// tags currently owned by the kernel.
#[derive(Default)]
struct InFlight {
    ops: HashMap<u64, IoOp>,
    next_tag: u64,
}

struct KernelGroup {
    ctx: AioContext,
    pending: Mutex<Vec<IoOp>>,
    inflight: Mutex<InFlight>,
}

/// Native AIO manager. Groups are single-writer by contract; the group map
/// itself is guarded for concurrent `create_group` calls from worker setup.
pub struct KernelAio {
    started: AtomicBool,
    groups: Mutex<HashMap<usize, Arc<KernelGroup>>>,
}

impl KernelAio {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self, total_outstanding: usize) -> Result<()> {
        debug!(total_outstanding, "starting native AIO manager");
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn group(&self, group: usize) -> Result<Arc<KernelGroup>> {
        let groups = self.groups.lock().unwrap();
        groups
            .get(&group)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown I/O group {group}"))
    }

    pub fn create_group(&self, group: usize, outstanding: usize) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            anyhow::bail!("I/O manager not started");
        }

        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(&group) {
            anyhow::bail!("I/O group {group} already exists");
        }

        let mut ctx: AioContext = 0;
        let ret = unsafe { io_setup(outstanding as libc::c_int, &mut ctx) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("io_setup failed for {outstanding} events"));
        }

        groups.insert(
            group,
            Arc::new(KernelGroup {
                ctx,
                pending: Mutex::new(Vec::new()),
                inflight: Mutex::new(InFlight::default()),
            }),
        );
        Ok(())
    }

    pub fn enqueue(&self, op: IoOp) -> Result<()> {
        let group = self.group(op.group)?;
        group.pending.lock().unwrap().push(op);
        Ok(())
    }

    /// Submit the group's whole pending queue in one `io_submit`. On partial
    /// acceptance the already-accepted members are cancelled, their in-flight
    /// bookkeeping removed, and the batch is returned to the pending queue.
    pub fn submit(&self, group_id: usize) -> Result<()> {
        let group = self.group(group_id)?;
        let mut pending = group.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(());
        }

        let n = pending.len();
        let mut inflight = group.inflight.lock().unwrap();

        let mut iocbs: Vec<Iocb> = Vec::with_capacity(n);
        let mut tags: Vec<u64> = Vec::with_capacity(n);
        for op in pending.iter() {
            let mut tag = inflight.next_tag;
            while inflight.ops.contains_key(&tag) {
                tag = tag.wrapping_add(1);
            }
            inflight.next_tag = tag.wrapping_add(1);

            iocbs.push(Iocb {
                aio_data: tag,
                aio_key: 0,
                aio_rw_flags: 0,
                aio_lio_opcode: match op.kind {
                    OpKind::Read => IOCB_CMD_PREAD,
                    OpKind::Write => IOCB_CMD_PWRITE,
                },
                aio_reqprio: 0,
                aio_fildes: op.fd as u32,
                aio_buf: op.buf() as u64,
                aio_nbytes: op.nbytes as u64,
                aio_offset: op.offset as i64,
                aio_reserved2: 0,
                aio_flags: 0,
                aio_resfd: 0,
            });
            tags.push(tag);
        }

        for (tag, op) in tags.iter().zip(pending.drain(..)) {
            inflight.ops.insert(*tag, op);
        }

        let mut ptrs: Vec<*mut Iocb> = iocbs.iter_mut().map(|cb| cb as *mut Iocb).collect();
        let ret = unsafe { io_submit(group.ctx, n as libc::c_long, ptrs.as_mut_ptr()) };

        if ret != n as libc::c_long {
            let os_err = std::io::Error::last_os_error();

            // unwind the whole batch: cancel whatever the kernel accepted and
            // hand the operations back to the caller's pending queue
            let mut event: IoEvent = unsafe { std::mem::zeroed() };
            for (i, cb) in iocbs.iter_mut().enumerate() {
                unsafe { io_cancel(group.ctx, cb as *mut Iocb, &mut event) };
                if let Some(op) = inflight.ops.remove(&tags[i]) {
                    pending.push(op);
                }
            }

            if ret < 0 {
                return Err(os_err).with_context(|| format!("io_submit of {n} operations failed"));
            }
            anyhow::bail!("io_submit accepted {ret} of {n} operations");
        }

        Ok(())
    }

    /// Block until one completion arrives for this group and return its
    /// operation with the OS result attached.
    pub fn wait(&self, group_id: usize) -> Result<IoOp> {
        let group = self.group(group_id)?;

        let mut event: IoEvent = unsafe { std::mem::zeroed() };
        loop {
            let ret = unsafe { io_getevents(group.ctx, 1, 1, &mut event, std::ptr::null_mut()) };
            if ret == 1 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if ret < 0 && err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("io_getevents failed");
        }

        let mut inflight = group.inflight.lock().unwrap();
        let mut op = inflight
            .ops
            .remove(&event.data)
            .ok_or_else(|| anyhow::anyhow!("completion for unknown tag {}", event.data))?;
        op.finish(event.res);
        Ok(op)
    }
}

impl Default for KernelAio {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KernelAio {
    fn drop(&mut self) {
        // io_destroy cancels or waits out anything still in flight
        let groups = self.groups.lock().unwrap();
        for group in groups.values() {
            unsafe { io_destroy(group.ctx) };
        }
    }
}
