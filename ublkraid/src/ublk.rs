//! The consumed surface of the ublk kernel protocol library.
//!
//! The protocol library itself (control-plane ioctls, queue rings, shared
//! request buffers) is an external collaborator; this module states only the
//! pieces the core interacts with: the per-request descriptor delivered by
//! the kernel, the per-queue operations a device may invoke while queueing
//! sub-commands, and the session hooks the target runtime drives.

use io_uring::squeue;

use crate::disk::DiskError;

pub const UBLK_IO_OP_READ: u8 = 0;
pub const UBLK_IO_OP_WRITE: u8 = 1;
pub const UBLK_IO_OP_FLUSH: u8 = 2;
pub const UBLK_IO_OP_DISCARD: u8 = 3;
pub const UBLK_IO_OP_WRITE_SAME: u8 = 4;
pub const UBLK_IO_OP_WRITE_ZEROES: u8 = 5;

/// Force-unit-access bit in `IoDesc::op_flags`.
pub const UBLK_IO_F_FUA: u32 = 1 << 13;

pub fn op_name(op: u8) -> &'static str {
    match op {
        UBLK_IO_OP_READ => "READ",
        UBLK_IO_OP_WRITE => "WRITE",
        UBLK_IO_OP_FLUSH => "FLUSH",
        UBLK_IO_OP_DISCARD => "DISCARD",
        UBLK_IO_OP_WRITE_SAME => "WRITE_SAME",
        UBLK_IO_OP_WRITE_ZEROES => "WRITE_ZEROES",
        _ => "UNKNOWN",
    }
}

/// One guest request as delivered by the ublk layer. `addr` points into the
/// session's request buffer pool and stays valid until the request is
/// completed back to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct IoDesc {
    pub tag: u16,
    pub op: u8,
    pub op_flags: u32,
    pub nr_sectors: u32,
    pub start_sector: u64,
    pub addr: *mut u8,
}

unsafe impl Send for IoDesc {}

/// Per-queue operations available to devices while servicing a request.
/// One implementation exists per hardware queue; all calls arrive on that
/// queue's thread except `send_event`, which device completion callbacks may
/// invoke from any thread.
pub trait UblkQueue: Send + Sync {
    fn q_id(&self) -> u16;

    /// Push one prepared submission entry onto this queue's uring.
    fn push_sqe(&self, sqe: squeue::Entry) -> Result<(), DiskError>;

    /// Submit any pushed entries to the kernel. Must be called before
    /// yielding whenever pushed entries reference stack-resident iovecs.
    fn submit(&self);

    /// Wake the queue's event-fd so `collect_async` results are drained.
    fn send_event(&self) -> Result<(), DiskError>;

    /// Complete the guest request identified by `tag`. Negative results are
    /// errnos surfaced to the guest.
    fn complete_io(&self, tag: u16, result: i32);

    /// Acknowledge a drained event-fd wake-up.
    fn handled_event(&self) {}
}

/// What a queue thread observed while waiting on its completion sources.
pub enum QueueEvent {
    /// A new guest request arrived.
    Io(IoDesc),
    /// A uring completion for a target-owned sub-command.
    TgtIoDone { user_data: u64, result: i32 },
    /// The event-fd fired; externally completed sub-commands are pending.
    EventFd,
    /// No requests in flight; background work may resume.
    Idle,
    /// The session is shutting down.
    Stop,
}

/// A running ublk session, provided by the protocol library. The runtime
/// registers its descriptor via `start` and then drives one thread per
/// hardware queue through `wait_event`.
pub trait UblkSession: Send + Sync {
    fn queue(&self, q_id: u16) -> &dyn UblkQueue;

    /// Block until the next event for `q_id`.
    fn wait_event(&self, q_id: u16) -> Result<QueueEvent, DiskError>;

    /// Request all queues to observe [`QueueEvent::Stop`].
    fn stop(&self);
}
