//! The device interface every leaf driver and composed layer implements.

use std::os::fd::RawFd;

use nix::errno::Errno;

use crate::buf::IoVec;
use crate::sub_cmd::SubCmd;
use crate::ublk::{
    IoDesc, UblkQueue, UBLK_IO_OP_DISCARD, UBLK_IO_OP_FLUSH, UBLK_IO_OP_READ, UBLK_IO_OP_WRITE,
    UBLK_IO_OP_WRITE_ZEROES,
};
use crate::{DEFAULT_BS_SHIFT, DEF_BUF_SIZE, SECTOR_SHIFT};

/// Errors visible at the core boundary. Leaves surface the raw errno; the
/// RAID layers may convert single-side write failures into success after
/// recording the divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    IoError(Errno),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("operation in progress")]
    OperationInProgress,
}

impl DiskError {
    /// The negative errno handed back through a ublk completion.
    pub fn to_result(self) -> i32 {
        -(match self {
            DiskError::IoError(errno) => errno as i32,
            DiskError::InvalidArgument => Errno::EINVAL as i32,
            DiskError::NotPermitted => Errno::EPERM as i32,
            DiskError::NotEnoughMemory => Errno::ENOMEM as i32,
            DiskError::OperationInProgress => Errno::EINPROGRESS as i32,
        })
    }
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> DiskError {
        DiskError::IoError(Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO)))
    }
}

impl From<Errno> for DiskError {
    fn from(errno: Errno) -> DiskError {
        DiskError::IoError(errno)
    }
}

/// `Ok` carries a byte count on synchronous paths and the number of issued
/// sub-commands on asynchronous paths; `Ok(0)` from an async path means the
/// operation needed no physical I/O.
pub type IoResult = Result<usize, DiskError>;

/// A sub-command completion produced outside the queue's kernel uring,
/// collected after an event-fd wake-up.
#[derive(Debug, Clone, Copy)]
pub struct AsyncResult {
    pub tag: u16,
    pub sub_cmd: SubCmd,
    pub result: i32,
}

pub const ATTR_VOLATILE_CACHE: u32 = 1 << 0;
pub const ATTR_FUA: u32 = 1 << 1;

/// Negotiated device geometry and capabilities; immutable once a device is
/// open.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub dev_sectors: u64,
    pub logical_bs_shift: u8,
    pub physical_bs_shift: u8,
    pub io_opt_shift: u8,
    pub max_sectors: u32,
    pub can_discard: bool,
    pub discard_granularity: u32,
    pub attrs: u32,
    pub direct_io: bool,
    pub uses_external_completion: bool,
}

impl Default for DeviceParams {
    fn default() -> DeviceParams {
        DeviceParams {
            dev_sectors: u64::MAX,
            logical_bs_shift: DEFAULT_BS_SHIFT,
            physical_bs_shift: DEFAULT_BS_SHIFT,
            io_opt_shift: DEFAULT_BS_SHIFT,
            max_sectors: DEF_BUF_SIZE >> SECTOR_SHIFT,
            can_discard: false,
            discard_granularity: 0,
            attrs: ATTR_VOLATILE_CACHE | ATTR_FUA,
            direct_io: false,
            uses_external_completion: false,
        }
    }
}

/// A block device in the composition tree: a backing leaf or a virtual
/// device composed of children it exclusively owns.
pub trait UblkDisk: Send + Sync {
    fn params(&self) -> &DeviceParams;

    fn id(&self) -> String;

    /// File descriptors to register with the kernel uring, placed at
    /// `start_fd`, `start_fd + 1`, … Leaves completing I/O through their own
    /// channel return none.
    fn open_for_uring(&self, _start_fd: i32) -> Vec<RawFd> {
        Vec::new()
    }

    /// Number of route bits this layer consumes from a sub-command.
    fn route_size(&self) -> u8 {
        0
    }

    /// Append sub-command completions that did not pass through the kernel
    /// uring.
    fn collect_async(&self, _q: &dyn UblkQueue, _out: &mut Vec<AsyncResult>) {}

    /// Pause (`entering == true`) or resume background work around guest
    /// I/O activity.
    fn idle_transition(&self, _entering: bool) {}

    /// Handle a synthesized completion for a sub-command flagged INTERNAL.
    /// `result` is zero on success, a negative errno otherwise.
    fn handle_internal(
        &self,
        _q: &dyn UblkQueue,
        _io: &IoDesc,
        _sub_cmd: SubCmd,
        _iovs: &[IoVec],
        _addr: u64,
        _result: i32,
    ) -> IoResult {
        Ok(0)
    }

    fn handle_flush(&self, q: &dyn UblkQueue, io: &IoDesc, sub_cmd: SubCmd) -> IoResult;

    fn handle_discard(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult;

    fn async_iov(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
    ) -> IoResult;

    /// Blocking scatter-gather used during open, superblock updates and
    /// resync.
    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult;

    // ---- derived parameters ----

    fn block_size(&self) -> u32 {
        1 << self.params().logical_bs_shift
    }

    fn capacity(&self) -> u64 {
        self.params().dev_sectors << SECTOR_SHIFT
    }

    fn can_discard(&self) -> bool {
        self.params().can_discard
    }

    /// Largest single physical I/O in bytes.
    fn max_io_bytes(&self) -> usize {
        (self.params().max_sectors as usize) << SECTOR_SHIFT
    }

    fn describe(&self) -> String {
        let p = self.params();
        format!(
            "{}: params:[cap={},lbs={},pbs={},discard={},direct={}]",
            self.id(),
            self.capacity(),
            self.block_size(),
            1u32 << p.physical_bs_shift,
            p.can_discard,
            p.direct_io,
        )
    }

    // ---- dispatch ----

    /// Enqueue one guest request, fanning out per the request opcode.
    /// Returns the number of physical sub-commands issued.
    fn queue_io(&self, q: &dyn UblkQueue, io: &IoDesc, sub_cmd: SubCmd) -> IoResult {
        match io.op {
            UBLK_IO_OP_FLUSH => self.handle_flush(q, io, sub_cmd),
            UBLK_IO_OP_DISCARD | UBLK_IO_OP_WRITE_ZEROES => self.handle_discard(
                q,
                io,
                sub_cmd,
                io.nr_sectors << SECTOR_SHIFT,
                io.start_sector << SECTOR_SHIFT,
            ),
            UBLK_IO_OP_READ | UBLK_IO_OP_WRITE => {
                let iovs = [IoVec::new(io.addr, (io.nr_sectors as usize) << SECTOR_SHIFT)];
                self.async_iov(q, io, sub_cmd, &iovs, io.start_sector << SECTOR_SHIFT)
            }
            _ => Err(DiskError::InvalidArgument),
        }
    }

    /// Route an INTERNAL completion back to the device with the request's
    /// buffer re-described.
    fn queue_internal_resp(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        result: i32,
    ) -> IoResult {
        let iovs = [IoVec::new(io.addr, (io.nr_sectors as usize) << SECTOR_SHIFT)];
        self.handle_internal(
            q,
            io,
            sub_cmd,
            &iovs,
            io.start_sector << SECTOR_SHIFT,
            result,
        )
    }
}
