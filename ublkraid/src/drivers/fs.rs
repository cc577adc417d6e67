//! File and block-device backed leaf driver.
//!
//! Geometry is probed from the backing node (BLK* ioctls for block devices,
//! stat for regular files), O_DIRECT is preferred with a buffered fallback,
//! and asynchronous I/O is submitted on the owning queue's uring. Discard
//! maps to fallocate on files and the BLKDISCARD ioctl on block devices.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use io_uring::{opcode, types};
use log::{debug, error, trace, warn};
use nix::errno::Errno;

use crate::buf::{iovec_len, IoVec};
use crate::disk::{DeviceParams, DiskError, IoResult, UblkDisk};
use crate::sub_cmd::{build_user_data, SubCmd};
use crate::ublk::{
    op_name, IoDesc, UblkQueue, UBLK_IO_OP_READ, UBLK_IO_OP_WRITE, UBLK_IO_OP_WRITE_ZEROES,
    UBLK_IO_F_FUA,
};
use crate::{ilog2, SECTOR_SHIFT};

const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKPBSZGET: libc::c_ulong = 0x127b;
const BLKDISCARD: libc::c_ulong = 0x1277;

const FALLOC_FL_KEEP_SIZE: i32 = 0x01;
const FALLOC_FL_PUNCH_HOLE: i32 = 0x02;
const FALLOC_FL_ZERO_RANGE: i32 = 0x10;

/// Explicit error-injection configuration; a period of `n` fails roughly
/// every `n`th eligible write on even-routed sub-commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorInjection {
    pub max_errors: u32,
    pub period: u64,
}

pub struct FsDisk {
    path: PathBuf,
    fd: OwnedFd,
    block_device: bool,
    params: DeviceParams,
    inject: Option<ErrorInjection>,
    io_cnt: AtomicU64,
    err_cnt: AtomicU64,
}

fn block_has_unmap(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let sysfs = format!("/sys/class/block/{name}/queue/discard_granularity");
    std::fs::read_to_string(sysfs)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .is_some_and(|granularity| 0 < granularity)
}

impl FsDisk {
    pub fn open(path: &Path) -> Result<FsDisk, DiskError> {
        Self::open_with(path, None)
    }

    pub fn open_with(path: &Path, inject: Option<ErrorInjection>) -> Result<FsDisk, DiskError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_RDWR)
            .open(path)
            .map_err(|err| {
                error!("backing file {} can't be opened: {err}", path.display());
                DiskError::NotPermitted
            })?;
        let fd: OwnedFd = file.into();

        // SAFETY: zeroed stat64 filled by the kernel for an owned fd
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        if 0 != unsafe { libc::fstat64(fd.as_raw_fd(), &mut st) } {
            error!("fstat({}) failed", path.display());
            return Err(DiskError::from(std::io::Error::last_os_error()));
        }
        let fmt = st.st_mode & libc::S_IFMT;

        let mut params = DeviceParams::default();
        let bytes;
        let block_device = libc::S_IFBLK == fmt;
        if block_device {
            let mut sz: u64 = 0;
            let mut lbs: libc::c_int = 0;
            let mut pbs: libc::c_int = 0;
            // SAFETY: standard BLK* ioctls against a verified block device
            let rc = unsafe {
                libc::ioctl(fd.as_raw_fd(), BLKGETSIZE64, &mut sz)
                    | libc::ioctl(fd.as_raw_fd(), BLKSSZGET, &mut lbs)
                    | libc::ioctl(fd.as_raw_fd(), BLKPBSZGET, &mut pbs)
            };
            if 0 != rc {
                return Err(DiskError::from(std::io::Error::last_os_error()));
            }
            bytes = sz;
            params.can_discard = block_has_unmap(path);
            params.logical_bs_shift = ilog2(lbs as u64);
            params.physical_bs_shift = ilog2(pbs as u64);
            debug!(
                "Backing is a block device [{}:{}:{}]!",
                path.display(),
                lbs,
                pbs
            );
        } else if libc::S_IFREG == fmt {
            bytes = st.st_size as u64;
            params.can_discard = true;
            let lbs = st.st_blksize as u64;
            params.logical_bs_shift = ilog2(lbs);
            params.physical_bs_shift = params.logical_bs_shift;
            debug!(
                "Backing is a regular file [{}:{}:{}]!",
                path.display(),
                lbs,
                lbs
            );
        } else {
            error!("{} is not a block device or regular file!", path.display());
            return Err(DiskError::InvalidArgument);
        }
        if params.can_discard {
            params.discard_granularity = st.st_blksize as u32;
        }

        // Prefer direct I/O; fall back to buffered so any filesystem image
        // remains usable
        if 0 == unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_DIRECT) } {
            params.direct_io = true;
        } else {
            debug!("Unable to support DIRECT I/O, using BUFFERED.");
        }

        params.dev_sectors = bytes >> SECTOR_SHIFT;
        params.dev_sectors -= params.dev_sectors % params.max_sectors as u64;

        Ok(FsDisk {
            path: path.to_path_buf(),
            fd,
            block_device,
            params,
            inject,
            io_cnt: AtomicU64::new(0),
            err_cnt: AtomicU64::new(0),
        })
    }

    fn next_sqe_data(&self, io: &IoDesc, sub_cmd: SubCmd) -> u64 {
        build_user_data(io.tag, io.op, sub_cmd)
    }

    fn should_inject(&self, op: u8, sub_cmd: SubCmd) -> bool {
        let Some(inject) = &self.inject else {
            return false;
        };
        if 0 == inject.period || self.err_cnt.load(Ordering::Relaxed) >= inject.max_errors as u64 {
            return false;
        }
        // Errors only on plain writes with even routes, so retries can be
        // observed recovering
        if UBLK_IO_OP_WRITE != op
            || sub_cmd.is_internal()
            || sub_cmd.is_retry()
            || 0 != sub_cmd.raw() % 2
        {
            return false;
        }
        if 0 != self.io_cnt.fetch_add(1, Ordering::Relaxed) % inject.period {
            return false;
        }
        self.err_cnt.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl UblkDisk for FsDisk {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn handle_flush(&self, q: &dyn UblkQueue, io: &IoDesc, sub_cmd: SubCmd) -> IoResult {
        trace!(
            "Flush {} : [tag:{:#x}] ublk io [sub_cmd:{}]",
            self.path.display(),
            io.tag,
            sub_cmd
        );
        if self.params.direct_io {
            return Ok(0);
        }
        let sqe = opcode::Fsync::new(types::Fd(self.fd.as_raw_fd()))
            .flags(types::FsyncFlags::DATASYNC)
            .build()
            .user_data(self.next_sqe_data(io, sub_cmd));
        q.push_sqe(sqe)?;
        Ok(1)
    }

    fn handle_discard(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult {
        debug!(
            "DISCARD {}: [tag:{:#x}] ublk io [lba:{:#x}|len:{:#x}|sub_cmd:{}]",
            self.path.display(),
            io.tag,
            addr >> self.params.logical_bs_shift,
            len,
            sub_cmd
        );
        if !self.block_device {
            let mode = if UBLK_IO_OP_WRITE_ZEROES == io.op {
                FALLOC_FL_ZERO_RANGE | FALLOC_FL_KEEP_SIZE
            } else {
                FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE
            };
            let sqe = opcode::Fallocate::new(types::Fd(self.fd.as_raw_fd()), len as u64)
                .offset(addr)
                .mode(mode)
                .build()
                .user_data(self.next_sqe_data(io, sub_cmd));
            q.push_sqe(sqe)?;
            return Ok(1);
        }

        // The ioctl is synchronous; flush queued entries first
        q.submit();
        let range = [addr, len as u64];
        // SAFETY: BLKDISCARD with a valid [start, len] pair
        let res = unsafe { libc::ioctl(self.fd.as_raw_fd(), BLKDISCARD, &range) };
        if 0 == res {
            return Ok(0);
        }
        let err = std::io::Error::last_os_error();
        error!(
            "ioctl BLKDISCARD on {} returned error: {err}",
            self.path.display()
        );
        Err(DiskError::from(err))
    }

    fn async_iov(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
    ) -> IoResult {
        trace!(
            "{} {} : [tag:{:#x}] ublk io [lba:{:#x}|len:{:#x}|sub_cmd:{}]",
            op_name(io.op),
            self.path.display(),
            io.tag,
            addr >> self.params.logical_bs_shift,
            iovec_len(iovs),
            sub_cmd
        );
        if self.should_inject(io.op, sub_cmd) {
            warn!(
                "Returning injected error from: {} @ [lba:{:#x}] [len:{:#x}]",
                self.path.display(),
                addr >> self.params.logical_bs_shift,
                iovec_len(iovs)
            );
            return Err(DiskError::IoError(Errno::EIO));
        }

        debug_assert!(
            iovec_len(iovs) as u64 + addr <= self.capacity(),
            "Access beyond device bounds!"
        );
        let fd = types::Fd(self.fd.as_raw_fd());
        let write = UBLK_IO_OP_READ != io.op;
        // Force-unit-access writes bypass the volatile cache
        let rw_flags = if write && 0 != io.op_flags & UBLK_IO_F_FUA {
            libc::RWF_DSYNC
        } else {
            0
        };
        let sqe = if 1 == iovs.len() {
            if write {
                opcode::Write::new(fd, iovs[0].base, iovs[0].len as u32)
                    .offset(addr)
                    .rw_flags(rw_flags)
                    .build()
            } else {
                opcode::Read::new(fd, iovs[0].base, iovs[0].len as u32)
                    .offset(addr)
                    .build()
            }
        } else if write {
            opcode::Writev::new(fd, iovs.as_ptr().cast(), iovs.len() as u32)
                .offset(addr)
                .rw_flags(rw_flags)
                .build()
        } else {
            opcode::Readv::new(fd, iovs.as_ptr().cast(), iovs.len() as u32)
                .offset(addr)
                .build()
        };
        q.push_sqe(sqe.user_data(self.next_sqe_data(io, sub_cmd)))?;
        Ok(1)
    }

    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        let raw: Vec<libc::iovec> = iovs.iter().map(IoVec::as_raw).collect();
        // SAFETY: iovecs describe caller-owned buffers for their full length
        let res = unsafe {
            match op {
                UBLK_IO_OP_READ => libc::preadv64(
                    self.fd.as_raw_fd(),
                    raw.as_ptr(),
                    raw.len() as libc::c_int,
                    addr as libc::off64_t,
                ),
                UBLK_IO_OP_WRITE => libc::pwritev64(
                    self.fd.as_raw_fd(),
                    raw.as_ptr(),
                    raw.len() as libc::c_int,
                    addr as libc::off64_t,
                ),
                _ => return Err(DiskError::InvalidArgument),
            }
        };
        if 0 > res {
            return Err(DiskError::from(std::io::Error::last_os_error()));
        }
        Ok(res as usize)
    }
}

impl Drop for FsDisk {
    fn drop(&mut self) {
        if !self.params.direct_io {
            // SAFETY: fd is owned and open
            unsafe { libc::fdatasync(self.fd.as_raw_fd()) };
        }
    }
}
