//! RAM-backed leaf driver.
//!
//! Completes asynchronous I/O through its own completion channel rather
//! than the queue's kernel uring, exercising the event-fd fan-in path the
//! same way the network-backed drivers do. Used by the self-test harness
//! and as a stand-in backing device in the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::trace;

use crate::buf::{iovec_len, IoVec};
use crate::disk::{AsyncResult, DeviceParams, DiskError, IoResult, UblkDisk};
use crate::sub_cmd::SubCmd;
use crate::ublk::{op_name, IoDesc, UblkQueue, UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use crate::SECTOR_SHIFT;

#[derive(Debug, Clone, Copy)]
pub struct MemDiskOpts {
    pub logical_bs_shift: u8,
    pub max_sectors: u32,
    pub direct_io: bool,
}

impl Default for MemDiskOpts {
    fn default() -> MemDiskOpts {
        let defaults = DeviceParams::default();
        MemDiskOpts {
            logical_bs_shift: defaults.logical_bs_shift,
            max_sectors: defaults.max_sectors,
            direct_io: true,
        }
    }
}

pub struct MemDisk {
    name: String,
    params: DeviceParams,
    data: Mutex<Box<[u8]>>,
    pending: Mutex<HashMap<u16, Vec<AsyncResult>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    pub fn new(name: &str, capacity: u64) -> MemDisk {
        Self::with_opts(name, capacity, MemDiskOpts::default())
    }

    pub fn with_opts(name: &str, capacity: u64, opts: MemDiskOpts) -> MemDisk {
        let params = DeviceParams {
            dev_sectors: capacity >> SECTOR_SHIFT,
            logical_bs_shift: opts.logical_bs_shift,
            physical_bs_shift: opts.logical_bs_shift,
            max_sectors: opts.max_sectors,
            can_discard: true,
            direct_io: opts.direct_io,
            uses_external_completion: true,
            ..DeviceParams::default()
        };
        MemDisk {
            name: name.to_string(),
            params,
            data: Mutex::new(vec![0u8; capacity as usize].into_boxed_slice()),
            pending: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn transfer(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        let len = iovec_len(iovs);
        let mut data = self.data.lock().expect("memdisk data poisoned");
        if addr as usize + len > data.len() {
            return Err(DiskError::InvalidArgument);
        }
        let mut off = addr as usize;
        for iov in iovs {
            match op {
                UBLK_IO_OP_READ => {
                    self.reads.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: iov describes a caller-owned buffer of iov.len
                    unsafe {
                        std::ptr::copy_nonoverlapping(data[off..].as_ptr(), iov.base, iov.len)
                    };
                }
                UBLK_IO_OP_WRITE => {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: as above
                    unsafe {
                        std::ptr::copy_nonoverlapping(iov.base, data[off..].as_mut_ptr(), iov.len)
                    };
                }
                _ => return Err(DiskError::InvalidArgument),
            }
            off += iov.len;
        }
        Ok(len)
    }
}

impl UblkDisk for MemDisk {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn id(&self) -> String {
        self.name.clone()
    }

    fn collect_async(&self, q: &dyn UblkQueue, out: &mut Vec<AsyncResult>) {
        if let Some(mut results) = self
            .pending
            .lock()
            .expect("memdisk pending poisoned")
            .get_mut(&q.q_id())
            .map(std::mem::take)
        {
            out.append(&mut results);
        }
    }

    fn handle_flush(&self, _q: &dyn UblkQueue, _io: &IoDesc, _sub_cmd: SubCmd) -> IoResult {
        Ok(0)
    }

    fn handle_discard(
        &self,
        _q: &dyn UblkQueue,
        _io: &IoDesc,
        _sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult {
        let mut data = self.data.lock().expect("memdisk data poisoned");
        let end = (addr as usize + len as usize).min(data.len());
        if addr as usize > data.len() {
            return Err(DiskError::InvalidArgument);
        }
        data[addr as usize..end].fill(0);
        Ok(0)
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
            "{} {}: [tag:{:#x}] [addr:{:#x}|len:{:#x}|sub_cmd:{}]",
            op_name(io.op),
            self.name,
            io.tag,
            addr,
            iovec_len(iovs),
            sub_cmd
        );
        let result = match self.transfer(io.op, iovs, addr) {
            Ok(len) => len as i32,
            Err(err) => err.to_result(),
        };
        self.pending
            .lock()
            .expect("memdisk pending poisoned")
            .entry(q.q_id())
            .or_default()
            .push(AsyncResult {
                tag: io.tag,
                sub_cmd,
                result,
            });
        q.send_event()?;
        Ok(1)
    }

    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        self.transfer(op, iovs, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MI;

    #[test]
    fn sync_roundtrip() {
        let disk = MemDisk::new("mem0", 4 * MI);
        let mut wbuf = vec![0x5Au8; 4096];
        let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
        assert_eq!(Ok(4096), disk.sync_iov(UBLK_IO_OP_WRITE, &iovs, 8192));

        let mut rbuf = vec![0u8; 4096];
        let iovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
        assert_eq!(Ok(4096), disk.sync_iov(UBLK_IO_OP_READ, &iovs, 8192));
        assert_eq!(wbuf, rbuf);
        assert_eq!(1, disk.read_count());
        assert_eq!(1, disk.write_count());
    }

    #[test]
    fn out_of_bounds_rejected() {
        let disk = MemDisk::new("mem0", MI);
        let mut buf = vec![0u8; 4096];
        let iovs = [IoVec::new(buf.as_mut_ptr(), buf.len())];
        assert_eq!(
            Err(DiskError::InvalidArgument),
            disk.sync_iov(UBLK_IO_OP_READ, &iovs, MI)
        );
    }

    #[test]
    fn discard_zeroes_range() {
        let disk = MemDisk::new("mem0", MI);
        let mut wbuf = vec![0xFFu8; 4096];
        let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
        disk.sync_iov(UBLK_IO_OP_WRITE, &iovs, 0).unwrap();

        let desc = IoDesc {
            tag: 0,
            op: crate::ublk::UBLK_IO_OP_DISCARD,
            op_flags: 0,
            nr_sectors: 8,
            start_sector: 0,
            addr: std::ptr::null_mut(),
        };
        struct NoQueue;
        impl UblkQueue for NoQueue {
            fn q_id(&self) -> u16 {
                0
            }
            fn push_sqe(&self, _sqe: io_uring::squeue::Entry) -> Result<(), DiskError> {
                Ok(())
            }
            fn submit(&self) {}
            fn send_event(&self) -> Result<(), DiskError> {
                Ok(())
            }
            fn complete_io(&self, _tag: u16, _result: i32) {}
        }
        assert_eq!(Ok(0), disk.handle_discard(&NoQueue, &desc, SubCmd::NONE, 4096, 0));

        let mut rbuf = vec![0xFFu8; 4096];
        let iovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
        disk.sync_iov(UBLK_IO_OP_READ, &iovs, 0).unwrap();
        assert!(rbuf.iter().all(|b| 0 == *b));
    }
}
