//! Shared harness for the integration suites: a recording queue, a
//! fault-injecting disk wrapper and mirror assembly helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use ublkraid::buf::IoVec;
use ublkraid::disk::{AsyncResult, DeviceParams, DiskError, IoResult, UblkDisk};
use ublkraid::drivers::MemDisk;
use ublkraid::raid::raid1::{superblock::SuperBlock, Raid1Disk, Raid1Opts};
use ublkraid::sub_cmd::SubCmd;
use ublkraid::ublk::{IoDesc, UblkQueue, UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use ublkraid::MI;
use uuid::Uuid;

pub const MIRROR_BACKING: u64 = 64 * MI;

/// Records everything a device pushes at it.
#[derive(Default)]
pub struct MockQueue {
    pub id: u16,
    pub sqes: AtomicU32,
    pub submits: AtomicU32,
    pub events: AtomicU32,
    pub completions: Mutex<Vec<(u16, i32)>>,
}

impl MockQueue {
    pub fn new(id: u16) -> MockQueue {
        MockQueue {
            id,
            ..MockQueue::default()
        }
    }

    pub fn completed(&self) -> Vec<(u16, i32)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn events_sent(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }
}

impl UblkQueue for MockQueue {
    fn q_id(&self) -> u16 {
        self.id
    }

    fn push_sqe(&self, _sqe: io_uring::squeue::Entry) -> Result<(), DiskError> {
        self.sqes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn submit(&self) {
        self.submits.fetch_add(1, Ordering::Relaxed);
    }

    fn send_event(&self) -> Result<(), DiskError> {
        self.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn complete_io(&self, tag: u16, result: i32) {
        self.completions.lock().unwrap().push((tag, result));
    }
}

/// Wraps a `MemDisk` with switchable failures.
pub struct FlakyDisk {
    inner: Arc<MemDisk>,
    fail_async_immediate: AtomicU32,
    fail_async_completion: AtomicU32,
    fail_sync_writes: AtomicBool,
    fail_sync_reads: AtomicBool,
    pending: Mutex<HashMap<u16, Vec<AsyncResult>>>,
}

impl FlakyDisk {
    pub fn new(inner: Arc<MemDisk>) -> Arc<FlakyDisk> {
        Arc::new(FlakyDisk {
            inner,
            fail_async_immediate: AtomicU32::new(0),
            fail_async_completion: AtomicU32::new(0),
            fail_sync_writes: AtomicBool::new(false),
            fail_sync_reads: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn mem(&self) -> &Arc<MemDisk> {
        &self.inner
    }

    /// The next `n` async submissions fail immediately.
    pub fn fail_next_async(&self, n: u32) {
        self.fail_async_immediate.store(n, Ordering::Release);
    }

    /// The next `n` async submissions are accepted but complete with EIO.
    pub fn fail_next_async_completion(&self, n: u32) {
        self.fail_async_completion.store(n, Ordering::Release);
    }

    pub fn set_fail_sync_writes(&self, fail: bool) {
        self.fail_sync_writes.store(fail, Ordering::Release);
    }

    pub fn set_fail_sync_reads(&self, fail: bool) {
        self.fail_sync_reads.store(fail, Ordering::Release);
    }

    fn take_budget(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl UblkDisk for FlakyDisk {
    fn params(&self) -> &DeviceParams {
        self.inner.params()
    }

    fn id(&self) -> String {
        self.inner.id()
    }

    fn collect_async(&self, q: &dyn UblkQueue, out: &mut Vec<AsyncResult>) {
        if let Some(mut results) = self
            .pending
            .lock()
            .unwrap()
            .get_mut(&q.q_id())
            .map(std::mem::take)
        {
            out.append(&mut results);
        }
        self.inner.collect_async(q, out);
    }

    fn handle_flush(&self, q: &dyn UblkQueue, io: &IoDesc, sub_cmd: SubCmd) -> IoResult {
        self.inner.handle_flush(q, io, sub_cmd)
    }

    fn handle_discard(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult {
        self.inner.handle_discard(q, io, sub_cmd, len, addr)
    }

    fn async_iov(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
    ) -> IoResult {
        if Self::take_budget(&self.fail_async_immediate) {
            return Err(DiskError::IoError(Errno::EIO));
        }
        if Self::take_budget(&self.fail_async_completion) {
            self.pending
                .lock()
                .unwrap()
                .entry(q.q_id())
                .or_default()
                .push(AsyncResult {
                    tag: io.tag,
                    sub_cmd,
                    result: -libc::EIO,
                });
            q.send_event()?;
            return Ok(1);
        }
        self.inner.async_iov(q, io, sub_cmd, iovs, addr)
    }

    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        if UBLK_IO_OP_WRITE == op && self.fail_sync_writes.load(Ordering::Acquire) {
            return Err(DiskError::IoError(Errno::EIO));
        }
        if UBLK_IO_OP_READ == op && self.fail_sync_reads.load(Ordering::Acquire) {
            return Err(DiskError::IoError(Errno::EIO));
        }
        self.inner.sync_iov(op, iovs, addr)
    }
}

pub fn test_uuid() -> Uuid {
    Uuid::from_bytes([
        0xad, 0xa4, 0x07, 0x37, 0x30, 0xe3, 0x49, 0xfe, 0x99, 0x42, 0x5a, 0x28, 0x7d, 0x71, 0xeb,
        0x3f,
    ])
}

pub fn no_resync_opts() -> Raid1Opts {
    Raid1Opts {
        auto_resync: false,
        ..Raid1Opts::default()
    }
}

pub fn mem_pair() -> (Arc<MemDisk>, Arc<MemDisk>) {
    (
        Arc::new(MemDisk::new("memA", MIRROR_BACKING)),
        Arc::new(MemDisk::new("memB", MIRROR_BACKING)),
    )
}

pub fn flaky_pair() -> (Arc<FlakyDisk>, Arc<FlakyDisk>) {
    let (a, b) = mem_pair();
    (FlakyDisk::new(a), FlakyDisk::new(b))
}

pub fn open_mirror(
    dev_a: Arc<dyn UblkDisk>,
    dev_b: Arc<dyn UblkDisk>,
    opts: Raid1Opts,
) -> Raid1Disk {
    Raid1Disk::open(test_uuid(), dev_a, dev_b, opts).expect("mirror open")
}

pub fn desc(tag: u16, op: u8, start_sector: u64, nr_sectors: u32, addr: *mut u8) -> IoDesc {
    IoDesc {
        tag,
        op,
        op_flags: 0,
        nr_sectors,
        start_sector,
        addr,
    }
}

/// Read the superblock page straight off a backing device.
pub fn raw_superblock(disk: &dyn UblkDisk) -> Option<SuperBlock> {
    let mut page = vec![0u8; 4096];
    let iovs = [IoVec::new(page.as_mut_ptr(), page.len())];
    disk.sync_iov(UBLK_IO_OP_READ, &iovs, 0).expect("sb read");
    SuperBlock::decode(&page)
}

/// Drain every externally produced completion on `q` through the mirror.
pub fn drain_async(device: &dyn UblkDisk, q: &MockQueue) -> Vec<AsyncResult> {
    let mut out = Vec::new();
    device.collect_async(q, &mut out);
    out
}
