//! RAID-1: two replicas with crash-consistent divergence tracking.
//!
//! Writes replicate to both sides; reads round-robin and fail over. A
//! single-side write failure degrades the array: the age in the surviving
//! superblock is bumped synchronously before the guest sees success, the
//! failed extent is recorded in the dirty bitmap, and a background task
//! copies dirty extents back once the stale side returns. A failed mirror
//! can be replaced online; the incoming device resyncs from the bitmap it
//! brought along when its superblock age is close enough, or in full
//! otherwise.

pub mod bitmap;
pub mod superblock;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use uuid::Uuid;

use crate::buf::{iovec_len, AlignedBuf, IoVec};
use crate::config::Raid1Config;
use crate::disk::{AsyncResult, DeviceParams, DiskError, IoResult, UblkDisk};
use crate::raid::superblock::SB_PAGE_SIZE;
use crate::sub_cmd::{SubCmd, SubCmdFlags};
use crate::ublk::{op_name, IoDesc, UblkQueue, UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use crate::{GI, KI, SECTOR_SHIFT};

use bitmap::{Bitmap, BITS_IN_BYTE, MIN_CHUNK_SIZE, PAGE_SIZE};
use superblock::{
    load_superblock, pick_superblock, write_superblock, ReadRoute, Side, SuperBlock,
};

/// Largest mirror we track with the fixed reserved-area geometry.
const MAX_DEV_SIZE: u64 = 32 * KI * GI;

const RESYNC_IDLE: u8 = 0;
const RESYNC_ACTIVE: u8 = 1;
const RESYNC_SLEEPING: u8 = 2;
const RESYNC_PAUSE: u8 = 3;
const RESYNC_STOPPED: u8 = 4;

#[derive(Debug, Clone)]
pub struct Raid1Opts {
    pub chunk_size: u32,
    /// Resync prioritization level (0-32).
    pub resync_level: u32,
    /// Allow reads from the degraded side for chunks the bitmap proves
    /// clean.
    pub read_from_dirty: bool,
    /// Spawn the background resync task when the array degrades.
    pub auto_resync: bool,
}

impl Default for Raid1Opts {
    fn default() -> Raid1Opts {
        Raid1Opts {
            chunk_size: MIN_CHUNK_SIZE,
            resync_level: 4,
            read_from_dirty: true,
            auto_resync: true,
        }
    }
}

impl From<&Raid1Config> for Raid1Opts {
    fn from(cfg: &Raid1Config) -> Raid1Opts {
        Raid1Opts {
            chunk_size: cfg.chunk_size,
            resync_level: cfg.resync_level,
            read_from_dirty: cfg.read_from_dirty,
            ..Raid1Opts::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Clean,
    Syncing,
    Error,
}

/// Operational view of the mirror pair.
#[derive(Debug, Clone, Copy)]
pub struct ArrayState {
    pub device_a: ReplicaState,
    pub device_b: ReplicaState,
    pub bytes_to_sync: u64,
}

struct MirrorDevice {
    disk: Arc<dyn UblkDisk>,
    /// The replica failed its last access; reads avoid it and the resync
    /// task backs off until a copy succeeds again.
    unavail: AtomicBool,
}

impl MirrorDevice {
    fn new(disk: Arc<dyn UblkDisk>) -> Arc<MirrorDevice> {
        Arc::new(MirrorDevice {
            disk,
            unavail: AtomicBool::new(false),
        })
    }
}

struct Raid1Inner {
    uuid: Uuid,
    params: DeviceParams,
    reserved_size: u64,
    opts: Raid1Opts,

    mirrors: RwLock<[Arc<MirrorDevice>; 2]>,

    // Persistent state; transitions serialize on the superblock lock after
    // winning the degraded flag
    sb: Mutex<SuperBlock>,
    read_route: AtomicU8,
    degraded: AtomicBool,
    bitmap: Bitmap,

    // Round-robin read distribution
    last_read: AtomicU8,

    resync_state: AtomicU8,
    resync_enabled: AtomicBool,
    resync_task: Mutex<Option<thread::JoinHandle<()>>>,
    io_op_cnt: AtomicU64,

    // Synthesized completions awaiting an event-fd drain, per queue
    pending: Mutex<HashMap<u16, Vec<AsyncResult>>>,
}

pub struct Raid1Disk {
    inner: Arc<Raid1Inner>,
}

struct MirrorAssembly {
    disk: Arc<dyn UblkDisk>,
    sb: SuperBlock,
    was_new: bool,
}

fn load_mirror(
    disk: Arc<dyn UblkDisk>,
    uuid: &Uuid,
    chunk_size: u32,
) -> Result<MirrorAssembly, DiskError> {
    let (sb, was_new) = load_superblock(&*disk, uuid, chunk_size)?;
    Ok(MirrorAssembly { disk, sb, was_new })
}

impl Raid1Disk {
    pub fn open(
        uuid: Uuid,
        dev_a: Arc<dyn UblkDisk>,
        dev_b: Arc<dyn UblkDisk>,
        opts: Raid1Opts,
    ) -> Result<Raid1Disk, DiskError> {
        if MIN_CHUNK_SIZE > opts.chunk_size {
            error!(
                "Invalid chunk_size: {}KiB [min:{}KiB]",
                opts.chunk_size / KI as u32,
                MIN_CHUNK_SIZE / KI as u32
            );
            return Err(DiskError::InvalidArgument);
        }

        let mut params = DeviceParams {
            can_discard: true,
            direct_io: true,
            // Synthesized retry completions always flow through the
            // event-fd channel
            uses_external_completion: true,
            io_opt_shift: crate::ilog2(MIN_CHUNK_SIZE as u64),
            dev_sectors: MAX_DEV_SIZE >> SECTOR_SHIFT,
            ..DeviceParams::default()
        };
        for device in [&dev_a, &dev_b] {
            if !device.params().direct_io {
                error!("Device does not support O_DIRECT! {}", device.describe());
                return Err(DiskError::NotPermitted);
            }
            params.dev_sectors = params.dev_sectors.min(device.params().dev_sectors);
            params.logical_bs_shift = params
                .logical_bs_shift
                .max(device.params().logical_bs_shift);
            params.physical_bs_shift = params
                .physical_bs_shift
                .max(device.params().physical_bs_shift);
            params.can_discard &= device.params().can_discard;
        }

        // Reserve the head of each mirror for the superblock and bitmap,
        // padding so user data starts max_sectors aligned
        let dev_bytes = params.dev_sectors << SECTOR_SHIFT;
        let bitmap_size = (dev_bytes / MIN_CHUNK_SIZE as u64) / BITS_IN_BYTE;
        let mut reserved_size = SB_PAGE_SIZE as u64 + bitmap_size;
        reserved_size +=
            (dev_bytes - reserved_size) % ((params.max_sectors as u64) << SECTOR_SHIFT);
        debug!(
            "RAID-1: reserving {:#x} blocks for superblock & bitmap",
            reserved_size >> params.logical_bs_shift
        );
        params.dev_sectors -= reserved_size >> SECTOR_SHIFT;

        if params.can_discard {
            params.discard_granularity =
                params.discard_granularity.max(1 << params.logical_bs_shift);
        }

        // Settle which physical device belongs in which slot from the
        // stamped superblocks
        let mut ma = load_mirror(dev_a, &uuid, opts.chunk_size)?;
        let mut mb = load_mirror(dev_b, &uuid, opts.chunk_size)?;
        if ma.was_new {
            if !mb.was_new && !mb.sb.device_b {
                std::mem::swap(&mut ma, &mut mb);
            }
        } else {
            if !mb.was_new && ma.sb.device_b == mb.sb.device_b {
                error!("Found both devices were assigned the same slot!");
                return Err(DiskError::InvalidArgument);
            }
            if ma.sb.device_b {
                std::mem::swap(&mut ma, &mut mb);
            }
        }

        // Only the latest superblock survives; an age gap above one means
        // the other side's bitmap cannot be trusted
        let (side, mut sb) = pick_superblock(&ma.sb, &mb.sb);
        match side {
            Side::A => {
                if 1 < sb.age.saturating_sub(mb.sb.age) {
                    mb.was_new = true;
                }
            }
            Side::B => {
                if 1 < sb.age.saturating_sub(ma.sb.age) {
                    ma.was_new = true;
                }
            }
        }
        if ma.was_new && mb.was_new {
            sb.age = 1;
        }

        let capacity = params.dev_sectors << SECTOR_SHIFT;
        let bitmap = Bitmap::new(capacity, sb.chunk_size, 1 << params.logical_bs_shift)?;
        if ma.was_new {
            bitmap.init_to(&*ma.disk)?;
            if !mb.was_new {
                sb.read_route = ReadRoute::DevB;
            }
        }
        if mb.was_new {
            bitmap.init_to(&*mb.disk)?;
            if !ma.was_new {
                sb.read_route = ReadRoute::DevA;
            }
        }

        let mut degraded = false;
        if (ma.was_new ^ mb.was_new) || !sb.clean_unmount {
            // One stale or missing side, or we did not shut down cleanly:
            // the entire surviving image must be copied
            sb.age += 16;
            warn!(
                "Device is new or unmount was not clean, dirtying all of {}",
                if ma.was_new {
                    mb.disk.describe()
                } else {
                    ma.disk.describe()
                }
            );
            bitmap.dirty_region(0, capacity);
            degraded = true;
        } else if ReadRoute::Either != sb.read_route {
            let clean = if ReadRoute::DevB == sb.read_route {
                &mb
            } else {
                &ma
            };
            warn!(
                "RAID-1 is starting in degraded mode [vol:{}]! Degraded device: {}",
                uuid,
                if ReadRoute::DevB == sb.read_route {
                    ma.disk.describe()
                } else {
                    mb.disk.describe()
                }
            );
            degraded = true;
            bitmap.load_from(&*clean.disk)?;
        }

        // Mark the array mounted; the flag is restored on clean shutdown so
        // a crash is visible at the next assembly
        sb.clean_unmount = false;
        sb.device_b = false;

        let read_route = sb.read_route;
        let inner = Arc::new(Raid1Inner {
            uuid,
            params,
            reserved_size,
            opts: opts.clone(),
            mirrors: RwLock::new([MirrorDevice::new(ma.disk), MirrorDevice::new(mb.disk)]),
            sb: Mutex::new(sb),
            read_route: AtomicU8::new(read_route as u8),
            degraded: AtomicBool::new(degraded),
            bitmap,
            last_read: AtomicU8::new(ReadRoute::DevB as u8),
            resync_state: AtomicU8::new(RESYNC_PAUSE),
            resync_enabled: AtomicBool::new(opts.auto_resync),
            resync_task: Mutex::new(None),
            io_op_cnt: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        });
        inner.initial_superblock_sync()?;
        Ok(Raid1Disk { inner })
    }

    /// Replace the mirror identified by `old_id` with `new_device`,
    /// returning the outgoing disk. See the swap rules on
    /// [`Raid1Inner::swap`].
    pub fn swap_device(
        &self,
        old_id: &str,
        new_device: Arc<dyn UblkDisk>,
    ) -> Result<Arc<dyn UblkDisk>, DiskError> {
        self.inner.swap(old_id, new_device)
    }

    pub fn replica_states(&self) -> ArrayState {
        self.inner.replica_states()
    }

    pub fn toggle_resync(&self, enable: bool) {
        self.inner.toggle_resync(enable);
    }

    /// Head bytes of each mirror occupied by the superblock and bitmap.
    pub fn reserved_size(&self) -> u64 {
        self.inner.reserved_size
    }
}

impl Drop for Raid1Disk {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Raid1Inner {
    fn route(&self) -> ReadRoute {
        ReadRoute::from_bits(self.read_route.load(Ordering::Acquire))
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn mirror_pair(&self) -> (Arc<MirrorDevice>, Arc<MirrorDevice>) {
        let mirrors = self.mirrors.read().expect("mirror lock poisoned");
        (mirrors[0].clone(), mirrors[1].clone())
    }

    /// The known-clean replica (A while the array is clean).
    fn clean_mirror(&self) -> Arc<MirrorDevice> {
        let mirrors = self.mirrors.read().expect("mirror lock poisoned");
        mirrors[(ReadRoute::DevB == self.route()) as usize].clone()
    }

    fn dirty_mirror(&self) -> Arc<MirrorDevice> {
        let mirrors = self.mirrors.read().expect("mirror lock poisoned");
        mirrors[(ReadRoute::DevB != self.route()) as usize].clone()
    }

    /// Force a sub-command's low bit toward the clean side.
    fn clean_sub(&self, sub_cmd: SubCmd) -> SubCmd {
        sub_cmd.to_side_b(ReadRoute::DevB == self.route())
    }

    fn dirty_sub(&self, sub_cmd: SubCmd) -> SubCmd {
        sub_cmd.to_side_b(ReadRoute::DevB != self.route())
    }

    fn side_of(&self, sub_cmd: SubCmd) -> Arc<MirrorDevice> {
        let mirrors = self.mirrors.read().expect("mirror lock poisoned");
        mirrors[(sub_cmd.route() & 0b1) as usize].clone()
    }

    fn capacity(&self) -> u64 {
        self.params.dev_sectors << SECTOR_SHIFT
    }

    fn initial_superblock_sync(self: &Arc<Self>) -> Result<(), DiskError> {
        let (dev_a, dev_b) = self.mirror_pair();
        let route = self.route();
        let (clean, dirty) = if ReadRoute::DevB == route {
            (dev_b, dev_a)
        } else {
            (dev_a, dev_b)
        };
        let sb = self.sb.lock().expect("superblock lock poisoned").clone();

        // If the clean side refuses the superblock, the array flips and
        // continues on the other replica alone
        if write_superblock(&*clean.disk, &sb, ReadRoute::DevB == route).is_err() {
            error!(
                "Failed writing superblock to: {} becoming degraded. [vol:{}]",
                clean.disk.describe(),
                self.uuid
            );
            if self.is_degraded() {
                return Err(DiskError::NotPermitted);
            }
            self.become_degraded(self.clean_sub(SubCmd::NONE), true)?;
            return Ok(());
        }

        match write_superblock(&*dirty.disk, &sb, ReadRoute::DevB != route) {
            Ok(_) => {
                if self.is_degraded() && self.resync_enabled.load(Ordering::Acquire) {
                    self.spawn_resync();
                }
            }
            Err(_) => {
                self.become_degraded(self.dirty_sub(SubCmd::NONE), true)?;
            }
        }
        Ok(())
    }

    /// Transition to DEGRADED with the failing side named by `sub_cmd`'s
    /// low bit. The age bump is persisted to the surviving side before the
    /// transition becomes observable; on persist failure the state rolls
    /// back and the caller's operation fails.
    fn become_degraded(self: &Arc<Self>, sub_cmd: SubCmd, spawn_resync: bool) -> IoResult {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let (_, dev_b) = self.mirror_pair();
        let failing_b = 0b1 == (sub_cmd.raw() >> dev_b.disk.route_size()) & 0b1;

        let mut sb = self.sb.lock().expect("superblock lock poisoned");
        let orig_route = sb.read_route;
        let orig_age = sb.age;
        sb.read_route = if failing_b {
            ReadRoute::DevA
        } else {
            ReadRoute::DevB
        };
        sb.age += 1;
        self.read_route.store(sb.read_route as u8, Ordering::Release);

        let clean = self.clean_mirror();
        warn!(
            "Device became degraded [{}] [age:{}] [vol:{}]",
            self.dirty_mirror().disk.describe(),
            sb.age,
            self.uuid
        );
        if let Err(err) = write_superblock(&*clean.disk, &sb, ReadRoute::DevB == sb.read_route) {
            sb.read_route = orig_route;
            sb.age = orig_age;
            self.read_route.store(orig_route as u8, Ordering::Release);
            self.degraded.store(false, Ordering::Release);
            error!("Could not become degraded [vol:{}]: {err}", self.uuid);
            return Err(err);
        }
        drop(sb);

        self.dirty_mirror().unavail.store(true, Ordering::Release);
        if spawn_resync && self.resync_enabled.load(Ordering::Acquire) {
            self.spawn_resync();
        }
        Ok(0)
    }

    /// When the bitmap has emptied the mirror returns to CLEAN; both
    /// superblocks learn the new route.
    fn become_clean(&self) -> IoResult {
        if !self.is_degraded() {
            return Ok(0);
        }
        info!(
            "Device becoming clean [{}] [vol:{}]",
            self.dirty_mirror().disk.describe(),
            self.uuid
        );
        let (dev_a, dev_b) = self.mirror_pair();
        {
            let mut sb = self.sb.lock().expect("superblock lock poisoned");
            sb.read_route = ReadRoute::Either;
            self.read_route
                .store(ReadRoute::Either as u8, Ordering::Release);
            if let Err(err) = write_superblock(&*dev_a.disk, &sb, false) {
                warn!("Could not become clean [vol:{}]: {err}", self.uuid);
            }
            if let Err(err) = write_superblock(&*dev_b.disk, &sb, true) {
                warn!("Could not become clean [vol:{}]: {err}", self.uuid);
            }
        }
        self.degraded.store(false, Ordering::Release);
        Ok(0)
    }

    /// Clear chunk bits over `[addr, addr + len)` and opportunistically
    /// flush pages that became all-zero to the clean device. These writes
    /// are best-effort.
    fn clean_extent(
        &self,
        sub_cmd: SubCmd,
        addr: u64,
        len: u64,
        q: Option<&dyn UblkQueue>,
        io: Option<&IoDesc>,
    ) -> IoResult {
        trace!(
            "Cleaning pages for [lba:{:#x}|len:{:#x}|sub_cmd:{}] [vol:{}]",
            addr >> self.params.logical_bs_shift,
            len,
            sub_cmd,
            self.uuid
        );
        let end = addr + len;
        let mut cur = addr;
        let mut issued = 0usize;
        while cur < end {
            let (page_clean, page_idx, sz) = self.bitmap.clean_region(cur, end - cur);
            cur += sz;
            if !page_clean {
                continue;
            }
            let iovs = [self.bitmap.zero_page_iovec()];
            let page_addr = PAGE_SIZE * page_idx as u64 + PAGE_SIZE;
            let clean_sub = self.clean_sub(sub_cmd);
            let clean = self.side_of(clean_sub);
            match (q, io) {
                (Some(q), Some(io)) => {
                    issued += clean.disk.async_iov(q, io, clean_sub, &iovs, page_addr)?;
                }
                _ => {
                    clean.disk.sync_iov(UBLK_IO_OP_WRITE, &iovs, page_addr)?;
                }
            }
        }
        if let Some(q) = q {
            if 0 < issued {
                // The zero-page iovec is stack-described; submit before
                // returning
                q.submit();
            }
        }
        Ok(issued)
    }

    /// A failed sub-command re-submitted by the runtime lands here. The
    /// divergence is recorded and, for the primary write, a synthesized
    /// completion reports success to the guest: the data made it to the
    /// surviving side.
    fn handle_async_retry(
        self: &Arc<Self>,
        sub_cmd: SubCmd,
        addr: u64,
        len: u64,
        q: &dyn UblkQueue,
        io: &IoDesc,
    ) -> IoResult {
        if self.is_degraded() && sub_cmd == self.clean_sub(sub_cmd) {
            // Retry failed on the surviving side; nothing left to recover to
            return Err(DiskError::IoError(Errno::EIO));
        }

        let dirty_res = self.become_degraded(sub_cmd, true)?;
        self.bitmap.dirty_region(addr, len);

        if sub_cmd.is_replicate() {
            return Ok(dirty_res);
        }

        self.pending
            .lock()
            .expect("pending lock poisoned")
            .entry(q.q_id())
            .or_default()
            .push(AsyncResult {
                tag: io.tag,
                sub_cmd,
                result: len as i32,
            });
        q.send_event()?;
        Ok(dirty_res + 1)
    }

    /// Mutations replicate to both replicas through `func`. The primary
    /// goes to the clean side; its failure swaps the roles and re-issues.
    /// The secondary is tagged REPLICATE so its byte count never doubles
    /// into the guest result, and its failure converts into a bitmap update
    /// rather than an error.
    fn replicate(
        self: &Arc<Self>,
        sub_cmd: SubCmd,
        func: &dyn Fn(&dyn UblkDisk, SubCmd) -> IoResult,
        addr: u64,
        len: u64,
    ) -> IoResult {
        let replica_write = sub_cmd.is_replicate();
        let mut sub_cmd = sub_cmd;
        if !replica_write {
            sub_cmd = self.clean_sub(sub_cmd.shift_route(1));
        }

        let target = self.side_of(sub_cmd);
        let res = match func(&*target.disk, sub_cmd) {
            Ok(res) => res,
            Err(err) => {
                if self.is_degraded() && !replica_write {
                    error!("Double failure! [sub_cmd:{sub_cmd}] [vol:{}]", self.uuid);
                    return Err(err);
                }
                let dirty_res = self.become_degraded(sub_cmd, true)?;
                self.bitmap.dirty_region(addr, len);
                if replica_write {
                    return Ok(dirty_res);
                }
                // Roles swapped; the previous dirty side is now primary
                let retry_sub = self.clean_sub(sub_cmd);
                let res = func(&*self.side_of(retry_sub).disk, retry_sub)?;
                return Ok(res + dirty_res);
            }
        };
        if replica_write {
            return Ok(res);
        }

        if self.is_degraded() {
            let dirty = self.dirty_mirror();
            let dirty_unavail = dirty.unavail.load(Ordering::Acquire);
            if dirty_unavail || self.bitmap.is_dirty(addr, len) {
                let chunk = self.bitmap.chunk_size() as u64;
                let aligned = chunk <= len && 0 == len % chunk && 0 == addr % chunk;
                if dirty_unavail || !aligned {
                    self.bitmap.dirty_region(addr, len);
                    return Ok(res);
                }
                // Attempt the write on the known-degraded device; the
                // INTERNAL completion clears the covered chunk bits on
                // success
                sub_cmd = sub_cmd.set_flags(SubCmdFlags::INTERNAL);
            }
        }

        let replica_sub = self.dirty_sub(sub_cmd).set_flags(SubCmdFlags::REPLICATE);
        let replica_res = self.replicate(replica_sub, func, addr, len)?;
        Ok(res + replica_res)
    }

    /// Reads round-robin between the replicas, avoid extents the bitmap
    /// marks stale, and fail over once: a failed side is re-attempted on
    /// its peer with RETRIED set, carrying the attempted route so the
    /// second failure is final.
    fn failover_read(
        &self,
        sub_cmd: SubCmd,
        func: &dyn Fn(&dyn UblkDisk, SubCmd) -> IoResult,
        addr: u64,
        len: u64,
    ) -> IoResult {
        let retry = sub_cmd.is_retry();
        let mut sub_cmd = sub_cmd;
        let (_, dev_b) = self.mirror_pair();
        if retry {
            let side_b = 0b1 == (sub_cmd.raw() >> dev_b.disk.route_size()) & 0b1;
            self.last_read.store(
                if side_b {
                    ReadRoute::DevB
                } else {
                    ReadRoute::DevA
                } as u8,
                Ordering::Release,
            );
        } else {
            sub_cmd = sub_cmd.shift_route(1);
        }

        let degraded = self.is_degraded();
        let route_now = self.route();
        let mut route = ReadRoute::DevA;
        let mut need_to_test = false;
        if degraded && !retry && self.dirty_mirror().unavail.load(Ordering::Acquire) {
            route = route_now;
        } else if ReadRoute::DevB as u8 == self.last_read.load(Ordering::Acquire) {
            if ReadRoute::DevB == route_now {
                need_to_test = true;
            }
        } else {
            route = ReadRoute::DevB;
            if ReadRoute::DevA == route_now {
                need_to_test = true;
            }
        }

        // The degraded side still serves chunks the bitmap proves clean
        if degraded
            && need_to_test
            && (!self.opts.read_from_dirty || self.bitmap.is_dirty(addr, len))
        {
            route = if ReadRoute::DevA == route {
                ReadRoute::DevB
            } else {
                ReadRoute::DevA
            };
        }

        if retry && self.last_read.load(Ordering::Acquire) == route as u8 {
            return Err(DiskError::IoError(Errno::EIO));
        }
        self.last_read.store(route as u8, Ordering::Release);

        let attempted = sub_cmd.to_side_b(ReadRoute::DevB == route);
        let res = func(&*self.side_of(attempted).disk, attempted);
        if res.is_ok() || retry {
            return res;
        }

        self.failover_read(
            attempted.set_flags(SubCmdFlags::RETRIED),
            func,
            addr,
            len,
        )
    }

    fn replica_states(&self) -> ArrayState {
        let bytes_to_sync = self.bitmap.dirty_data_est();
        let (dev_a, dev_b) = self.mirror_pair();
        let stale_state = |mirror: &MirrorDevice| {
            if mirror.unavail.load(Ordering::Acquire) {
                ReplicaState::Error
            } else {
                ReplicaState::Syncing
            }
        };
        match self.route() {
            ReadRoute::DevA => ArrayState {
                device_a: ReplicaState::Clean,
                device_b: stale_state(&dev_b),
                bytes_to_sync,
            },
            ReadRoute::DevB => ArrayState {
                device_a: stale_state(&dev_a),
                device_b: ReplicaState::Clean,
                bytes_to_sync,
            },
            ReadRoute::Either => ArrayState {
                device_a: ReplicaState::Clean,
                device_b: ReplicaState::Clean,
                bytes_to_sync: 0,
            },
        }
    }

    // Swap rules, checked in order:
    //
    // * the incoming device must support direct I/O without volatile
    //   caching
    // * the incoming device must hold capacity() + reserved_size bytes
    //   with a logical block size no larger than the array's
    // * the outgoing device is part of a clean array OR the dirty side of
    //   a degraded one
    //
    // The incoming superblock then decides the resync scope: a foreign or
    // absent superblock, or an age more than one behind, forces a full
    // resync; otherwise the device re-enters with its bitmap intact. The
    // array age jumps by 16 so the outgoing disk is unambiguously stale if
    // it is ever reinserted.
    fn swap(
        self: &Arc<Self>,
        old_id: &str,
        new_device: Arc<dyn UblkDisk>,
    ) -> Result<Arc<dyn UblkDisk>, DiskError> {
        if !new_device.params().direct_io {
            return Err(DiskError::NotPermitted);
        }
        if self.params.dev_sectors + (self.reserved_size >> SECTOR_SHIFT)
            > new_device.params().dev_sectors
            || self.params.logical_bs_shift < new_device.params().logical_bs_shift
        {
            error!(
                "Refusing to use device, requires: [lbs<={} && cap>={}Ki]!",
                1u32 << self.params.logical_bs_shift,
                (self.params.dev_sectors << SECTOR_SHIFT) / KI
            );
            return Err(DiskError::NotPermitted);
        }

        let (dev_a, dev_b) = self.mirror_pair();
        if self.is_degraded() && self.clean_mirror().disk.id() == old_id {
            error!("Refusing to replace working mirror from degraded device!");
            return Err(DiskError::NotPermitted);
        }
        let slot_b = if dev_a.disk.id() == old_id {
            false
        } else if dev_b.disk.id() == old_id {
            true
        } else {
            error!("Refusing to replace unrecognized mirror!");
            return Err(DiskError::NotPermitted);
        };

        let (new_sb, mut is_new) =
            load_superblock(&*new_device, &self.uuid, self.bitmap.chunk_size())?;
        {
            let sb = self.sb.lock().expect("superblock lock poisoned");
            if new_sb.age + 1 < sb.age {
                debug!("Age read: {} Current: {}", new_sb.age, sb.age);
                is_new = true;
            }
        }
        let new_mirror = MirrorDevice::new(new_device);
        if is_new {
            self.bitmap.init_to(&*new_mirror.disk)?;
        }

        if !self.stop_resync() {
            return Err(DiskError::OperationInProgress);
        }
        self.degraded.store(false, Ordering::Release);

        if is_new {
            self.bitmap.dirty_region(0, self.capacity());
        }

        {
            let mut sb = self.sb.lock().expect("superblock lock poisoned");
            sb.age += 16;
        }
        let old_disk = {
            let mut mirrors = self.mirrors.write().expect("mirror lock poisoned");
            let old = mirrors[slot_b as usize].disk.clone();
            mirrors[slot_b as usize] = new_mirror.clone();
            old
        };
        {
            let sb = self.sb.lock().expect("superblock lock poisoned");
            write_superblock(&*new_mirror.disk, &sb, slot_b)?;
        }
        let sub_cmd = if slot_b {
            SubCmd::from_raw(1 << new_mirror.disk.route_size())
        } else {
            SubCmd::NONE
        };
        self.become_degraded(sub_cmd, false)?;

        let _ = self.resync_state.compare_exchange(
            RESYNC_STOPPED,
            RESYNC_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.resync_enabled.load(Ordering::Acquire) {
            self.spawn_resync();
        }
        Ok(old_disk)
    }

    fn toggle_resync(self: &Arc<Self>, enable: bool) {
        if !self.stop_resync() {
            self.resync_enabled.store(enable, Ordering::Release);
            return;
        }
        self.resync_enabled.store(enable, Ordering::Release);
        let _ = self.resync_state.compare_exchange(
            RESYNC_STOPPED,
            RESYNC_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_degraded() && enable {
            self.spawn_resync();
        }
    }

    // ---- resync task ----

    fn spawn_resync(self: &Arc<Self>) {
        let mut task = self.resync_task.lock().expect("resync task lock poisoned");
        if let Some(handle) = task.take() {
            let _ = handle.join();
        }
        let inner = self.clone();
        let mut name = format!("r_{}", self.uuid);
        name.truncate(15); // kernel comm limit
        *task = Some(
            thread::Builder::new()
                .name(name)
                .spawn(move || inner.resync_task())
                .expect("resync thread spawn"),
        );
    }

    /// Wind the resync task down and join it. Returns false if the task
    /// was already stopped by another caller.
    fn stop_resync(&self) -> bool {
        let mut cur = RESYNC_PAUSE;
        loop {
            match self.resync_state.compare_exchange_weak(
                cur,
                RESYNC_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => match observed {
                    RESYNC_STOPPED => return false,
                    RESYNC_ACTIVE => cur = RESYNC_SLEEPING,
                    other => cur = other,
                },
            }
        }
        if let Some(handle) = self
            .resync_task
            .lock()
            .expect("resync task lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        true
    }

    fn resync_task(self: Arc<Self>) {
        debug!("Resync task created for [vol:{}]", self.uuid);
        let mut cur = RESYNC_IDLE;
        // Wait to become the active copier
        while self.is_degraded() {
            match self.resync_state.compare_exchange_weak(
                cur,
                RESYNC_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => {
                    if matches!(observed, RESYNC_STOPPED | RESYNC_ACTIVE | RESYNC_SLEEPING) {
                        debug!(
                            "Resync task aborted for [vol:{}] state: {observed}",
                            self.uuid
                        );
                        return;
                    }
                    cur = RESYNC_IDLE;
                    thread::sleep(Duration::from_micros(300));
                }
            }
        }

        let cur = self.clean_bitmap();
        if RESYNC_STOPPED == cur {
            debug!("Resync task stopped for [vol:{}]", self.uuid);
            return;
        }
        if self.is_degraded() && 0 == self.bitmap.dirty_pages() {
            let _ = self.become_clean();
        }
        let _ = self.resync_state.compare_exchange(
            cur,
            RESYNC_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!("Resync task finished for [vol:{}]", self.uuid);
    }

    // Copy dirty extents from the clean replica to the stale one, yielding
    // to guest I/O between rounds. A copy failure marks the stale side
    // unavailable and backs off until it answers again.
    fn clean_bitmap(&self) -> u8 {
        let mut cur = RESYNC_ACTIVE;
        let max_io = self.max_io_bytes();
        let buf = match AlignedBuf::new(max_io, self.block_size() as usize) {
            Ok(buf) => buf,
            Err(err) => {
                error!("Could not allocate memory for I/O: {err}");
                return cur;
            }
        };

        let mut nr_pages = self.bitmap.dirty_pages();
        while 0 < nr_pages {
            let mut copies_left = self.opts.resync_level.min(32) * 100 / 32 * 5;
            let (mut logical_off, mut sz) = self.bitmap.next_dirty();
            debug!(
                "Data left to resync ~= {}KiB [pages:{}]",
                self.bitmap.dirty_data_est() / KI,
                nr_pages
            );
            while 0 < sz && 0 < copies_left {
                copies_left -= 1;
                let len = sz.min(max_io as u64);
                trace!(
                    "Copying lba: {:#x} for {}KiB",
                    logical_off >> self.params.logical_bs_shift,
                    len / KI
                );
                let iovs = [IoVec::new(buf.as_ptr(), len as usize)];
                let clean = self.clean_mirror();
                let dirty = self.dirty_mirror();
                let copied = clean
                    .disk
                    .sync_iov(UBLK_IO_OP_READ, &iovs, logical_off + self.reserved_size)
                    .and_then(|_| {
                        dirty.disk.sync_iov(
                            UBLK_IO_OP_WRITE,
                            &iovs,
                            logical_off + self.reserved_size,
                        )
                    });
                match copied {
                    Ok(_) => {
                        dirty.unavail.store(false, Ordering::Release);
                        let _ = self.clean_extent(SubCmd::NONE, logical_off, len, None, None);
                    }
                    Err(err) => {
                        warn!("Could not copy region of [sz:{len}] [res:{err}]");
                        dirty.unavail.store(true, Ordering::Release);
                        break;
                    }
                }
                (logical_off, sz) = self.bitmap.next_dirty();
            }

            // Give I/O a chance to interrupt the resync
            loop {
                match self.resync_state.compare_exchange_weak(
                    cur,
                    RESYNC_SLEEPING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => {
                        if RESYNC_STOPPED == observed {
                            return RESYNC_STOPPED;
                        }
                        cur = observed;
                    }
                }
            }
            cur = RESYNC_SLEEPING;
            // Give time for the degraded device to become available again
            thread::sleep(
                if self.dirty_mirror().unavail.load(Ordering::Acquire) {
                    Duration::from_secs(5)
                } else {
                    Duration::from_micros(30)
                },
            );

            loop {
                match self.resync_state.compare_exchange_weak(
                    cur,
                    RESYNC_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => match observed {
                        RESYNC_PAUSE => {
                            cur = RESYNC_IDLE;
                            thread::sleep(Duration::from_micros(300));
                        }
                        RESYNC_STOPPED => return RESYNC_STOPPED,
                        other => cur = other,
                    },
                }
            }
            cur = RESYNC_ACTIVE;
            nr_pages = self.bitmap.dirty_pages();
        }
        cur
    }

    fn idle_transition_inner(&self, entering: bool) {
        if entering {
            let _ = self.resync_state.compare_exchange(
                RESYNC_PAUSE,
                RESYNC_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }
        // Force a running resync task to observe PAUSE before guest I/O
        // proceeds; every 512th operation lets the task breathe
        let mut cur = RESYNC_SLEEPING;
        loop {
            match self.resync_state.compare_exchange_weak(
                cur,
                RESYNC_PAUSE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => match observed {
                    RESYNC_PAUSE => {
                        if !self.is_degraded() {
                            break;
                        }
                        let cnt = self.io_op_cnt.fetch_add(1, Ordering::Relaxed);
                        if 0 == cnt % 512 {
                            let _ = self.resync_state.compare_exchange(
                                RESYNC_PAUSE,
                                RESYNC_IDLE,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                            cur = RESYNC_IDLE;
                        } else {
                            break;
                        }
                    }
                    RESYNC_ACTIVE => cur = RESYNC_SLEEPING,
                    RESYNC_STOPPED => break,
                    _ => {
                        cur = RESYNC_IDLE;
                        continue;
                    }
                },
            }
            thread::sleep(Duration::from_micros(10));
        }
    }

    fn handle_internal_inner(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
        result: i32,
    ) -> IoResult {
        let sub_cmd = sub_cmd.unset_flags(SubCmdFlags::INTERNAL);
        let len = iovec_len(iovs) as u64;

        if 0 == result {
            self.dirty_mirror().unavail.store(false, Ordering::Release);
            return self.clean_extent(sub_cmd, addr, len, Some(q), Some(io));
        }
        self.bitmap.dirty_region(addr, len);
        Ok(0)
    }

    fn close(&self) {
        debug!("Shutting down; [vol:{}]", self.uuid);
        self.stop_resync();
        let sb = self.sb.lock();
        let Ok(mut sb) = sb else { return };

        // Persist the divergence record before declaring the unmount clean
        if self.is_degraded() {
            let clean = self.clean_mirror();
            if self
                .bitmap
                .sync_to(&*clean.disk, SB_PAGE_SIZE as u64)
                .is_err()
            {
                warn!(
                    "Could not sync bitmap to device on shutdown, will require full resync \
                     next time! [vol:{}]",
                    self.uuid
                );
                return;
            }
        }
        sb.clean_unmount = true;
        let route = sb.read_route;
        let clean = self.clean_mirror();
        if write_superblock(&*clean.disk, &sb, ReadRoute::DevB == route).is_err() {
            if self.is_degraded() {
                error!(
                    "Failed to clear clean bit...full sync required upon next assembly [vol:{}]",
                    self.uuid
                );
            } else {
                warn!(
                    "Failed to clear clean bit [vol:{}] dev: {}",
                    self.uuid,
                    clean.disk.describe()
                );
            }
        }
        if !self.is_degraded() {
            let dirty = self.dirty_mirror();
            if write_superblock(&*dirty.disk, &sb, ReadRoute::DevB != route).is_err() {
                warn!(
                    "Failed to clear clean bit [vol:{}] dev: {}",
                    self.uuid,
                    dirty.disk.describe()
                );
            }
        }
    }

    fn block_size(&self) -> u32 {
        1 << self.params.logical_bs_shift
    }

    fn max_io_bytes(&self) -> usize {
        (self.params.max_sectors as usize) << SECTOR_SHIFT
    }
}

impl UblkDisk for Raid1Disk {
    fn params(&self) -> &DeviceParams {
        &self.inner.params
    }

    fn id(&self) -> String {
        "RAID1".to_string()
    }

    fn open_for_uring(&self, start_fd: i32) -> Vec<RawFd> {
        let (dev_a, dev_b) = self.inner.mirror_pair();
        let mut fds = dev_a.disk.open_for_uring(start_fd);
        fds.extend(dev_b.disk.open_for_uring(start_fd + fds.len() as i32));
        fds
    }

    fn route_size(&self) -> u8 {
        1
    }

    fn collect_async(&self, q: &dyn UblkQueue, out: &mut Vec<AsyncResult>) {
        if let Some(mut pending) = self
            .inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .get_mut(&q.q_id())
            .map(std::mem::take)
        {
            out.append(&mut pending);
        }
        let (dev_a, dev_b) = self.inner.mirror_pair();
        for mirror in [dev_a, dev_b] {
            if mirror.disk.params().uses_external_completion {
                mirror.disk.collect_async(q, out);
            }
        }
    }

    fn idle_transition(&self, entering: bool) {
        self.inner.idle_transition_inner(entering);
    }

    fn handle_internal(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
        result: i32,
    ) -> IoResult {
        self.inner
            .handle_internal_inner(q, io, sub_cmd, iovs, addr, result)
    }

    // A mirror only stacks on direct-I/O devices, so there is nothing to
    // flush
    fn handle_flush(&self, _q: &dyn UblkQueue, _io: &IoDesc, _sub_cmd: SubCmd) -> IoResult {
        Ok(0)
    }

    fn handle_discard(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult {
        trace!(
            "Received DISCARD: [tag:{:#x}] [lba:{:#x}|len:{:#x}] [vol:{}]",
            io.tag,
            addr >> self.inner.params.logical_bs_shift,
            len,
            self.inner.uuid
        );
        self.inner.idle_transition_inner(false);

        if sub_cmd.is_retry() {
            return self
                .inner
                .handle_async_retry(sub_cmd, addr, len as u64, q, io);
        }

        let reserved = self.inner.reserved_size;
        self.inner.replicate(
            sub_cmd,
            &|device, scmd| {
                // Discards skip the optimistic INTERNAL attempt
                if scmd.is_internal() {
                    return Ok(0);
                }
                device.handle_discard(q, io, scmd, len, addr + reserved)
            },
            addr,
            len as u64,
        )
    }

    fn async_iov(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
    ) -> IoResult {
        let len = iovec_len(iovs) as u64;
        trace!(
            "Received {}: [tag:{:#x}] [lba:{:#x}|len:{:#x}] [sub_cmd:{}] [vol:{}]",
            op_name(io.op),
            io.tag,
            addr >> self.inner.params.logical_bs_shift,
            len,
            sub_cmd,
            self.inner.uuid
        );
        self.inner.idle_transition_inner(false);

        let reserved = self.inner.reserved_size;
        if UBLK_IO_OP_READ == io.op {
            return self.inner.failover_read(
                sub_cmd,
                &|device, scmd| device.async_iov(q, io, scmd, iovs, addr + reserved),
                addr,
                len,
            );
        }

        if sub_cmd.is_retry() {
            return self.inner.handle_async_retry(sub_cmd, addr, len, q, io);
        }

        self.inner.replicate(
            sub_cmd,
            &|device, scmd| device.async_iov(q, io, scmd, iovs, addr + reserved),
            addr,
            len,
        )
    }

    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        let len = iovec_len(iovs) as u64;
        trace!(
            "Received {}: [lba:{:#x}|len:{:#x}] [vol:{}]",
            op_name(op),
            addr >> self.inner.params.logical_bs_shift,
            len,
            self.inner.uuid
        );
        self.inner.idle_transition_inner(false);

        let reserved = self.inner.reserved_size;
        if UBLK_IO_OP_READ == op {
            return self.inner.failover_read(
                SubCmd::NONE,
                &|device, _| device.sync_iov(UBLK_IO_OP_READ, iovs, addr + reserved),
                addr,
                len,
            );
        }

        // The target normally discounts replica results; for the sync path
        // the byte count is assembled here
        let total = std::cell::Cell::new(0usize);
        self.inner.replicate(
            SubCmd::NONE,
            &|device, scmd| {
                let res = device.sync_iov(op, iovs, addr + reserved)?;
                if !scmd.is_replicate() {
                    total.set(total.get() + res);
                }
                Ok(res)
            },
            addr,
            len,
        )?;
        Ok(total.get())
    }
}
