//! RAID-0: N backing devices striped at a configurable stripe size.
//!
//! The engine splits a single logical request along stripe boundaries,
//! accumulating per-device scatter lists as the request wraps around the
//! stride, and issues one sub-command per touched device. The first stripe
//! of every backing device is reserved for the array superblock, so virtual
//! address 0 begins one full stride into the physical layout.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use uuid::Uuid;

use crate::buf::{iovec_len, IoVec};
use crate::disk::{AsyncResult, DeviceParams, DiskError, IoResult, UblkDisk};
use crate::raid::superblock::{read_page, write_page, SB_PAGE_SIZE};
use crate::sub_cmd::SubCmd;
use crate::ublk::{op_name, IoDesc, UblkQueue};
use crate::SECTOR_SHIFT;

/// Route width is fixed at 4 bits, so arrays wider than 16 stripes are
/// rejected at construction.
pub const MAX_STRIPES: usize = 16;
const ROUTE_BITS: u8 = 4;

/// Most iovec slices a single request can land on one stripe: a maximum
/// sized request wraps the stride at most this many times.
const MAX_VECS_PER_STRIPE: usize = 16;

/// Locate the next sub-request of `[addr, addr + len)`: which device it
/// lands on, the device-local offset, and how many bytes fit before the
/// stripe boundary.
pub fn next_subcmd(
    stride_width: u64,
    stripe_size: u32,
    addr: u64,
    len: u32,
) -> (usize, u64, u32) {
    // Single device, nothing to split
    if stride_width == stripe_size as u64 {
        return (0, addr, len);
    }
    let chunk_num = addr / stride_width;
    let offset_in_stride = addr % stride_width;
    let device_idx = (offset_in_stride / stripe_size as u64) as usize;
    let chunk_off = offset_in_stride % stripe_size as u64;
    let logical_off = chunk_num * stripe_size as u64 + chunk_off;
    let sz = len.min((stripe_size as u64 - chunk_off) as u32);
    (device_idx, logical_off, sz)
}

/// For operations that carry no buffer (discard), sub-requests landing on
/// the same device merge into a single contiguous extent per device.
pub fn merged_subcmds(
    stride_width: u64,
    stripe_size: u32,
    mut addr: u64,
    len: u64,
) -> BTreeMap<usize, (u64, u64)> {
    let mut merged = BTreeMap::new();
    if stride_width == stripe_size as u64 {
        merged.insert(0, (addr, len));
        return merged;
    }
    let mut cur = 0u64;
    while cur < len {
        let remain = (len - cur).min(u32::MAX as u64) as u32;
        let (device_idx, logical_off, sz) = next_subcmd(stride_width, stripe_size, addr, remain);
        merged
            .entry(device_idx)
            .and_modify(|(_, l)| *l += sz as u64)
            .or_insert((logical_off, sz as u64));
        cur += sz as u64;
        addr += sz as u64;
    }
    merged
}

pub const MAGIC: [u8; 16] = [
    0x57, 0xE5, 0x3A, 0x89, 0xAC, 0x1B, 0x38, 0x66, 0x55, 0xFF, 0x84, 0x35, 0x59, 0x50, 0xC6,
    0x27,
];
pub const SB_VERSION: u16 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 16;
const OFF_UUID: usize = 18;
const OFF_STRIPE_OFF: usize = 34;
const OFF_STRIPE_SIZE: usize = 36;
static_assertions::const_assert!(OFF_STRIPE_SIZE + 4 <= SB_PAGE_SIZE);

/// The per-device array superblock, stored big-endian in page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u16,
    pub uuid: Uuid,
    pub stripe_off: u16,
    pub stripe_size: u32,
}

impl SuperBlock {
    pub fn decode(page: &[u8]) -> Option<SuperBlock> {
        if page[OFF_MAGIC..OFF_MAGIC + 16] != MAGIC {
            return None;
        }
        Some(SuperBlock {
            version: u16::from_be_bytes(page[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap()),
            uuid: Uuid::from_slice(&page[OFF_UUID..OFF_UUID + 16]).unwrap(),
            stripe_off: u16::from_be_bytes(
                page[OFF_STRIPE_OFF..OFF_STRIPE_OFF + 2].try_into().unwrap(),
            ),
            stripe_size: u32::from_be_bytes(
                page[OFF_STRIPE_SIZE..OFF_STRIPE_SIZE + 4].try_into().unwrap(),
            ),
        })
    }

    pub fn encode(&self, page: &mut [u8]) {
        page.fill(0);
        page[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&MAGIC);
        page[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_be_bytes());
        page[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        page[OFF_STRIPE_OFF..OFF_STRIPE_OFF + 2].copy_from_slice(&self.stripe_off.to_be_bytes());
        page[OFF_STRIPE_SIZE..OFF_STRIPE_SIZE + 4]
            .copy_from_slice(&self.stripe_size.to_be_bytes());
    }
}

// Read and verify the array superblock off a device, initializing it when
// the magic is missing and migrating older versions forward.
fn load_superblock(
    device: &dyn UblkDisk,
    uuid: &Uuid,
    stripe_size: u32,
    stripe_off: u16,
) -> Result<SuperBlock, DiskError> {
    let mut page = read_page(device)?;
    let mut sb = match SuperBlock::decode(page.as_slice()) {
        Some(sb) => sb,
        None => {
            warn!(
                "Device [{}] does not have a valid raid0 superblock, initializing",
                device.describe()
            );
            SuperBlock {
                version: 0,
                uuid: *uuid,
                stripe_off,
                stripe_size,
            }
        }
    };

    if sb.uuid != *uuid {
        error!(
            "Superblock did not have a matching UUID expected: {} read: {}",
            uuid, sb.uuid
        );
        return Err(DiskError::InvalidArgument);
    }
    if sb.stripe_size != stripe_size || sb.stripe_off != stripe_off {
        error!(
            "Superblock does not match given array parameters: expected \
             [stripe_sz:{:#x},stripe_off:{}] != found [stripe_sz:{:#x},stripe_off:{}]",
            stripe_size, stripe_off, sb.stripe_size, sb.stripe_off
        );
        return Err(DiskError::InvalidArgument);
    }
    debug!(
        "Device has v{:#x} superblock [stripe_sz:{:#x},stripe_off:{}]",
        sb.version, stripe_size, stripe_off
    );

    if SB_VERSION > sb.version {
        sb.version = SB_VERSION;
        sb.encode(page.as_mut_slice());
        write_page(device, &page)?;
    }
    Ok(sb)
}

struct StripeDevice {
    dev: Arc<dyn UblkDisk>,
    _sb: SuperBlock,
}

pub struct Raid0Disk {
    params: DeviceParams,
    stripe_size: u32,
    stride_width: u64,
    stripes: Vec<StripeDevice>,
}

impl Raid0Disk {
    pub fn open(
        uuid: &Uuid,
        stripe_size: u32,
        disks: Vec<Arc<dyn UblkDisk>>,
    ) -> Result<Raid0Disk, DiskError> {
        if disks.is_empty() || disks.len() > MAX_STRIPES {
            error!(
                "RAID-0 arrays support 1-{MAX_STRIPES} devices, got {}",
                disks.len()
            );
            return Err(DiskError::InvalidArgument);
        }
        if 0 == stripe_size || 0 != (stripe_size & (stripe_size - 1)) {
            error!("Stripe size must be a power of two, got {stripe_size}");
            return Err(DiskError::InvalidArgument);
        }

        let nr_disks = disks.len();
        let mut params = DeviceParams {
            can_discard: true,
            direct_io: true,
            ..DeviceParams::default()
        };

        let mut stripes = Vec::with_capacity(nr_disks);
        for (idx, device) in disks.into_iter().enumerate() {
            let dev_params = device.params();
            params.dev_sectors = params.dev_sectors.min(dev_params.dev_sectors);
            params.logical_bs_shift = params.logical_bs_shift.max(dev_params.logical_bs_shift);
            params.physical_bs_shift = params.physical_bs_shift.max(dev_params.physical_bs_shift);
            params.max_sectors = params
                .max_sectors
                .min(dev_params.max_sectors.saturating_mul(nr_disks as u32));
            params.can_discard &= dev_params.can_discard;
            params.direct_io &= dev_params.direct_io;
            params.uses_external_completion |= dev_params.uses_external_completion;

            let sb = load_superblock(&*device, uuid, stripe_size, idx as u16)?;
            stripes.push(StripeDevice { dev: device, _sb: sb });
        }

        // The volume is a multiple of the smallest array device, less the
        // first stripe of each device which holds the superblock.
        params.dev_sectors -= (stripe_size >> SECTOR_SHIFT) as u64;
        params.dev_sectors *= nr_disks as u64;

        if params.can_discard {
            params.discard_granularity =
                params.discard_granularity.max(1 << params.logical_bs_shift);
        }

        Ok(Raid0Disk {
            params,
            stripe_size,
            stride_width: stripe_size as u64 * nr_disks as u64,
            stripes,
        })
    }

    pub fn stripe_size(&self) -> u32 {
        self.stripe_size
    }

    // Split a single-iovec request across the stripe set, collecting the
    // scatter elements each device receives as the request wraps around the
    // stride, and calling `func` once per touched device. On retry only the
    // device named by the sub-command's low route bits is re-issued.
    fn distribute<F>(
        &self,
        iovs: &[IoVec],
        addr: u64,
        retry: bool,
        sub_cmd: SubCmd,
        mut func: F,
    ) -> IoResult
    where
        F: FnMut(usize, SubCmd, &[IoVec], u64) -> IoResult,
    {
        if 1 == self.stripes.len() {
            return func(0, sub_cmd, iovs, addr);
        }

        debug_assert!(iovs[0].len <= u32::MAX as usize);
        let len = iovs[0].len as u32;

        struct Acc {
            addr: u64,
            cnt: usize,
            iovs: [IoVec; MAX_VECS_PER_STRIPE],
        }
        let mut accs: [Acc; MAX_STRIPES] = std::array::from_fn(|_| Acc {
            addr: 0,
            cnt: 0,
            iovs: [IoVec::new(std::ptr::null_mut(), 0); MAX_VECS_PER_STRIPE],
        });

        let mut cnt = 0usize;
        let mut off = 0u32;
        while off < len {
            let (stripe_idx, logical_off, sz) =
                next_subcmd(self.stride_width, self.stripe_size, addr + off as u64, len - off);

            // Advance before anything below can skip the iteration
            let cursor = unsafe { iovs[0].base.add(off as usize) };
            off += sz;

            let device = &self.stripes[stripe_idx].dev;
            if retry {
                // Mask off "our" portion of the original route; skip devices
                // that did not process the failed sub-command.
                if stripe_idx != ((sub_cmd.raw() >> device.route_size()) & 0x0F) as usize {
                    continue;
                }
            }

            let acc = &mut accs[stripe_idx];
            debug_assert!(acc.cnt < MAX_VECS_PER_STRIPE);
            acc.iovs[acc.cnt] = IoVec::new(cursor, sz as usize);
            acc.cnt += 1;
            if 1 == acc.cnt {
                acc.addr = logical_off;
            }

            // Last sub-request for this device, issue now
            if self.stride_width - self.stripe_size as u64 >= (len - off) as u64 {
                let new_sub_cmd = if retry {
                    sub_cmd
                } else {
                    sub_cmd.child(stripe_idx as u16)
                };
                let res = func(stripe_idx, new_sub_cmd, &acc.iovs[..acc.cnt], acc.addr)?;
                acc.cnt = 0;
                cnt += res;
            }
        }
        Ok(cnt)
    }
}

impl UblkDisk for Raid0Disk {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn id(&self) -> String {
        "RAID0".to_string()
    }

    fn open_for_uring(&self, start_fd: i32) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for stripe in &self.stripes {
            fds.extend(stripe.dev.open_for_uring(start_fd + fds.len() as i32));
        }
        fds
    }

    fn route_size(&self) -> u8 {
        ROUTE_BITS
    }

    fn collect_async(&self, q: &dyn UblkQueue, out: &mut Vec<AsyncResult>) {
        for stripe in &self.stripes {
            if stripe.dev.params().uses_external_completion {
                stripe.dev.collect_async(q, out);
            }
        }
    }

    fn idle_transition(&self, entering: bool) {
        for stripe in &self.stripes {
            stripe.dev.idle_transition(entering);
        }
    }

    fn handle_flush(&self, q: &dyn UblkQueue, io: &IoDesc, sub_cmd: SubCmd) -> IoResult {
        let retry = sub_cmd.is_retry();
        let sub_cmd = if retry {
            sub_cmd
        } else {
            sub_cmd.shift_route(self.route_size())
        };
        let mut cnt = 0usize;
        for (stripe_idx, stripe) in self.stripes.iter().enumerate() {
            let new_sub_cmd = if retry {
                sub_cmd
            } else {
                sub_cmd.child(stripe_idx as u16)
            };
            cnt += stripe.dev.handle_flush(q, io, new_sub_cmd)?;
        }
        Ok(cnt)
    }

    fn handle_discard(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        len: u32,
        addr: u64,
    ) -> IoResult {
        let retry = sub_cmd.is_retry();
        let sub_cmd = if retry {
            sub_cmd
        } else {
            sub_cmd.shift_route(self.route_size())
        };

        // Adjust for the superblock stride at the head of the array; do not
        // use `addr` beyond this.
        let lba = addr >> self.params.logical_bs_shift;
        let addr = addr + self.stride_width;

        let mut cnt = 0usize;
        for (stripe_idx, (logical_off, logical_len)) in
            merged_subcmds(self.stride_width, self.stripe_size, addr, len as u64)
        {
            let device = &self.stripes[stripe_idx].dev;
            if retry && stripe_idx != ((sub_cmd.raw() >> device.route_size()) & 0x0F) as usize {
                continue;
            }
            let new_sub_cmd = if retry {
                sub_cmd
            } else {
                sub_cmd.child(stripe_idx as u16)
            };
            debug!(
                "Received DISCARD: [tag:{:x}] ublk io [lba:{:x}|len:{}] -> \
                 [stripe_off:{}|logical_lba:{:x}|logical_len:{}|sub_cmd:{}]",
                io.tag,
                lba,
                len,
                stripe_idx,
                logical_off >> self.params.logical_bs_shift,
                logical_len,
                new_sub_cmd
            );
            cnt += device.handle_discard(q, io, new_sub_cmd, logical_len as u32, logical_off)?;
        }
        Ok(cnt)
    }

    fn async_iov(
        &self,
        q: &dyn UblkQueue,
        io: &IoDesc,
        sub_cmd: SubCmd,
        iovs: &[IoVec],
        addr: u64,
    ) -> IoResult {
        // Scattered requests are not split further
        if 1 != iovs.len() {
            return Err(DiskError::InvalidArgument);
        }
        let retry = sub_cmd.is_retry();
        let sub_cmd = if retry {
            sub_cmd
        } else {
            sub_cmd.shift_route(self.route_size())
        };
        trace!(
            "Received {}: [tag:{:x}] ublk io [lba:{:x}|len:{}] [sub_cmd:{}]",
            op_name(io.op),
            io.tag,
            addr >> self.params.logical_bs_shift,
            iovs[0].len,
            sub_cmd
        );

        let addr = addr + self.stride_width;
        self.distribute(iovs, addr, retry, sub_cmd, |stripe_idx, new_sub, iovs, logical_off| {
            trace!(
                "Perform {}: [tag:{:x}] ublk async io -> \
                 [stripe_off:{}|logical_lba:{:x}|logical_len:{}|sub_cmd:{}]",
                op_name(io.op),
                io.tag,
                stripe_idx,
                logical_off >> self.params.logical_bs_shift,
                iovec_len(iovs),
                new_sub
            );
            self.stripes[stripe_idx]
                .dev
                .async_iov(q, io, new_sub, iovs, logical_off)
        })
    }

    fn sync_iov(&self, op: u8, iovs: &[IoVec], addr: u64) -> IoResult {
        if 1 != iovs.len() {
            return Err(DiskError::InvalidArgument);
        }
        let addr = addr + self.stride_width;
        self.distribute(iovs, addr, false, SubCmd::NONE, |stripe_idx, _, iovs, logical_off| {
            trace!(
                "Perform {}: ublk sync io -> [stripe_off:{}|logical_sector:{}|logical_len:{}]",
                op_name(op),
                stripe_idx,
                logical_off >> SECTOR_SHIFT,
                iovec_len(iovs)
            );
            self.stripes[stripe_idx].dev.sync_iov(op, iovs, logical_off)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KI;

    const STRIPE: u32 = 32 * KI as u32;
    const STRIDE: u64 = STRIPE as u64 * 3;

    #[test]
    fn single_device_passthrough() {
        assert_eq!(
            (0, 12345, 678),
            next_subcmd(STRIPE as u64, STRIPE, 12345, 678)
        );
    }

    #[test]
    fn split_at_stripe_boundaries() {
        // 36KiB into a 3 x 32KiB stride: device 1, 4KiB into its stripe
        let (dev, off, sz) = next_subcmd(STRIDE, STRIPE, 36 * KI, 96 * KI as u32);
        assert_eq!(1, dev);
        assert_eq!(4 * KI, off);
        assert_eq!(28 * KI as u32, sz);

        // Next piece lands on device 2's first stripe
        let (dev, off, sz) = next_subcmd(STRIDE, STRIPE, 64 * KI, 68 * KI as u32);
        assert_eq!(2, dev);
        assert_eq!(0, off);
        assert_eq!(32 * KI as u32, sz);

        // Then wraps to device 0 of the second stride
        let (dev, off, sz) = next_subcmd(STRIDE, STRIPE, 96 * KI, 36 * KI as u32);
        assert_eq!(0, dev);
        assert_eq!(32 * KI, off);
        assert_eq!(32 * KI as u32, sz);
    }

    #[test]
    fn split_covers_entire_request() {
        let len = 96 * KI as u32;
        let mut covered = 0u32;
        let mut addr = 36 * KI;
        while covered < len {
            let (_, _, sz) = next_subcmd(STRIDE, STRIPE, addr, len - covered);
            assert!(sz <= STRIPE);
            covered += sz;
            addr += sz as u64;
        }
        assert_eq!(len, covered);
    }

    #[test]
    fn merged_discard_wraps_to_one_extent_per_device() {
        // Two full strides starting mid-stride merge to one extent each
        let merged = merged_subcmds(STRIDE, STRIPE, 36 * KI, 2 * STRIDE);
        assert_eq!(3, merged.len());
        assert_eq!((32 * KI, 64 * KI), merged[&0]);
        assert_eq!((4 * KI, 64 * KI), merged[&1]);
        assert_eq!((0, 64 * KI), merged[&2]);
        assert_eq!(2 * STRIDE, merged.values().map(|(_, l)| *l).sum::<u64>());
    }

    #[test]
    fn superblock_roundtrip() {
        let sb = SuperBlock {
            version: SB_VERSION,
            uuid: Uuid::new_v4(),
            stripe_off: 2,
            stripe_size: STRIPE,
        };
        let mut page = vec![0u8; SB_PAGE_SIZE];
        sb.encode(&mut page);
        assert_eq!(sb, SuperBlock::decode(&page).unwrap());
        // Big-endian on disk
        assert_eq!(0, page[OFF_STRIPE_OFF]);
        assert_eq!(2, page[OFF_STRIPE_OFF + 1]);
    }

    #[test]
    fn superblock_magic_gate() {
        let page = vec![0u8; SB_PAGE_SIZE];
        assert!(SuperBlock::decode(&page).is_none());
    }
}
