//! RAID-1 mirror superblock: one 4 KiB page at offset 0 of each replica.
//!
//! All multi-byte fields are big-endian on disk. The `age` counter is the
//! sole authority when reconciling divergent replicas: it strictly
//! increases on every clean/degraded transition, and the higher age wins.

use log::{debug, error, warn};
use uuid::Uuid;

use crate::buf::AlignedBuf;
use crate::disk::{DiskError, IoResult, UblkDisk};
use crate::raid::superblock::{read_page, write_page, SB_PAGE_SIZE};

pub const MAGIC: [u8; 16] = [
    0x53, 0x25, 0xFF, 0x0A, 0x34, 0x99, 0x3E, 0xC5, 0x67, 0x3A, 0xC8, 0x17, 0x49, 0xAE, 0x1B,
    0x64,
];
pub const SB_VERSION: u16 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 16;
const OFF_UUID: usize = 18;
const OFF_BITS: usize = 34;
// 35..51 reserved for a bitmap uuid, written as zeros
const OFF_CHUNK_SIZE: usize = 51;
const OFF_AGE: usize = 55;
/// Tail of the page reserved for a fast per-page dirty index.
pub const SUPER_BITMAP_RESERVED: usize = 4022;
static_assertions::const_assert!(OFF_AGE + 8 + SUPER_BITMAP_RESERVED <= SB_PAGE_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadRoute {
    /// Both replicas are clean; reads round-robin.
    Either = 0,
    /// Replica A is the known-clean side.
    DevA = 1,
    /// Replica B is the known-clean side.
    DevB = 2,
}

impl ReadRoute {
    pub fn from_bits(bits: u8) -> ReadRoute {
        match bits {
            1 => ReadRoute::DevA,
            2 => ReadRoute::DevB,
            _ => ReadRoute::Either,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u16,
    pub uuid: Uuid,
    pub clean_unmount: bool,
    pub read_route: ReadRoute,
    pub device_b: bool,
    pub chunk_size: u32,
    pub age: u64,
}

impl SuperBlock {
    pub fn decode(page: &[u8]) -> Option<SuperBlock> {
        if page[OFF_MAGIC..OFF_MAGIC + 16] != MAGIC {
            return None;
        }
        let bits = page[OFF_BITS];
        Some(SuperBlock {
            version: u16::from_be_bytes(page[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap()),
            uuid: Uuid::from_slice(&page[OFF_UUID..OFF_UUID + 16]).unwrap(),
            clean_unmount: 0 != bits & 0b1,
            read_route: ReadRoute::from_bits((bits >> 1) & 0b11),
            device_b: 0 != (bits >> 3) & 0b1,
            chunk_size: u32::from_be_bytes(
                page[OFF_CHUNK_SIZE..OFF_CHUNK_SIZE + 4].try_into().unwrap(),
            ),
            age: u64::from_be_bytes(page[OFF_AGE..OFF_AGE + 8].try_into().unwrap()),
        })
    }

    /// Serialize with the slot flag stamped for the device being written.
    pub fn encode(&self, page: &mut [u8], device_b: bool) {
        page.fill(0);
        page[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&MAGIC);
        page[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_be_bytes());
        page[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        page[OFF_BITS] = (self.clean_unmount as u8)
            | ((self.read_route as u8) << 1)
            | ((device_b as u8) << 3);
        page[OFF_CHUNK_SIZE..OFF_CHUNK_SIZE + 4].copy_from_slice(&self.chunk_size.to_be_bytes());
        page[OFF_AGE..OFF_AGE + 8].copy_from_slice(&self.age.to_be_bytes());
    }
}

/// Which replica a reconciliation selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Reconcile two on-disk superblocks. The higher age wins outright and
/// forces the read route to the winning side; on an age tie the cleanly
/// unmounted side wins, with its stored route preserved.
pub fn pick_superblock(dev_a: &SuperBlock, dev_b: &SuperBlock) -> (Side, SuperBlock) {
    if dev_a.age < dev_b.age {
        let mut sb = dev_b.clone();
        sb.read_route = ReadRoute::DevB;
        return (Side::B, sb);
    } else if dev_a.age > dev_b.age {
        let mut sb = dev_a.clone();
        sb.read_route = ReadRoute::DevA;
        return (Side::A, sb);
    } else if dev_a.clean_unmount != dev_b.clean_unmount {
        return if dev_a.clean_unmount {
            (Side::A, dev_a.clone())
        } else {
            (Side::B, dev_b.clone())
        };
    }
    (Side::A, dev_a.clone())
}

/// Write a mirror superblock, stamping the slot of the device written so a
/// swapped-in disk can later identify its position.
pub fn write_superblock(device: &dyn UblkDisk, sb: &SuperBlock, device_b: bool) -> IoResult {
    let mut page = AlignedBuf::new(SB_PAGE_SIZE, device.block_size() as usize)?;
    sb.encode(page.as_mut_slice(), device_b);
    write_page(device, &page)
}

/// Read and load the mirror superblock off a device. A missing magic means
/// a fresh device: the superblock is initialized in memory (and written
/// later, once the array roles are settled). Returns the superblock and
/// whether the device was new.
pub fn load_superblock(
    device: &dyn UblkDisk,
    uuid: &Uuid,
    chunk_size: u32,
) -> Result<(SuperBlock, bool), DiskError> {
    let page = read_page(device)?;
    let (mut sb, was_new) = match SuperBlock::decode(page.as_slice()) {
        Some(sb) => (sb, false),
        None => (
            SuperBlock {
                version: 0,
                uuid: *uuid,
                clean_unmount: true,
                read_route: ReadRoute::Either,
                device_b: false,
                chunk_size,
                age: 0,
            },
            true,
        ),
    };

    if sb.uuid != *uuid {
        error!(
            "Superblock did not have a matching UUID expected: {} read: {}",
            uuid, sb.uuid
        );
        return Err(DiskError::InvalidArgument);
    }
    if chunk_size != sb.chunk_size {
        warn!(
            "Superblock was created with different chunk_size: [{}B] will not use runtime \
             config of [{}B] [vol:{}]",
            sb.chunk_size, chunk_size, uuid
        );
    }
    debug!(
        "{} has v{:#x} superblock [age:{},chunk_sz:{:#x},{}] [vol:{}]",
        device.describe(),
        sb.version,
        sb.age,
        sb.chunk_size,
        if sb.clean_unmount { "Clean" } else { "Dirty" },
        uuid
    );

    if SB_VERSION > sb.version {
        sb.version = SB_VERSION;
    }
    Ok((sb, was_new))
}
