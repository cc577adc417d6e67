//! Aligned superblock page I/O shared by the RAID levels.
//!
//! Both RAID levels keep exactly one 4 KiB header page at offset 0 of every
//! backing device. Pages are read and written synchronously through the
//! device's `sync_iov` with block-size-aligned buffers.

use log::{error, trace};

use crate::buf::AlignedBuf;
use crate::disk::{DiskError, IoResult, UblkDisk};
use crate::ublk::{UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};

pub const SB_PAGE_SIZE: usize = 4096;

/// Read the header page from device offset 0 into a freshly allocated
/// aligned buffer.
pub fn read_page(device: &dyn UblkDisk) -> Result<AlignedBuf, DiskError> {
    let bs = device.block_size() as usize;
    trace!(
        "Reading superblock from [{}] {}%{} == {}",
        device.describe(),
        SB_PAGE_SIZE,
        bs,
        SB_PAGE_SIZE % bs
    );
    if 0 != SB_PAGE_SIZE % bs {
        error!(
            "Device [{}] blocksize does not support alignment of [{}B]",
            device.describe(),
            SB_PAGE_SIZE
        );
        return Err(DiskError::InvalidArgument);
    }
    let buf = AlignedBuf::new(SB_PAGE_SIZE, bs)?;
    let iovs = [buf.iovec()];
    match device.sync_iov(UBLK_IO_OP_READ, &iovs, 0) {
        Ok(_) => Ok(buf),
        Err(err) => {
            error!("Could not read superblock of [sz:{SB_PAGE_SIZE}] [res:{err}]");
            Err(err)
        }
    }
}

/// Write a header page to device offset 0.
pub fn write_page(device: &dyn UblkDisk, buf: &AlignedBuf) -> IoResult {
    trace!("Writing superblock to [{}]", device.describe());
    debug_assert_eq!(SB_PAGE_SIZE, buf.len());
    let iovs = [buf.iovec()];
    let res = device.sync_iov(UBLK_IO_OP_WRITE, &iovs, 0);
    if let Err(err) = &res {
        error!("Error writing superblock to [{}]: {err}", device.describe());
    }
    res
}
