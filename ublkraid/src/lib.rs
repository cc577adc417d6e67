//! Composable userspace block devices for the ublk block layer.
//!
//! A composition tree of [`disk::UblkDisk`] implementations is rooted at a
//! [`target::Target`], which drives a ublk session: guest requests fan out
//! into tagged sub-commands as they descend the tree (see [`sub_cmd`]),
//! backing leaves submit to io_uring or complete through their own channel,
//! and the runtime aggregates completions, retrying failed sub-commands with
//! the original route preserved.
//!
//! Three compositions are provided on top of the leaf drivers:
//!
//! - passthrough: any leaf driver used directly as the tree root
//! - [`raid::raid0::Raid0Disk`]: N devices striped at a configurable size
//! - [`raid::raid1::Raid1Disk`]: a mirror pair with persistent dirty-region
//!   tracking, online resync and live device replacement

pub mod buf;
pub mod config;
pub mod disk;
pub mod drivers;
pub mod raid;
pub mod sub_cmd;
pub mod target;
pub mod ublk;

pub const KI: u64 = 1024;
pub const MI: u64 = KI * KI;
pub const GI: u64 = MI * KI;

pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_SHIFT: u8 = 9;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_BS_SHIFT: u8 = 12;

/// Default maximum single-I/O size before the ublk layer splits a request.
pub const DEF_BUF_SIZE: u32 = 512 * 1024;

/// Integer log2, truncating. `x` must be non-zero.
pub const fn ilog2(x: u64) -> u8 {
    (63 - x.leading_zeros()) as u8
}
