//! RAID compositions and their shared on-disk superblock plumbing.

pub mod raid0;
pub mod raid1;
pub mod superblock;
