use std::sync::Arc;

use ublkraid::drivers::{MemDisk, MemDiskOpts};
use ublkraid::raid::raid1::bitmap::{Bitmap, PAGE_SIZE};
use ublkraid::{GI, KI, MI};

const CHUNK: u32 = 32 * KI as u32;
const PAGE_WIDTH: u64 = CHUNK as u64 * PAGE_SIZE * 8; // user bytes per page

fn backing() -> Arc<MemDisk> {
    Arc::new(MemDisk::new("bitmap-store", 4 * MI))
}

#[test]
fn large_region_roundtrip() {
    let store = backing();
    let bitmap = Bitmap::new(32 * GI, CHUNK, 4096).unwrap();

    bitmap.dirty_region(0, 10 * PAGE_WIDTH);
    assert_eq!(10, bitmap.dirty_pages());
    let synced = bitmap.sync_to(&*store, PAGE_SIZE).unwrap();
    assert_eq!(10 * PAGE_SIZE as usize, synced);

    let fresh = Bitmap::new(32 * GI, CHUNK, 4096).unwrap();
    fresh.load_from(&*store).unwrap();
    assert_eq!(10, fresh.dirty_pages());
    for page in 0..10 {
        assert!(fresh.is_dirty(page * PAGE_WIDTH, PAGE_WIDTH));
    }
    assert!(!fresh.is_dirty(10 * PAGE_WIDTH, PAGE_WIDTH));
}

#[test]
fn every_bit_answer_survives_persistence() {
    let store = backing();
    let bitmap = Bitmap::new(4 * GI, CHUNK, 4096).unwrap();

    let extents: &[(u64, u64)] = &[
        (0, CHUNK as u64),
        (7 * CHUNK as u64, 3 * CHUNK as u64),
        (GI - CHUNK as u64, 2 * CHUNK as u64), // crosses a page boundary
        (3 * GI + 5 * CHUNK as u64, CHUNK as u64),
    ];
    for (addr, len) in extents {
        bitmap.dirty_region(*addr, *len);
    }
    bitmap.sync_to(&*store, PAGE_SIZE).unwrap();

    let fresh = Bitmap::new(4 * GI, CHUNK, 4096).unwrap();
    fresh.load_from(&*store).unwrap();
    for chunk_idx in 0..(4 * GI / CHUNK as u64) {
        let addr = chunk_idx * CHUNK as u64;
        assert_eq!(
            bitmap.is_dirty(addr, CHUNK as u64),
            fresh.is_dirty(addr, CHUNK as u64),
            "chunk {chunk_idx} diverged after roundtrip"
        );
    }
}

#[test]
fn sync_batches_are_bounded_by_max_io() {
    // A 4 KiB max-I/O device forces one write per page
    let store = Arc::new(MemDisk::with_opts(
        "small-io",
        4 * MI,
        MemDiskOpts {
            max_sectors: 8,
            ..MemDiskOpts::default()
        },
    ));
    let bitmap = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
    bitmap.dirty_region(0, 6 * PAGE_WIDTH);

    let writes_before = store.write_count();
    bitmap.sync_to(&*store, PAGE_SIZE).unwrap();
    assert_eq!(writes_before + 6, store.write_count());
}

#[test]
fn holes_split_batches() {
    let store = backing();
    let bitmap = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
    // Pages 0 and 2; page 1 stays a hole
    bitmap.dirty_region(0, CHUNK as u64);
    bitmap.dirty_region(2 * PAGE_WIDTH, CHUNK as u64);

    let writes_before = store.write_count();
    bitmap.sync_to(&*store, PAGE_SIZE).unwrap();
    assert_eq!(writes_before + 2, store.write_count());
}

#[test]
fn loaded_pages_are_not_rewritten() {
    let store = backing();
    {
        let bitmap = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
        bitmap.dirty_region(0, CHUNK as u64);
        bitmap.dirty_region(PAGE_WIDTH, CHUNK as u64);
        bitmap.sync_to(&*store, PAGE_SIZE).unwrap();
    }

    let bitmap = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
    bitmap.load_from(&*store).unwrap();

    // Untouched loaded pages carry nothing to persist
    let writes_before = store.write_count();
    assert_eq!(Ok(0), bitmap.sync_to(&*store, PAGE_SIZE));
    assert_eq!(writes_before, store.write_count());

    // Touching one page persists exactly that page
    bitmap.dirty_region(PAGE_WIDTH + 4 * CHUNK as u64, CHUNK as u64);
    assert_eq!(Ok(PAGE_SIZE as usize), bitmap.sync_to(&*store, PAGE_SIZE));
    assert_eq!(writes_before + 1, store.write_count());
}

#[test]
fn init_clears_the_reserved_region() {
    let store = backing();
    let bitmap = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
    bitmap.dirty_region(0, 4 * PAGE_WIDTH);
    bitmap.sync_to(&*store, PAGE_SIZE).unwrap();

    bitmap.init_to(&*store).unwrap();
    let fresh = Bitmap::new(16 * GI, CHUNK, 4096).unwrap();
    fresh.load_from(&*store).unwrap();
    assert_eq!(0, fresh.dirty_pages());
}
