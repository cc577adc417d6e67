//! Chunk-granularity dirty tracking for a mirror pair.
//!
//! A lazy map from page index to a 4 KiB page of bits; each bit covers one
//! chunk of user data, set while the replica holding it is known stale.
//! Words are stored big-endian so the in-memory pages are byte-identical to
//! the on-disk bitmap region. Updates are atomic word operations; page
//! insertion is serialized by the map lock, but bit updates after lookup
//! are lock-free.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace};

use crate::buf::{AlignedBuf, IoVec};
use crate::disk::{DiskError, IoResult, UblkDisk};
use crate::ublk::{UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use crate::KI;

pub const PAGE_SIZE: u64 = 4 * KI;
pub const BITS_IN_BYTE: u64 = 8;
const BITS_IN_WORD: u32 = 64;

/// Floor on chunk size so a page always covers at least 1 GiB of user data.
pub const MIN_CHUNK_SIZE: u32 = 32 * KI as u32;

struct Page {
    buf: AlignedBuf,
    /// Set for pages read off disk and untouched since; `sync_to` skips
    /// them. Release-stored on modification, acquire-loaded on sync.
    loaded_from_disk: AtomicBool,
}

impl Page {
    fn new(align: usize, loaded: bool) -> Result<Arc<Page>, DiskError> {
        Ok(Arc::new(Page {
            buf: AlignedBuf::new(PAGE_SIZE as usize, align)?,
            loaded_from_disk: AtomicBool::new(loaded),
        }))
    }

    fn words(&self) -> &[AtomicU64] {
        self.buf.as_atomic_words()
    }

    fn is_zero(&self) -> bool {
        self.words().iter().all(|w| 0 == w.load(Ordering::Relaxed))
    }

    fn iovec(&self) -> IoVec {
        self.buf.iovec()
    }
}

// Bit run within one word, already byte-swapped for the big-endian pages.
fn word_mask(shift: u32, nr_bits: u32) -> u64 {
    let mask = if BITS_IN_WORD == nr_bits {
        u64::MAX
    } else {
        ((1u64 << nr_bits) - 1) << (shift - (nr_bits - 1))
    };
    mask.to_be()
}

/// Decompose `[addr, addr + len)` into one page-local update step:
/// the page index, the word within the page, the highest bit of the run
/// within that word, the number of bits the region spans inside this page,
/// and how many bytes of the region this page consumes.
pub fn calc_bitmap_region(addr: u64, len: u64, chunk_size: u32) -> (u32, u32, u32, u32, u64) {
    let page_width = chunk_size as u64 * PAGE_SIZE * BITS_IN_BYTE;

    let page = addr / page_width;
    let page_off = addr % page_width;

    let page_bit = (page_off / chunk_size as u64) as u32;
    let sz = len.min(page_width - page_off);

    let end_bit = (page_off + sz).div_ceil(chunk_size as u64);
    let nr_bits = (end_bit - page_off / chunk_size as u64) as u32;

    let word = page_bit / BITS_IN_WORD;
    let shift = BITS_IN_WORD - (page_bit % BITS_IN_WORD) - 1;

    (page as u32, word, shift, nr_bits, sz)
}

pub struct Bitmap {
    data_size: u64,
    chunk_size: u32,
    align: u32,
    /// Bytes of user data a single page tracks.
    page_width: u64,
    num_pages: u32,
    pages: Mutex<BTreeMap<u32, Arc<Page>>>,
    dirty_chunks_est: AtomicU64,
    zero_page: AlignedBuf,
}

impl Bitmap {
    pub fn new(data_size: u64, chunk_size: u32, align: u32) -> Result<Bitmap, DiskError> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(DiskError::InvalidArgument);
        }
        let page_width = chunk_size as u64 * PAGE_SIZE * BITS_IN_BYTE;
        let num_pages = data_size.div_ceil(page_width) as u32;
        trace!(
            "Initializing RAID-1 bitmap [pgs:{}, sz:{}Ki]",
            num_pages,
            num_pages as u64 * PAGE_SIZE / KI
        );
        Ok(Bitmap {
            data_size,
            chunk_size,
            align,
            page_width,
            num_pages,
            pages: Mutex::new(BTreeMap::new()),
            dirty_chunks_est: AtomicU64::new(0),
            zero_page: AlignedBuf::new(PAGE_SIZE as usize, align as usize)?,
        })
    }

    pub fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// An all-zeroes page for persisting fully cleaned pages.
    pub fn zero_page_iovec(&self) -> IoVec {
        self.zero_page.iovec()
    }

    fn max_pages_per_tx(device: &dyn UblkDisk) -> usize {
        (device.max_io_bytes() as u64 / PAGE_SIZE).max(1) as usize
    }

    fn get_page(&self, page_idx: u32, create: bool) -> Option<Arc<Page>> {
        let mut pages = self.pages.lock().expect("bitmap page map poisoned");
        if let Some(page) = pages.get(&page_idx) {
            return Some(page.clone());
        }
        if !create {
            return None;
        }
        let page = Page::new(self.align as usize, false).ok()?;
        pages.insert(page_idx, page.clone());
        Some(page)
    }

    /// Set every chunk bit covering `[addr, addr + len)`.
    pub fn dirty_region(&self, addr: u64, len: u64) {
        let end = addr + len;
        let mut cur = addr;
        while cur < end {
            let (page_idx, word, mut shift, nr_bits, sz) =
                calc_bitmap_region(cur, end - cur, self.chunk_size);
            cur += sz;

            let page = self
                .get_page(page_idx, true)
                .expect("bitmap page allocation");
            let words = page.words();

            let mut word = word as usize;
            let mut bits_left = nr_bits;
            while 0 < bits_left {
                let bits_to_set = bits_left.min(shift + 1);
                let mask = word_mask(shift, bits_to_set);
                bits_left -= bits_to_set;
                let old = words[word].fetch_or(mask, Ordering::SeqCst);
                self.dirty_chunks_est
                    .fetch_add((old ^ (old | mask)).count_ones() as u64, Ordering::Relaxed);
                word += 1;
                shift = BITS_IN_WORD - 1;
            }
            page.loaded_from_disk.store(false, Ordering::Release);
        }
        trace!(
            "Bitmap DIRTIED [addr:{:#x}, len:{}KiB, dirty:{}KiB]",
            addr,
            len / KI,
            self.dirty_data_est() / KI
        );
    }

    /// Clear the chunk bits of one page-local step of `[addr, addr + len)`.
    /// `addr` and `len` must be chunk aligned. Returns whether the touched
    /// page is now fully clean, its index, and the bytes consumed so the
    /// caller can continue with the remainder and persist emptied pages.
    pub fn clean_region(&self, addr: u64, len: u64) -> (bool, u32, u64) {
        let (page_idx, word, mut shift, nr_bits, sz) =
            calc_bitmap_region(addr, len, self.chunk_size);

        debug_assert_eq!(0, addr % self.chunk_size as u64);
        debug_assert_eq!(0, len % self.chunk_size as u64);

        let Some(page) = self.get_page(page_idx, false) else {
            return (false, page_idx, sz);
        };
        let words = page.words();

        let mut word = word as usize;
        let mut bits_left = nr_bits;
        while 0 < bits_left {
            let bits_to_clear = bits_left.min(shift + 1);
            let clear_mask = !word_mask(shift, bits_to_clear);
            bits_left -= bits_to_clear;
            let old = words[word].fetch_and(clear_mask, Ordering::SeqCst);
            let dropped = (old ^ (old & clear_mask)).count_ones() as u64;
            let est = self.dirty_chunks_est.load(Ordering::Relaxed);
            self.dirty_chunks_est
                .fetch_sub(dropped.min(est), Ordering::Relaxed);
            word += 1;
            shift = BITS_IN_WORD - 1;
        }
        page.loaded_from_disk.store(false, Ordering::Release);
        trace!(
            "Bitmap CLEANED [addr:{:#x}, len:{}KiB, dirty:{}KiB]",
            addr,
            len / KI,
            self.dirty_data_est() / KI
        );

        (page.is_zero(), page_idx, sz)
    }

    /// Whether any chunk bit within `[addr, addr + len)` is set.
    pub fn is_dirty(&self, addr: u64, len: u64) -> bool {
        let mut off = 0u64;
        while off < len {
            let (page_idx, word, mut shift, nr_bits, sz) =
                calc_bitmap_region(addr + off, len - off, self.chunk_size);
            off += sz;
            let Some(page) = self.get_page(page_idx, false) else {
                continue;
            };
            let words = page.words();

            let mut word = word as usize;
            let mut bits_left = nr_bits;
            while 0 < bits_left {
                let bits_to_check = bits_left.min(shift + 1);
                let mask = word_mask(shift, bits_to_check);
                bits_left -= bits_to_check;
                if 0 != words[word].load(Ordering::Acquire) & mask {
                    return true;
                }
                word += 1;
                shift = BITS_IN_WORD - 1;
            }
        }
        false
    }

    /// First dirty extent: scan for the first non-zero page, find its first
    /// set bit and greedily extend a run of consecutive set bits within the
    /// word. Returns `(offset, length)`, with zero length when clean.
    pub fn next_dirty(&self) -> (u64, u64) {
        let pages = self.pages.lock().expect("bitmap page map poisoned");
        for (page_idx, page) in pages.iter() {
            if page.is_zero() {
                continue;
            }
            let mut logical_off = self.page_width * *page_idx as u64;
            for (word_idx, word) in page.words().iter().enumerate() {
                let word = u64::from_be(word.load(Ordering::Relaxed));
                if 0 == word {
                    continue;
                }
                logical_off += word_idx as u64 * BITS_IN_WORD as u64 * self.chunk_size as u64;

                let mut set_bit = word.leading_zeros();
                logical_off += set_bit as u64 * self.chunk_size as u64;
                let mut sz = 0u64;
                while set_bit < BITS_IN_WORD && 0b1 == (word >> (BITS_IN_WORD - set_bit - 1)) & 0b1
                {
                    sz += self.chunk_size as u64;
                    set_bit += 1;
                }
                if self.data_size < logical_off + sz {
                    sz = self.data_size - logical_off;
                }
                return (logical_off, sz);
            }
        }
        (0, 0)
    }

    /// Drop all-zero pages, correct the dirty estimate, return the number
    /// of pages still holding dirt.
    pub fn dirty_pages(&self) -> usize {
        let mut pages = self.pages.lock().expect("bitmap page map poisoned");
        let before = pages.len();
        pages.retain(|_, page| !page.is_zero());
        let dropped = before - pages.len();
        if 0 < dropped {
            debug!("Dropped [{}/{}] page(s) from the bitmap", dropped, before);
        }
        let remaining = pages.len();
        let full = remaining as u64 * PAGE_SIZE * BITS_IN_BYTE;
        if full < self.dirty_chunks_est.load(Ordering::Relaxed) {
            self.dirty_chunks_est.store(full, Ordering::Relaxed);
        }
        remaining
    }

    /// Upper estimate of bytes still divergent between the replicas.
    pub fn dirty_data_est(&self) -> u64 {
        self.dirty_chunks_est.load(Ordering::Relaxed) * self.chunk_size as u64
    }

    /// Persist modified pages at `offset`, batching consecutive pages into
    /// single writes bounded by the device's maximum I/O size. Pages loaded
    /// from disk and untouched since are skipped.
    pub fn sync_to(&self, device: &dyn UblkDisk, offset: u64) -> IoResult {
        let snapshot: Vec<(u32, Arc<Page>)> = {
            let pages = self.pages.lock().expect("bitmap page map poisoned");
            pages
                .iter()
                .filter(|(_, page)| !page.loaded_from_disk.load(Ordering::Acquire))
                .filter(|(_, page)| !page.is_zero())
                .map(|(idx, page)| (*idx, page.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let max_batch = Self::max_pages_per_tx(device);
        let mut iovs: Vec<IoVec> = Vec::with_capacity(max_batch);
        let mut batch_start = 0u32;
        let mut batch_addr = 0u64;
        let mut total = 0usize;

        for (page_idx, page) in &snapshot {
            let consecutive = !iovs.is_empty() && *page_idx == batch_start + iovs.len() as u32;
            if iovs.len() >= max_batch || (!iovs.is_empty() && !consecutive) {
                debug!(
                    "Syncing {} consecutive bitmap page(s) from page {} to {}",
                    iovs.len(),
                    batch_start,
                    device.describe()
                );
                total += device.sync_iov(UBLK_IO_OP_WRITE, &iovs, batch_addr)?;
                iovs.clear();
            }
            if iovs.is_empty() {
                batch_start = *page_idx;
                batch_addr = PAGE_SIZE * *page_idx as u64 + offset;
            }
            iovs.push(page.iovec());
        }
        if !iovs.is_empty() {
            total += device.sync_iov(UBLK_IO_OP_WRITE, &iovs, batch_addr)?;
        }
        Ok(total)
    }

    /// Read the bitmap region back in, leaving holes for zero pages.
    pub fn load_from(&self, device: &dyn UblkDisk) -> Result<(), DiskError> {
        for page_idx in 0..self.num_pages {
            trace!("Loading page: {} of {} page(s)", page_idx + 1, self.num_pages);
            let page = Page::new(device.block_size() as usize, true)?;
            let iovs = [page.iovec()];
            device.sync_iov(
                UBLK_IO_OP_READ,
                &iovs,
                PAGE_SIZE + page_idx as u64 * PAGE_SIZE,
            )?;
            if page.is_zero() {
                continue;
            }
            trace!("Page: {} is *DIRTY*", page_idx + 1);
            self.dirty_chunks_est
                .fetch_add(PAGE_SIZE * BITS_IN_BYTE, Ordering::Relaxed);
            self.pages
                .lock()
                .expect("bitmap page map poisoned")
                .insert(page_idx, page);
        }
        Ok(())
    }

    /// Zero the entire on-disk bitmap region in maximum sized batches.
    pub fn init_to(&self, device: &dyn UblkDisk) -> Result<(), DiskError> {
        info!(
            "Clearing RAID-1 bitmap [pgs:{}, sz:{}Ki] on: {}",
            self.num_pages,
            self.num_pages as u64 * PAGE_SIZE / KI,
            device.describe()
        );
        let max_batch = Self::max_pages_per_tx(device);
        let iovs = vec![self.zero_page.iovec(); max_batch];
        let mut page_idx = 0u32;
        while page_idx < self.num_pages {
            let batch = max_batch.min((self.num_pages - page_idx) as usize);
            device.sync_iov(
                UBLK_IO_OP_WRITE,
                &iovs[..batch],
                PAGE_SIZE + page_idx as u64 * PAGE_SIZE,
            )?;
            page_idx += batch as u32;
        }
        Ok(())
    }
}
