//! Bounded page pool backing the compressed object store.
//!
//! The pool is the cache's sole backpressure signal: `get` hands out a page
//! only while the live-page count sits strictly below a ceiling expressed as
//! a percentage of physical memory. A small reserve of recycled pages keeps
//! the hot path off the allocator.

use crate::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Pages kept in the recycling reserve.
const POOL_RESERVE_PAGES: usize = 256;

/// A raw page owned by the pool.
pub(crate) type PageBuf = Box<[u8; PAGE_SIZE]>;

fn new_page() -> PageBuf {
    Box::new([0u8; PAGE_SIZE])
}

/// Fixed-reserve page pool with a global occupancy ceiling.
pub(crate) struct PagePool {
    total_ram_pages: u64,
    max_percent: AtomicU32,
    live_pages: AtomicU64,
    limit_hit: AtomicU64,
    reserve: Mutex<Vec<PageBuf>>,
}

impl PagePool {
    pub(crate) fn new(total_ram_bytes: u64, max_percent: u32) -> Self {
        let mut reserve = Vec::with_capacity(POOL_RESERVE_PAGES);
        reserve.resize_with(POOL_RESERVE_PAGES, new_page);
        Self {
            total_ram_pages: total_ram_bytes / PAGE_SIZE as u64,
            max_percent: AtomicU32::new(max_percent),
            live_pages: AtomicU64::new(0),
            limit_hit: AtomicU64::new(0),
            reserve: Mutex::new(reserve),
        }
    }

    /// The occupancy ceiling in pages, derived from the runtime tunable.
    pub(crate) fn max_pages(&self) -> u64 {
        u64::from(self.max_percent.load(Ordering::Relaxed)) * self.total_ram_pages / 100
    }

    /// Take a page, failing fast once the ceiling is reached.
    pub(crate) fn get(&self) -> Option<PageBuf> {
        let max = self.max_pages();
        let claimed = self
            .live_pages
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                (live < max).then_some(live + 1)
            });
        if claimed.is_err() {
            self.limit_hit.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(self.reserve.lock().pop().unwrap_or_else(new_page))
    }

    /// Return a page to the pool.
    pub(crate) fn put(&self, page: PageBuf) {
        self.live_pages.fetch_sub(1, Ordering::Relaxed);
        let mut reserve = self.reserve.lock();
        if reserve.len() < POOL_RESERVE_PAGES {
            reserve.push(page);
        }
    }

    pub(crate) fn live_pages(&self) -> u64 {
        self.live_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn limit_hit(&self) -> u64 {
        self.limit_hit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_percent(&self, percent: u32) {
        self.max_percent.store(percent, Ordering::Relaxed);
    }
}
