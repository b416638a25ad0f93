//! Cache statistics.
//!
//! Counters the admission policy reads (stored pages, pool pages,
//! outstanding writebacks) are atomic because decisions depend on them.
//! The event counters exist for operators and are maintained with relaxed
//! ordering; they are roughly accurate under contention, which is enough.

use crate::pool::PagePool;
use std::sync::atomic::{AtomicU64, Ordering};

/// Internal atomic counters.
#[derive(Default)]
pub(crate) struct CacheStats {
    pub(crate) stored_pages: AtomicU64,
    pub(crate) outstanding_writebacks: AtomicU64,
    pub(crate) written_back_pages: AtomicU64,
    pub(crate) duplicate_entries: AtomicU64,
    pub(crate) writeback_attempted: AtomicU64,
    pub(crate) saved_by_writeback: AtomicU64,
    pub(crate) reject_no_device: AtomicU64,
    pub(crate) reject_entry_alloc: AtomicU64,
    pub(crate) reject_compress_fail: AtomicU64,
    pub(crate) reject_compress_poor: AtomicU64,
    pub(crate) reject_spare_fail: AtomicU64,
    pub(crate) reject_alloc_fail: AtomicU64,
}

impl CacheStats {
    pub(crate) fn snapshot(&self, pool: &PagePool) -> StatsSnapshot {
        StatsSnapshot {
            pool_pages: pool.live_pages(),
            pool_limit_hit: pool.limit_hit(),
            stored_pages: self.stored_pages.load(Ordering::Relaxed),
            outstanding_writebacks: self.outstanding_writebacks.load(Ordering::Relaxed),
            written_back_pages: self.written_back_pages.load(Ordering::Relaxed),
            duplicate_entries: self.duplicate_entries.load(Ordering::Relaxed),
            writeback_attempted: self.writeback_attempted.load(Ordering::Relaxed),
            saved_by_writeback: self.saved_by_writeback.load(Ordering::Relaxed),
            reject_no_device: self.reject_no_device.load(Ordering::Relaxed),
            reject_entry_alloc: self.reject_entry_alloc.load(Ordering::Relaxed),
            reject_compress_fail: self.reject_compress_fail.load(Ordering::Relaxed),
            reject_compress_poor: self.reject_compress_poor.load(Ordering::Relaxed),
            reject_spare_fail: self.reject_spare_fail.load(Ordering::Relaxed),
            reject_alloc_fail: self.reject_alloc_fail.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the cache's observability counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Raw pages currently owned by the compressed pool.
    pub pool_pages: u64,
    /// Page requests rejected because the pool ceiling was reached.
    pub pool_limit_hit: u64,
    /// Compressed entries currently stored.
    pub stored_pages: u64,
    /// Decompressed pages currently awaiting swap writeback completion.
    pub outstanding_writebacks: u64,
    /// Pages written back to the swap device so far.
    pub written_back_pages: u64,
    /// Stores that replaced an existing entry at the same offset.
    pub duplicate_entries: u64,
    /// Admission failures that triggered a writeback batch.
    pub writeback_attempted: u64,
    /// Stores admitted only because writeback freed space.
    pub saved_by_writeback: u64,
    /// Stores rejected because no index exists for the swap type.
    pub reject_no_device: u64,
    /// Stores rejected because the entry record could not be allocated.
    pub reject_entry_alloc: u64,
    /// Stores rejected because the codec failed.
    pub reject_compress_fail: u64,
    /// Stores rejected because the page compressed poorly.
    pub reject_compress_poor: u64,
    /// Stores rejected because no spare staging buffer was free.
    pub reject_spare_fail: u64,
    /// Stores rejected because the object store stayed full.
    pub reject_alloc_fail: u64,
}
