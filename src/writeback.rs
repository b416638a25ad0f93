//! Resumed writeback.
//!
//! When admission runs out of pool space, the oldest entries are
//! decompressed into host swap-cache pages and submitted to the swap
//! device, completing the writeback that the cache intercepted in the
//! first place. Once the page is durably on its way, the compressed copy
//! is forfeit.
//!
//! The engine races with loads and invalidates on the same entries. Each
//! iteration holds its own reference across the blocking decompress/submit
//! window and reconciles afterwards; the possible refcount values at that
//! point enumerate exactly who else touched the entry in the meantime.

use crate::index::SwapIndex;
use crate::objstore::ObjHandle;
use crate::stats::CacheStats;
use crate::{ZswapCache, MAX_OUTSTANDING_WRITEBACKS, PAGE_SIZE};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Identifies one swap slot: a swap type and an offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot {
    /// The swap device.
    pub swap_type: u32,
    /// The page offset within the device.
    pub offset: u64,
}

/// Result of asking the host for the swap-cache page of a slot.
pub enum SwapCachePage {
    /// A fresh page, exclusively held by the caller, ready to be filled and
    /// submitted.
    New(Box<[u8; PAGE_SIZE]>),
    /// The slot already has a page in the host swap cache; a concurrent
    /// fault is servicing it.
    Existing,
    /// The host could not allocate a page.
    OutOfMemory,
}

/// Completion token for one submitted writeback.
///
/// The host calls [`complete`](Self::complete) exactly once when the swap
/// I/O finishes, which releases the in-flight slot and counts the page as
/// written back. If submission failed the token must be dropped without
/// completing.
pub struct WritebackCompletion {
    stats: Arc<CacheStats>,
}

impl WritebackCompletion {
    pub(crate) fn new(stats: Arc<CacheStats>) -> Self {
        Self { stats }
    }

    /// Record the asynchronous swap write as finished.
    pub fn complete(self) {
        self.stats.outstanding_writebacks.fetch_sub(1, Ordering::Relaxed);
        self.stats.written_back_pages.fetch_add(1, Ordering::Relaxed);
    }
}

/// Host swap services the writeback engine consumes.
pub trait SwapBackend: Send + Sync {
    /// Find or allocate the swap-cache page for `slot`.
    fn swap_cache_page(&self, slot: SwapSlot) -> SwapCachePage;

    /// Submit a filled page to the asynchronous swap writeback. Returns
    /// `true` when submission succeeded; the completion must then be
    /// completed when the I/O finishes, and dropped uncompleted otherwise.
    fn writepage(
        &self,
        slot: SwapSlot,
        page: Box<[u8; PAGE_SIZE]>,
        completion: WritebackCompletion,
    ) -> bool;
}

enum Attempt {
    /// The page went to the swap device; the index's reference is forfeit.
    Written,
    /// A swap-cache page already existed, so a fault is handling the slot.
    Skipped,
    /// The host had no page to give; transient, retry later.
    NoMem,
}

impl ZswapCache {
    /// Write back up to `max_entries` of the oldest entries for a swap
    /// type, returning how many were freed.
    ///
    /// This is the same reclaim the store path runs when admission fails;
    /// exposing it lets a host shrinker free pool space proactively.
    pub fn writeback(&self, swap_type: u32, max_entries: usize) -> usize {
        let Some(index) = self.index(swap_type) else {
            return 0;
        };
        self.writeback_batch(&index, max_entries)
    }

    pub(crate) fn writeback_batch(&self, index: &SwapIndex, n: usize) -> usize {
        let Some(backend) = self.backend.clone() else {
            return 0;
        };
        let mut freed = 0;

        for _ in 0..n {
            // Bound the RAM tied up as decompressed pages awaiting I/O.
            if self.stats.outstanding_writebacks.load(Ordering::Relaxed)
                > MAX_OUTSTANDING_WRITEBACKS
            {
                break;
            }

            let (idx, offset, handle, length) = {
                let mut inner = index.inner.lock();
                let Some(idx) = inner.lru_pop_head() else {
                    break;
                };
                // Keep the entry alive while the lock is dropped; an
                // invalidate must not free it from under us.
                inner.get_ref(idx);
                let entry = inner.entry(idx);
                (idx, entry.offset, entry.handle, entry.length as usize)
            };

            let slot = SwapSlot { swap_type: index.swap_type, offset };
            let attempt = self.writeback_entry(index, backend.as_ref(), slot, handle, length);

            let mut inner = index.inner.lock();

            if matches!(attempt, Attempt::NoMem) {
                // Leave the entry in the map but off the LRU; the next load
                // relinks it. Stop the batch, the host is short on memory.
                if inner.put_ref(idx) == 0 {
                    index.free_entry(&mut inner, idx, &self.stats);
                    freed += 1;
                }
                break;
            }

            // Who else raced us while the lock was dropped, for the
            // single-contender interleavings:
            //   2  writeback failed, a load is in progress; it settles it
            //   1  writeback failed, nobody else; back onto the LRU
            //   0  written back, no invalidate; unpublish and free
            //  -1  an invalidate already unpublished it; just free
            if matches!(attempt, Attempt::Written) {
                // Drop the worker's reference, then the index's: the
                // entry's map position is forfeit now that the page is
                // durably written.
                inner.put_ref(idx);
                match inner.put_ref(idx) {
                    0 => {
                        if inner.search(offset) == Some(idx) {
                            inner.map_remove(offset);
                            index.free_entry(&mut inner, idx, &self.stats);
                            freed += 1;
                        }
                        // Zero with the entry already unpublished means an
                        // invalidate raced while a load still holds it; a
                        // load reference masked the invalidate's drop, and
                        // that load's final put frees.
                    }
                    r if r < 0 => {
                        index.free_entry(&mut inner, idx, &self.stats);
                        freed += 1;
                    }
                    _ => {
                        // Loads still hold the entry. The index's claim is
                        // gone, so unpublish it now; the last load frees.
                        inner.map_remove_if(offset, idx);
                    }
                }
            } else {
                // The attempt failed, so only the worker's own reference
                // drops and zero proves this was the last holder; a raced
                // invalidate cannot be masked here. Relink only an entry
                // that is still published.
                match inner.put_ref(idx) {
                    1 => {
                        if inner.search(offset) == Some(idx) {
                            inner.lru_push_tail(idx);
                        }
                    }
                    r if r <= 0 => {
                        index.free_entry(&mut inner, idx, &self.stats);
                        freed += 1;
                    }
                    _ => {}
                }
            }
        }

        if freed > 0 {
            trace!(swap_type = index.swap_type, freed, "writeback batch");
        }
        freed
    }

    fn writeback_entry(
        &self,
        index: &SwapIndex,
        backend: &dyn SwapBackend,
        slot: SwapSlot,
        handle: ObjHandle,
        length: usize,
    ) -> Attempt {
        match backend.swap_cache_page(slot) {
            SwapCachePage::OutOfMemory => Attempt::NoMem,
            SwapCachePage::Existing => Attempt::Skipped,
            SwapCachePage::New(mut page) => {
                index.store.read_with(handle, length, |src| {
                    let n = self
                        .codec
                        .decompress(src, &mut page[..])
                        .expect("compressed pool corrupted: decompression failed");
                    assert_eq!(
                        n, PAGE_SIZE,
                        "compressed pool corrupted: bad decompressed length"
                    );
                });

                // The page is up to date and flagged for reclaim as soon as
                // the write finishes.
                self.stats.outstanding_writebacks.fetch_add(1, Ordering::Relaxed);
                let completion = WritebackCompletion::new(Arc::clone(&self.stats));
                if !backend.writepage(slot, page, completion) {
                    self.stats.outstanding_writebacks.fetch_sub(1, Ordering::Relaxed);
                }
                Attempt::Written
            }
        }
    }
}
