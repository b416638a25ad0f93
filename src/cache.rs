//! The cache frontend: admission, load, and invalidation.

use crate::codec::{self, Codec};
use crate::error::{Error, StoreError};
use crate::index::{Entry, SwapIndex};
use crate::objstore::ObjHandle;
use crate::pool::PagePool;
use crate::scratch::{self, SparePool, SPARE_BUFFERS};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::writeback::SwapBackend;
use crate::{MAX_SWAP_TYPES, PAGE_SIZE, WRITEBACK_BATCH};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Configures and builds a [`ZswapCache`].
///
/// ```
/// use zswap_cache::{ZswapCacheBuilder, PAGE_SIZE};
///
/// let cache = ZswapCacheBuilder::new()
///     .max_pool_percent(20)
///     .codec("deflate")
///     .total_ram_bytes(256 * PAGE_SIZE as u64)
///     .build()
///     .unwrap();
/// cache.init(0);
/// ```
#[derive(Clone)]
pub struct ZswapCacheBuilder {
    max_pool_percent: u32,
    max_compression_ratio: u32,
    codec: String,
    total_ram_bytes: Option<u64>,
    backend: Option<Arc<dyn SwapBackend>>,
}

impl Default for ZswapCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZswapCacheBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_pool_percent: 50,
            max_compression_ratio: 80,
            codec: codec::DEFAULT_CODEC.to_string(),
            total_ram_bytes: None,
            backend: None,
        }
    }

    /// Maximum percentage of physical memory the compressed pool may occupy
    /// (default 50).
    #[must_use]
    pub fn max_pool_percent(mut self, percent: u32) -> Self {
        self.max_pool_percent = percent;
        self
    }

    /// Maximum acceptable compressed size as a percentage of the page size
    /// (default 80). Pages compressing above this go to swap uncompressed.
    #[must_use]
    pub fn max_compression_ratio(mut self, percent: u32) -> Self {
        self.max_compression_ratio = percent;
        self
    }

    /// Compression codec by name (default `"lz4"`). Unknown names fall back
    /// to the default.
    #[must_use]
    pub fn codec(mut self, name: &str) -> Self {
        self.codec = name.to_string();
        self
    }

    /// Override the detected physical memory size; the pool ceiling is a
    /// percentage of this.
    #[must_use]
    pub fn total_ram_bytes(mut self, bytes: u64) -> Self {
        self.total_ram_bytes = Some(bytes);
        self
    }

    /// Enable resumed writeback through the given host backend. Without a
    /// backend the cache rejects stores as soon as the pool is full.
    #[must_use]
    pub fn writeback(mut self, backend: Arc<dyn SwapBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the cache.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid percentage, or when physical memory
    /// size was not overridden and cannot be detected.
    pub fn build(self) -> Result<ZswapCache, Error> {
        if self.max_pool_percent > 100 {
            return Err(Error::InvalidInput(format!(
                "max_pool_percent must be <= 100, got {}",
                self.max_pool_percent
            )));
        }
        if self.max_compression_ratio > 100 {
            return Err(Error::InvalidInput(format!(
                "max_compression_ratio must be <= 100, got {}",
                self.max_compression_ratio
            )));
        }
        let total_ram = match self.total_ram_bytes {
            Some(bytes) => bytes,
            None => detect_total_ram()?,
        };
        Ok(ZswapCache {
            trees: (0..MAX_SWAP_TYPES).map(|_| RwLock::new(None)).collect(),
            pool: Arc::new(PagePool::new(total_ram, self.max_pool_percent)),
            spare: SparePool::new(SPARE_BUFFERS),
            codec: codec::resolve(&self.codec),
            backend: self.backend,
            stats: Arc::new(CacheStats::default()),
            max_compression_ratio: AtomicU32::new(self.max_compression_ratio),
        })
    }
}

/// Read total physical memory from `/proc/meminfo`.
fn detect_total_ram() -> Result<u64, Error> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .map_err(|e| Error::Io(format!("failed to read /proc/meminfo: {e}")))?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .map_err(|_| Error::InvalidInput("invalid MemTotal value".to_string()))?;
            return Ok(kb * 1024);
        }
    }
    Err(Error::InvalidInput("could not determine total RAM".to_string()))
}

/// Compressed swap cache: one index per swap type over a shared bounded
/// page pool.
///
/// All operations are safe to call from any number of threads; see the
/// module docs of [`crate`] for the overall contract.
pub struct ZswapCache {
    pub(crate) trees: Vec<RwLock<Option<Arc<SwapIndex>>>>,
    pub(crate) pool: Arc<PagePool>,
    pub(crate) spare: SparePool,
    pub(crate) codec: Box<dyn Codec>,
    pub(crate) backend: Option<Arc<dyn SwapBackend>>,
    pub(crate) stats: Arc<CacheStats>,
    pub(crate) max_compression_ratio: AtomicU32,
}

enum Staged<'a> {
    /// The compressed bytes already landed in the object store.
    Direct(ObjHandle),
    /// The object store was full; the bytes wait in a spare buffer while
    /// writeback runs.
    Deferred(scratch::SpareBuf<'a>),
}

impl ZswapCache {
    /// Notify the cache that a swap type has come online.
    ///
    /// Lazily creates the index and its object store; calling again for a
    /// live type is a no-op. Out-of-range types are ignored so the host can
    /// proceed without caching.
    pub fn init(&self, swap_type: u32) {
        let Some(slot) = self.trees.get(swap_type as usize) else {
            warn!(swap_type, "swap type out of range, not cached");
            return;
        };
        let mut guard = slot.write();
        if guard.is_none() {
            *guard = Some(Arc::new(SwapIndex::new(swap_type, Arc::clone(&self.pool))));
            debug!(swap_type, "swap cache index created");
        }
    }

    pub(crate) fn index(&self, swap_type: u32) -> Option<Arc<SwapIndex>> {
        self.trees.get(swap_type as usize)?.read().clone()
    }

    /// Compress and admit a page.
    ///
    /// On success a subsequent [`Self::load`] for the same `(swap_type,
    /// offset)` reproduces the page, until an invalidate or writeback
    /// removes it. Storing over an existing offset replaces the old entry.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] naming the rejection; the caller then writes
    /// the page to the real swap device. Rejections publish no state.
    pub fn store(
        &self,
        swap_type: u32,
        offset: u64,
        page: &[u8; PAGE_SIZE],
    ) -> Result<(), StoreError> {
        let Some(index) = self.index(swap_type) else {
            self.stats.reject_no_device.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::NoDevice);
        };

        // Reserve the entry record before compressing so publish cannot
        // fail for memory after the bytes are staged.
        if !index.inner.lock().slab.try_reserve() {
            self.stats.reject_entry_alloc.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::EntryAlloc);
        }

        let max_ratio = self.max_compression_ratio.load(Ordering::Relaxed) as usize;

        // Compress into the worker's pinned buffer; nothing in this closure
        // may block.
        let (staged, dlen) = scratch::with_dst(|dst| {
            let dlen = self.codec.compress(page, dst).map_err(|_| {
                self.stats.reject_compress_fail.fetch_add(1, Ordering::Relaxed);
                StoreError::CompressFailed
            })?;

            if dlen * 100 / PAGE_SIZE > max_ratio {
                self.stats.reject_compress_poor.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::PoorCompression { compressed_len: dlen });
            }

            if let Some(handle) = index.store.alloc(dlen) {
                index.store.write_with(handle, dlen, |buf| buf.copy_from_slice(&dst[..dlen]));
                return Ok((Staged::Direct(handle), dlen));
            }

            if self.backend.is_none() {
                self.stats.reject_alloc_fail.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::NoSpace { writeback_attempted: false });
            }

            // Stage the result in a spare buffer so the pinned one can be
            // released before writeback blocks.
            let Some(mut spare) = self.spare.try_borrow() else {
                self.stats.reject_spare_fail.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::SpareBufferExhausted);
            };
            spare[..dlen].copy_from_slice(&dst[..dlen]);
            Ok((Staged::Deferred(spare), dlen))
        })?;

        let handle = match staged {
            Staged::Direct(handle) => handle,
            Staged::Deferred(spare) => {
                self.stats.writeback_attempted.fetch_add(1, Ordering::Relaxed);
                self.writeback_batch(&index, WRITEBACK_BATCH);
                let Some(handle) = index.store.alloc(dlen) else {
                    self.stats.reject_alloc_fail.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::NoSpace { writeback_attempted: true });
                };
                index.store.write_with(handle, dlen, |buf| buf.copy_from_slice(&spare[..dlen]));
                self.stats.saved_by_writeback.fetch_add(1, Ordering::Relaxed);
                handle
            }
        };

        // Publish. A duplicate offset loses its old entry first; the loop is
        // bounded because each pass removes one duplicate while the lock is
        // held.
        let length = u32::try_from(dlen).expect("compressed length fits u32");
        let mut inner = index.inner.lock();
        let Some(idx) = inner.slab.insert(Entry::new(offset, handle, length)) else {
            drop(inner);
            index.store.free(handle);
            self.stats.reject_entry_alloc.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::EntryAlloc);
        };
        loop {
            match inner.map_insert(offset, idx) {
                Ok(()) => break,
                Err(dup) => {
                    self.stats.duplicate_entries.fetch_add(1, Ordering::Relaxed);
                    inner.map_remove(offset);
                    inner.lru_unlink(dup);
                    if inner.put_ref(dup) == 0 {
                        index.free_entry(&mut inner, dup, &self.stats);
                    }
                }
            }
        }
        inner.lru_push_tail(idx);
        drop(inner);

        self.stats.stored_pages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Decompress a cached page into `page`.
    ///
    /// Returns `true` on a hit. A miss is not an error: the entry may have
    /// been written back, in which case the caller reads the real swap
    /// device.
    pub fn load(&self, swap_type: u32, offset: u64, page: &mut [u8; PAGE_SIZE]) -> bool {
        let Some(index) = self.index(swap_type) else {
            return false;
        };

        let (idx, handle, length) = {
            let mut inner = index.inner.lock();
            let Some(idx) = inner.search(offset) else {
                return false;
            };
            // Hold a reference and step off the LRU while the entry is
            // being serviced.
            inner.get_ref(idx);
            inner.lru_unlink(idx);
            let entry = inner.entry(idx);
            (idx, entry.handle, entry.length as usize)
        };

        index.store.read_with(handle, length, |src| {
            let n = self
                .codec
                .decompress(src, page)
                .expect("compressed pool corrupted: decompression failed");
            assert_eq!(n, PAGE_SIZE, "compressed pool corrupted: bad decompressed length");
        });

        let mut inner = index.inner.lock();
        let refcount = inner.put_ref(idx);
        if refcount <= 0 {
            // A racing invalidate or writeback already unpublished the
            // entry; the last holder frees it.
            index.free_entry(&mut inner, idx, &self.stats);
        } else if refcount == 1 && inner.search(offset) == Some(idx) {
            // Last holder besides the index and still published; back onto
            // the LRU. At a higher count a writeback or another load still
            // has the entry off the list and settles its fate, and an
            // unpublished entry must never be relinked.
            inner.lru_push_tail(idx);
        }
        true
    }

    /// Drop a single entry. After return no load for the offset will hit.
    ///
    /// Absence is fine: the entry may already have been written back.
    pub fn invalidate_page(&self, swap_type: u32, offset: u64) {
        let Some(index) = self.index(swap_type) else {
            return;
        };
        let mut inner = index.inner.lock();
        let Some(idx) = inner.search(offset) else {
            return;
        };
        inner.map_remove(offset);
        inner.lru_unlink(idx);
        // Drop the index's own reference; an in-flight load or writeback
        // still holding the entry frees it on its way out.
        if inner.put_ref(idx) == 0 {
            index.free_entry(&mut inner, idx, &self.stats);
        }
    }

    /// Drop every entry for a swap type, called under the host's swap
    /// teardown exclusion.
    pub fn invalidate_area(&self, swap_type: u32) {
        let Some(index) = self.index(swap_type) else {
            return;
        };
        let mut inner = index.inner.lock();
        let count = index.drain(&mut inner, &self.stats);
        drop(inner);
        debug!(swap_type, entries = count, "swap area invalidated");
    }

    /// Snapshot the observability counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.pool)
    }

    /// Change the pool occupancy ceiling at runtime.
    pub fn set_max_pool_percent(&self, percent: u32) {
        self.pool.set_max_percent(percent.min(100));
    }

    /// Change the admission ratio threshold at runtime.
    pub fn set_max_compression_ratio(&self, percent: u32) {
        self.max_compression_ratio.store(percent.min(100), Ordering::Relaxed);
    }
}
