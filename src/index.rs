//! Per-swap-type entry index.
//!
//! One [`SwapIndex`] exists per swap type. Its single mutex protects the
//! ordered map, the LRU list, and every refcount in the index; holding it
//! totally orders all metadata mutation for the type.
//!
//! Entries live in a slab and the LRU is a doubly-linked list threaded
//! through the slab by `u32` index, so list surgery never moves an entry.
//! An explicit membership flag stands in for the self-looped list node of
//! the usual intrusive-list idiom.
//!
//! # Refcount protocol
//!
//! An entry is born with refcount 1, the index's own reference, and the
//! refcount is only ever touched under the index lock. Any path that keeps
//! using the entry after releasing the lock takes its own reference first
//! ([`IndexInner::get_ref`]) and drops it afterwards ([`IndexInner::put_ref`]).
//! Whoever observes the count fall to zero (or below, in the writeback race)
//! frees the entry; freeing releases the object-store allocation, the slab
//! slot, and the stored-page counter together.

use crate::objstore::{ObjHandle, ObjectStore};
use crate::pool::PagePool;
use crate::stats::CacheStats;
use parking_lot::Mutex;
use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Null link for the intrusive LRU list.
const NIL: u32 = u32::MAX;

/// Metadata for one compressed page.
pub(crate) struct Entry {
    pub(crate) offset: u64,
    pub(crate) handle: ObjHandle,
    pub(crate) length: u32,
    refcount: i32,
    lru_prev: u32,
    lru_next: u32,
    in_lru: bool,
}

impl Entry {
    pub(crate) fn new(offset: u64, handle: ObjHandle, length: u32) -> Self {
        Self {
            offset,
            handle,
            length,
            refcount: 1,
            lru_prev: NIL,
            lru_next: NIL,
            in_lru: false,
        }
    }
}

/// Slab of entry records with a free list.
///
/// Slot indices stay valid for as long as the entry is live; paths holding
/// an index across an unlock also hold a refcount, which keeps the slot
/// from being reused underneath them.
pub(crate) struct EntrySlab {
    slots: Vec<Option<Entry>>,
    free: Vec<u32>,
}

impl EntrySlab {
    fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Make sure the next insert will not need a fresh allocation.
    pub(crate) fn try_reserve(&mut self) -> bool {
        !self.free.is_empty() || self.slots.try_reserve(1).is_ok()
    }

    pub(crate) fn insert(&mut self, entry: Entry) -> Option<u32> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(entry);
            return Some(idx);
        }
        if self.slots.try_reserve(1).is_err() {
            return None;
        }
        self.slots.push(Some(entry));
        Some(u32::try_from(self.slots.len() - 1).expect("slab index fits u32"))
    }

    fn remove(&mut self, idx: u32) -> Entry {
        let entry = self.slots[idx as usize].take().expect("removing a dead entry");
        self.free.push(idx);
        entry
    }

    fn get(&self, idx: u32) -> &Entry {
        self.slots[idx as usize].as_ref().expect("dead entry index")
    }

    fn get_mut(&mut self, idx: u32) -> &mut Entry {
        self.slots[idx as usize].as_mut().expect("dead entry index")
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

/// Map, LRU, and slab; everything the index mutex protects.
pub(crate) struct IndexInner {
    map: BTreeMap<u64, u32>,
    pub(crate) slab: EntrySlab,
    lru_head: u32,
    lru_tail: u32,
}

impl IndexInner {
    fn new() -> Self {
        Self { map: BTreeMap::new(), slab: EntrySlab::new(), lru_head: NIL, lru_tail: NIL }
    }

    pub(crate) fn entry(&self, idx: u32) -> &Entry {
        self.slab.get(idx)
    }

    pub(crate) fn search(&self, offset: u64) -> Option<u32> {
        self.map.get(&offset).copied()
    }

    /// Insert `idx` under `offset`. On a duplicate the map is left untouched
    /// and the existing entry's index is returned.
    pub(crate) fn map_insert(&mut self, offset: u64, idx: u32) -> Result<(), u32> {
        match self.map.entry(offset) {
            MapEntry::Vacant(slot) => {
                slot.insert(idx);
                Ok(())
            }
            MapEntry::Occupied(slot) => Err(*slot.get()),
        }
    }

    /// Remove the map entry for `offset` only if it still names `idx`.
    ///
    /// A raced duplicate store may have republished the offset with a new
    /// entry; that mapping must survive.
    pub(crate) fn map_remove_if(&mut self, offset: u64, idx: u32) {
        if self.map.get(&offset) == Some(&idx) {
            self.map.remove(&offset);
        }
    }

    pub(crate) fn map_remove(&mut self, offset: u64) -> Option<u32> {
        self.map.remove(&offset)
    }

    pub(crate) fn get_ref(&mut self, idx: u32) {
        self.slab.get_mut(idx).refcount += 1;
    }

    pub(crate) fn put_ref(&mut self, idx: u32) -> i32 {
        let entry = self.slab.get_mut(idx);
        entry.refcount -= 1;
        entry.refcount
    }

    /// Append `idx` as the most recently used entry.
    pub(crate) fn lru_push_tail(&mut self, idx: u32) {
        let tail = self.lru_tail;
        {
            let entry = self.slab.get_mut(idx);
            debug_assert!(!entry.in_lru);
            entry.lru_prev = tail;
            entry.lru_next = NIL;
            entry.in_lru = true;
        }
        if tail == NIL {
            self.lru_head = idx;
        } else {
            self.slab.get_mut(tail).lru_next = idx;
        }
        self.lru_tail = idx;
    }

    /// Unlink `idx` from the LRU; a no-op when it is not a member.
    pub(crate) fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let entry = self.slab.get_mut(idx);
            if !entry.in_lru {
                return;
            }
            let links = (entry.lru_prev, entry.lru_next);
            entry.lru_prev = NIL;
            entry.lru_next = NIL;
            entry.in_lru = false;
            links
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slab.get_mut(prev).lru_next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slab.get_mut(next).lru_prev = prev;
        }
    }

    /// Dequeue the least recently used entry.
    pub(crate) fn lru_pop_head(&mut self) -> Option<u32> {
        let head = self.lru_head;
        if head == NIL {
            return None;
        }
        self.lru_unlink(head);
        Some(head)
    }
}

/// Per-swap-type index: ordered map plus LRU behind one mutex, and the
/// type's private compressed object store.
pub(crate) struct SwapIndex {
    pub(crate) swap_type: u32,
    pub(crate) store: ObjectStore,
    pub(crate) inner: Mutex<IndexInner>,
}

impl SwapIndex {
    pub(crate) fn new(swap_type: u32, pool: Arc<PagePool>) -> Self {
        Self { swap_type, store: ObjectStore::new(pool), inner: Mutex::new(IndexInner::new()) }
    }

    /// Free an entry: object-store allocation, slab slot, and stored-page
    /// count go together. Runs under the index lock; the entry is unlinked
    /// from map and LRU first, defensively, so every caller may free
    /// regardless of which racing path got to the links before it.
    pub(crate) fn free_entry(&self, inner: &mut IndexInner, idx: u32, stats: &CacheStats) {
        inner.lru_unlink(idx);
        let entry = inner.slab.remove(idx);
        inner.map_remove_if(entry.offset, idx);
        self.store.free(entry.handle);
        stats.stored_pages.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Drop every entry and reset the index to empty. The caller guarantees
    /// no store, load, or invalidate runs concurrently.
    pub(crate) fn drain(&self, inner: &mut IndexInner, stats: &CacheStats) -> usize {
        let map = std::mem::take(&mut inner.map);
        let count = map.len();
        for (_, idx) in map {
            let entry = inner.slab.remove(idx);
            self.store.free(entry.handle);
            stats.stored_pages.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        inner.slab.clear();
        inner.lru_head = NIL;
        inner.lru_tail = NIL;
        count
    }
}
