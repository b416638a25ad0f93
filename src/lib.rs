//! Compressed cache for swap pages.
//!
//! This crate implements the engine of a compressed swap cache: pages on
//! their way to a swap device are compressed and parked in a bounded
//! RAM-resident pool, and are decompressed straight back out of RAM on the
//! next fault. When the pool fills up, the oldest entries are decompressed
//! and handed back to the real swap writeback path ("resumed writeback"),
//! making room for fresher victims.
//!
//! The host swap subsystem drives the cache through five operations:
//! [`ZswapCache::init`], [`ZswapCache::store`], [`ZswapCache::load`],
//! [`ZswapCache::invalidate_page`] and [`ZswapCache::invalidate_area`].
//! Writeback requires a [`SwapBackend`] supplied by the host.
//!
//! # Example
//!
//! ```
//! use zswap_cache::{ZswapCacheBuilder, PAGE_SIZE};
//!
//! let cache = ZswapCacheBuilder::new()
//!     .total_ram_bytes(64 * PAGE_SIZE as u64)
//!     .build()
//!     .unwrap();
//!
//! cache.init(0);
//!
//! let page = [0u8; PAGE_SIZE];
//! cache.store(0, 42, &page).unwrap();
//!
//! let mut out = [0xFFu8; PAGE_SIZE];
//! assert!(cache.load(0, 42, &mut out));
//! assert_eq!(page, out);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod codec;
mod error;
mod index;
mod objstore;
mod pool;
mod scratch;
mod stats;
mod writeback;

pub use cache::{ZswapCache, ZswapCacheBuilder};
pub use codec::Codec;
pub use error::{Error, StoreError};
pub use stats::StatsSnapshot;
pub use writeback::{SwapBackend, SwapCachePage, SwapSlot, WritebackCompletion};

/// Standard memory page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of swap types (devices) the cache can track.
pub const MAX_SWAP_TYPES: usize = 32;

/// Entries reclaimed per writeback batch when admission runs out of space.
pub(crate) const WRITEBACK_BATCH: usize = 16;

/// Ceiling on pages simultaneously decompressed and awaiting swap I/O.
pub(crate) const MAX_OUTSTANDING_WRITEBACKS: u64 = 64;
