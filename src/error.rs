//! Error types for zswap-cache.

use thiserror::Error;

/// Infrastructure errors surfaced while building or operating the cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Input or configuration is invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error (e.g. reading system memory information).
    #[error("I/O error: {0}")]
    Io(String),

    /// The compression codec reported a failure.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Why a store request was not admitted into the cache.
///
/// Rejections are expected outcomes, not faults: the caller falls through to
/// the real swap device and the page is simply not cached. Every variant has
/// a matching counter in [`crate::StatsSnapshot`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No cache index exists for the swap type.
    #[error("no cache for swap type")]
    NoDevice,

    /// The entry record could not be allocated.
    #[error("entry record allocation failed")]
    EntryAlloc,

    /// The codec failed to compress the page.
    #[error("page compression failed")]
    CompressFailed,

    /// The page compressed above the acceptable ratio threshold.
    #[error("poor compression ({compressed_len} bytes)")]
    PoorCompression {
        /// Length the page compressed to.
        compressed_len: usize,
    },

    /// No spare buffer was available to stage the compressed bytes while
    /// writeback runs.
    #[error("spare compression buffers exhausted")]
    SpareBufferExhausted,

    /// The compressed object store could not make room for the entry.
    #[error("no space in compressed pool (writeback attempted: {writeback_attempted})")]
    NoSpace {
        /// Whether a writeback batch ran before the final allocation attempt.
        writeback_attempted: bool,
    },
}
