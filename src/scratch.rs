//! Compression scratch buffers.
//!
//! Every worker that runs the store path compresses into a thread-local
//! destination buffer of twice the page size. The buffer is conceptually
//! pinned while borrowed, so the store path never blocks inside
//! [`with_dst`].
//!
//! A small fixed pool of spare buffers exists for the one case where the
//! store path must keep a compressed result alive across a blocking call:
//! the bytes are copied into a spare, the thread-local buffer is released,
//! and the spare travels with the caller until admission finishes. Spare
//! exhaustion is a rejection, never a wait.

use crate::codec::MAX_COMPRESSED;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Spare staging buffers available across all swap types.
pub(crate) const SPARE_BUFFERS: usize = 16;

type DstBuf = Box<[u8; MAX_COMPRESSED]>;

fn new_buf() -> DstBuf {
    Box::new([0u8; MAX_COMPRESSED])
}

thread_local! {
    static DST: RefCell<DstBuf> = RefCell::new(new_buf());
}

/// Run `f` with the calling worker's destination buffer.
///
/// `f` must not block and must not re-enter `with_dst`.
pub(crate) fn with_dst<R>(f: impl FnOnce(&mut [u8]) -> R) -> R {
    DST.with(|buf| f(&mut buf.borrow_mut()[..]))
}

/// Fixed-size pool of spare staging buffers.
pub(crate) struct SparePool {
    bufs: Mutex<Vec<DstBuf>>,
}

impl SparePool {
    pub(crate) fn new(count: usize) -> Self {
        let mut bufs = Vec::with_capacity(count);
        bufs.resize_with(count, new_buf);
        Self { bufs: Mutex::new(bufs) }
    }

    /// Borrow a spare buffer, or fail fast when the pool is drained.
    pub(crate) fn try_borrow(&self) -> Option<SpareBuf<'_>> {
        let buf = self.bufs.lock().pop()?;
        Some(SpareBuf { pool: self, buf: Some(buf) })
    }

    fn give_back(&self, buf: DstBuf) {
        self.bufs.lock().push(buf);
    }
}

/// A spare buffer on loan from a [`SparePool`], returned on drop.
pub(crate) struct SpareBuf<'a> {
    pool: &'a SparePool,
    buf: Option<DstBuf>,
}

impl Deref for SpareBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer present until drop")[..]
    }
}

impl DerefMut for SpareBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().expect("buffer present until drop")[..]
    }
}

impl Drop for SpareBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
