//! Page compression codecs.
//!
//! The cache treats compression as a pure byte-buffer transform behind the
//! [`Codec`] trait. Codecs are selected by name when the cache is built;
//! an unknown name falls back to the built-in default.

use crate::{Error, PAGE_SIZE};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::warn;

/// Name of the codec used when none (or an unknown one) is requested.
pub(crate) const DEFAULT_CODEC: &str = "lz4";

/// A page compression codec.
///
/// Implementations must be deterministic: decompressing the output of
/// `compress` always reproduces the input bytes exactly. Both operations
/// run in non-sleepable sections of the cache and must not block.
pub trait Codec: Send + Sync {
    /// The codec's registered name.
    fn name(&self) -> &'static str;

    /// Compress `src` into `dst`, returning the compressed length.
    ///
    /// # Errors
    ///
    /// Returns an error if compression fails or `dst` is too small.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error>;

    /// Decompress `src` into `dst`, returning the decompressed length.
    ///
    /// # Errors
    ///
    /// Returns an error if the compressed data is corrupted.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error>;
}

/// LZ4 block format, the default.
struct Lz4;

impl Codec for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        lz4_flex::block::compress_into(src, dst).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        lz4_flex::block::decompress_into(src, dst).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Raw DEFLATE at the fastest level.
struct Deflate;

impl Codec for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        let mut c = Compress::new(Compression::fast(), false);
        match c.compress(src, dst, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Ok(usize::try_from(c.total_out())
                .map_err(|_| Error::Codec("compressed length overflow".to_string()))?),
            Ok(_) => Err(Error::Codec("deflate output buffer too small".to_string())),
            Err(e) => Err(Error::Codec(e.to_string())),
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
        let mut d = Decompress::new(false);
        match d.decompress(src, dst, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => Ok(usize::try_from(d.total_out())
                .map_err(|_| Error::Codec("decompressed length overflow".to_string()))?),
            Ok(_) => Err(Error::Codec("truncated deflate stream".to_string())),
            Err(e) => Err(Error::Codec(e.to_string())),
        }
    }
}

/// Look up a codec by name.
pub(crate) fn by_name(name: &str) -> Option<Box<dyn Codec>> {
    match name {
        "lz4" => Some(Box::new(Lz4)),
        "deflate" => Some(Box::new(Deflate)),
        _ => None,
    }
}

/// Resolve a codec by name, falling back to the default when unknown.
pub(crate) fn resolve(name: &str) -> Box<dyn Codec> {
    by_name(name).unwrap_or_else(|| {
        warn!(codec = name, fallback = DEFAULT_CODEC, "codec not available, using fallback");
        by_name(DEFAULT_CODEC).expect("default codec must exist")
    })
}

/// Destination buffers are sized at twice the page so even pathological
/// expansion of incompressible input fits.
pub(crate) const MAX_COMPRESSED: usize = 2 * PAGE_SIZE;
