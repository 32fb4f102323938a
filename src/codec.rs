//! Block compression for trace payloads.
//!
//! Producers compress payload blocks before they hit the transport, so
//! throughput matters more than ratio: this wraps LZ4 block mode at its
//! default (fast) level. Every call is self-contained; no dictionary or
//! streaming state is carried between blocks, and the encoded block has
//! no embedded header. The caller tracks the uncompressed size out of
//! band.

use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The destination buffer cannot hold the result.
    #[error("codec destination buffer too small")]
    OutputTooSmall,

    /// The encoded block is corrupt or truncated. The destination buffer
    /// contents are unspecified but no write past its end has occurred.
    #[error("malformed compressed block")]
    Malformed,
}

/// Worst-case encoded size for a source block of `src_len` bytes. Size
/// `dst` with this before calling [`encode`].
pub fn max_encoded_len(src_len: usize) -> usize {
    get_maximum_output_size(src_len)
}

/// Compress `src` into `dst`, returning the number of bytes written.
pub fn encode(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    compress_into(src, dst).map_err(|_| CodecError::OutputTooSmall)
}

/// Decompress `src` into `dst`, returning the number of bytes written.
/// Never writes past `dst`; corrupt or truncated input fails cleanly.
pub fn decode(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    decompress_into(src, dst).map_err(|_| CodecError::Malformed)
}
