//! Append-only, per-stream ordered chunk storage.
//!
//! A [`ChunkStore`] is the single source of truth for every stream. It is
//! keyed by `(stream_id, sequence)` and enforces the no-gaps invariant at the
//! write boundary: the persisted sequences of a stream are always exactly
//! `0..=N`.
//!
//! ## Implementations
//!
//! - [`MemoryChunkStore`] - process-local, for tests and throwaway servers.
//! - [`FileChunkStore`] - a durable JSON-lines log, fsync'd on every append
//!   and recovered on open.

mod file;
mod memory;
#[cfg(test)]
mod tests;

pub use file::*;
pub use memory::*;

use crate::{Chunk, Error, Payload, Result};
use core::future::Future;

/// Storage contract for the stream log.
///
/// All methods take `&self`: implementations must support one appender and
/// many concurrent readers per stream without corrupting ordering.
pub trait ChunkStore: Send + Sync + 'static {
    /// Appends `payload` at `sequence` and returns the persisted chunk.
    ///
    /// The chunk is durable (to the degree the implementation promises) and
    /// visible to [`Self::read_after`] before this resolves.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSequence`] if a chunk already exists at
    ///   `(stream_id, sequence)`.
    /// - [`Error::OutOfOrder`] if `sequence` is not the next sequence for the
    ///   stream (`0` for a brand-new stream).
    /// - Storage errors from the implementation.
    fn append(
        &self,
        stream_id: &str,
        sequence: u64,
        payload: Payload,
    ) -> impl Future<Output = Result<Chunk>> + Send;

    /// Returns every chunk with `sequence > last_sequence`, ascending.
    ///
    /// `None` means "before 0" and returns the whole stream. An empty result
    /// is valid.
    fn read_after(
        &self,
        stream_id: &str,
        last_sequence: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Chunk>>> + Send;

    /// Returns `true` iff a chunk with `end = true` has been persisted.
    fn is_complete(&self, stream_id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns the highest persisted sequence, or `None` for an empty stream.
    fn last_sequence(&self, stream_id: &str) -> impl Future<Output = Result<Option<u64>>> + Send;
}

/// Validates that `sequence` may be appended to a stream holding `len`
/// chunks.
pub(crate) fn check_next(stream_id: &str, len: u64, sequence: u64) -> Result<()> {
    if sequence < len {
        return Err(Error::DuplicateSequence {
            stream_id: stream_id.to_string(),
            sequence,
        });
    }
    if sequence != len {
        return Err(Error::OutOfOrder {
            stream_id: stream_id.to_string(),
            expected: len,
            actual: sequence,
        });
    }
    Ok(())
}

/// Slices the chunks after `last_sequence` out of a gap-free stream log.
///
/// Because the log holds exactly `0..len`, the chunk with sequence `n` lives
/// at index `n`.
pub(crate) fn chunks_after(chunks: &[Chunk], last_sequence: Option<u64>) -> Vec<Chunk> {
    let start = last_sequence.map_or(0, |s| {
        usize::try_from(s).map_or(usize::MAX, |s| s.saturating_add(1))
    });
    chunks.get(start..).map(<[Chunk]>::to_vec).unwrap_or_default()
}
