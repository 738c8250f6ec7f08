use super::{ChunkStore, check_next, chunks_after};
use crate::{Chunk, Payload, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A process-local [`ChunkStore`].
///
/// Chunks live in a `stream_id -> Vec<Chunk>` map behind a single
/// [`RwLock`]. Appends validate and insert under the write lock, so
/// concurrent writers for one stream are serialized and exactly one wins a
/// given sequence. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    streams: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryChunkStore {
    async fn append(&self, stream_id: &str, sequence: u64, payload: Payload) -> Result<Chunk> {
        let mut streams = self.streams.write();
        let len = streams.get(stream_id).map_or(0, Vec::len) as u64;
        check_next(stream_id, len, sequence)?;

        let chunk = Chunk::new(stream_id, sequence, payload);
        streams
            .entry(stream_id.to_string())
            .or_default()
            .push(chunk.clone());
        Ok(chunk)
    }

    async fn read_after(&self, stream_id: &str, last_sequence: Option<u64>) -> Result<Vec<Chunk>> {
        let streams = self.streams.read();
        Ok(streams
            .get(stream_id)
            .map(|chunks| chunks_after(chunks, last_sequence))
            .unwrap_or_default())
    }

    async fn is_complete(&self, stream_id: &str) -> Result<bool> {
        let streams = self.streams.read();
        Ok(streams
            .get(stream_id)
            .and_then(|chunks| chunks.last())
            .is_some_and(Chunk::is_terminal))
    }

    async fn last_sequence(&self, stream_id: &str) -> Result<Option<u64>> {
        let streams = self.streams.read();
        Ok(streams
            .get(stream_id)
            .and_then(|chunks| chunks.last())
            .map(|chunk| chunk.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn rejected_append_leaves_no_stream_behind() {
        let store = MemoryChunkStore::new();
        assert!(matches!(
            store.append("ghost", 3, Payload::fragment("x")).await,
            Err(Error::OutOfOrder { .. })
        ));
        assert!(store.streams.read().is_empty());
        assert_eq!(store.last_sequence("ghost").await.unwrap(), None);

        store.append("ghost", 0, Payload::fragment("x")).await.unwrap();
        assert_eq!(store.streams.read().len(), 1);
    }
}
