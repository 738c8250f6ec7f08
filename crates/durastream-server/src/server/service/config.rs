use crate::server::config::{ServerConfig, StorageKind};
use durastream::{
    Chunk, ChunkStore, FileChunkStore, MemoryChunkStore, Payload, Result, ScriptedProducer,
    StreamCoordinator,
};

/// Chunk store selected at startup by `STORAGE`.
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryChunkStore),
    File(FileChunkStore),
}

impl Backend {
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        Ok(match config.storage {
            StorageKind::Memory => Self::Memory(MemoryChunkStore::new()),
            StorageKind::File => Self::File(FileChunkStore::open(&config.data_path).await?),
        })
    }
}

impl ChunkStore for Backend {
    async fn append(&self, stream_id: &str, sequence: u64, payload: Payload) -> Result<Chunk> {
        match self {
            Self::Memory(store) => store.append(stream_id, sequence, payload).await,
            Self::File(store) => store.append(stream_id, sequence, payload).await,
        }
    }

    async fn read_after(&self, stream_id: &str, last_sequence: Option<u64>) -> Result<Vec<Chunk>> {
        match self {
            Self::Memory(store) => store.read_after(stream_id, last_sequence).await,
            Self::File(store) => store.read_after(stream_id, last_sequence).await,
        }
    }

    async fn is_complete(&self, stream_id: &str) -> Result<bool> {
        match self {
            Self::Memory(store) => store.is_complete(stream_id).await,
            Self::File(store) => store.is_complete(stream_id).await,
        }
    }

    async fn last_sequence(&self, stream_id: &str) -> Result<Option<u64>> {
        match self {
            Self::Memory(store) => store.last_sequence(stream_id).await,
            Self::File(store) => store.last_sequence(stream_id).await,
        }
    }
}

/// Producer used by the server: replays the configured story.
pub type Producer = ScriptedProducer;

/// Coordinator wired to the server's store and producer.
pub type Coordinator = StreamCoordinator<Backend, Producer>;

pub fn build_producer(config: &ServerConfig) -> Producer {
    ScriptedProducer::new(config.story.as_str())
        .with_words_per_fragment(config.words_per_fragment)
        .with_fragment_delay(config.fragment_delay)
}
