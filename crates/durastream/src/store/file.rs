use super::{ChunkStore, check_next, chunks_after};
use crate::{Chunk, Error, Payload, Result};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

/// A durable [`ChunkStore`] backed by a single append-only JSON-lines file.
///
/// Every chunk of every stream is one line in the log. An in-memory index
/// (`stream_id -> chunks in sequence order`) serves [`ChunkStore::read_after`]
/// without touching the disk.
///
/// ## Durability
///
/// `append` writes the record, flushes and calls `sync_data` before the chunk
/// is inserted into the index and before it returns. A chunk that was
/// acknowledged survives a crash; a chunk that was not is either absent or a
/// torn final line, which [`FileChunkStore::open`] truncates away.
///
/// ## Concurrency
///
/// Appends are serialized by an async writer lock. Sequence validation runs
/// under that lock, so two concurrent writers for the same stream cannot both
/// succeed at one sequence. Readers only take the index lock and never wait on
/// disk I/O.
#[derive(Debug)]
pub struct FileChunkStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    index: RwLock<HashMap<String, Vec<Chunk>>>,
}

#[derive(Debug)]
struct LogWriter {
    file: File,
    // Length of the log up to the last fully synced record.
    len: u64,
    // Set when a partial record could not be cut off. Nothing more may be
    // appended behind it.
    poisoned: bool,
}

impl FileChunkStore {
    /// Opens (or creates) the log at `path` and rebuilds the index from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a record other than the last one cannot
    /// be decoded, or if the records of a stream are not gap-free. Returns
    /// [`Error::Io`] on filesystem failures.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let (bytes, created) = match fs::read(&path).await {
            Ok(bytes) => (bytes, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), true),
            Err(e) => return Err(e.into()),
        };
        let recovered = recover(&bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if created {
            // The new directory entry has to be durable too, or the whole log
            // can vanish in a crash.
            sync_parent_dir(&path).await?;
        }

        let total = bytes.len() as u64;
        if recovered.valid_len < total {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = total - recovered.valid_len,
                "Truncating torn record at the end of the chunk log"
            );
            file.set_len(recovered.valid_len).await?;
            file.sync_all().await?;
        }

        tracing::info!(
            path = %path.display(),
            streams = recovered.index.len(),
            records = recovered.records,
            "Opened chunk log"
        );

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                len: recovered.valid_len,
                poisoned: false,
            }),
            index: RwLock::new(recovered.index),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogWriter {
    async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.file.write_all(record).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.len += record.len() as u64;
        Ok(())
    }

    /// Cuts the file back to the last good record after a failed write.
    async fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len).await {
            tracing::error!("Failed to roll back partial chunk record, refusing further appends: {e}");
            self.poisoned = true;
        }
    }
}

/// Makes the directory entry of a freshly created file durable.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

impl ChunkStore for FileChunkStore {
    async fn append(&self, stream_id: &str, sequence: u64, payload: Payload) -> Result<Chunk> {
        let mut writer = self.writer.lock().await;
        if writer.poisoned {
            return Err(Error::Io(std::io::Error::other(
                "chunk log has a partial record that could not be rolled back; reopen the store",
            )));
        }

        let len = {
            let index = self.index.read();
            index.get(stream_id).map_or(0, Vec::len) as u64
        };
        check_next(stream_id, len, sequence)?;

        let chunk = Chunk::new(stream_id, sequence, payload);
        let mut record = serde_json::to_vec(&chunk)?;
        record.push(b'\n');

        if let Err(e) = writer.write_record(&record).await {
            writer.rollback().await;
            return Err(e);
        }

        self.index
            .write()
            .entry(stream_id.to_string())
            .or_default()
            .push(chunk.clone());
        Ok(chunk)
    }

    async fn read_after(&self, stream_id: &str, last_sequence: Option<u64>) -> Result<Vec<Chunk>> {
        let index = self.index.read();
        Ok(index
            .get(stream_id)
            .map(|chunks| chunks_after(chunks, last_sequence))
            .unwrap_or_default())
    }

    async fn is_complete(&self, stream_id: &str) -> Result<bool> {
        let index = self.index.read();
        Ok(index
            .get(stream_id)
            .and_then(|chunks| chunks.last())
            .is_some_and(Chunk::is_terminal))
    }

    async fn last_sequence(&self, stream_id: &str) -> Result<Option<u64>> {
        let index = self.index.read();
        Ok(index
            .get(stream_id)
            .and_then(|chunks| chunks.last())
            .map(|chunk| chunk.sequence))
    }
}

struct Recovered {
    index: HashMap<String, Vec<Chunk>>,
    valid_len: u64,
    records: usize,
}

/// Replays the raw log into an index.
///
/// Stops at the first incomplete final record and reports how many bytes are
/// valid so the caller can truncate the rest.
fn recover(bytes: &[u8]) -> Result<Recovered> {
    let mut index: HashMap<String, Vec<Chunk>> = HashMap::new();
    let mut offset = 0;
    let mut line_no = 0;
    let mut records = 0;

    while offset < bytes.len() {
        // A missing newline means the final append never completed.
        let Some(newline) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            break;
        };
        line_no += 1;
        let end = offset + newline;
        let line = &bytes[offset..end];

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = end + 1;
            continue;
        }

        let chunk: Chunk = match serde_json::from_slice(line) {
            Ok(chunk) => chunk,
            Err(_) if end + 1 == bytes.len() => break,
            Err(e) => {
                return Err(Error::Corrupted {
                    line: line_no,
                    reason: e.to_string(),
                });
            }
        };

        let chunks = index.entry(chunk.stream_id.clone()).or_default();
        check_next(&chunk.stream_id, chunks.len() as u64, chunk.sequence).map_err(|e| {
            Error::Corrupted {
                line: line_no,
                reason: e.to_string(),
            }
        })?;
        chunks.push(chunk);
        records += 1;
        offset = end + 1;
    }

    Ok(Recovered {
        index,
        valid_len: offset as u64,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> PathBuf {
        dir.path().join("stream_data.jsonl")
    }

    #[tokio::test]
    async fn acknowledged_chunks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileChunkStore::open(log_path(&dir)).await.unwrap();
            for (seq, word) in ["once", " upon", " a", " time"].iter().enumerate() {
                store
                    .append("s1", seq as u64, Payload::fragment(*word))
                    .await
                    .unwrap();
            }
        }

        let store = FileChunkStore::open(log_path(&dir)).await.unwrap();
        let chunks = store.read_after("s1", Some(1)).await.unwrap();
        let seqs: Vec<_> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(chunks[1].payload, Payload::fragment(" time"));
        assert_eq!(store.last_sequence("s1").await.unwrap(), Some(3));
        assert!(!store.is_complete("s1").await.unwrap());

        // Numbering continues from the recovered tail.
        assert!(matches!(
            store.append("s1", 3, Payload::fragment("again")).await,
            Err(Error::DuplicateSequence { sequence: 3, .. })
        ));
        store.append("s1", 4, Payload::terminal()).await.unwrap();
        assert!(store.is_complete("s1").await.unwrap());
    }

    #[tokio::test]
    async fn torn_final_record_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        {
            let store = FileChunkStore::open(&path).await.unwrap();
            store.append("s1", 0, Payload::fragment("a")).await.unwrap();
            store.append("s1", 1, Payload::fragment("b")).await.unwrap();
        }
        let intact = std::fs::read(&path).unwrap();
        let mut torn = intact.clone();
        torn.extend_from_slice(br#"{"stream_id":"s1","sequence":2,"payl"#);
        std::fs::write(&path, &torn).unwrap();

        let store = FileChunkStore::open(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), intact);
        assert_eq!(store.last_sequence("s1").await.unwrap(), Some(1));

        store.append("s1", 2, Payload::fragment("c")).await.unwrap();
        drop(store);

        let store = FileChunkStore::open(&path).await.unwrap();
        let contents: Vec<_> = store
            .read_after("s1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.payload.content)
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn corruption_before_the_tail_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        {
            let store = FileChunkStore::open(&path).await.unwrap();
            store.append("s1", 0, Payload::fragment("a")).await.unwrap();
        }
        let mut bytes = b"not json\n".to_vec();
        bytes.extend(std::fs::read(&path).unwrap());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            FileChunkStore::open(&path).await,
            Err(Error::Corrupted { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn gap_in_log_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let records = [
            Chunk::new("s2", 0, Payload::fragment("a")),
            Chunk::new("s2", 2, Payload::fragment("c")),
        ];
        let mut bytes = Vec::new();
        for record in &records {
            bytes.extend(serde_json::to_vec(record).unwrap());
            bytes.push(b'\n');
        }
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            FileChunkStore::open(&path).await,
            Err(Error::Corrupted { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.jsonl");
        let store = FileChunkStore::open(&path).await.unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn new_log_is_synced_into_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        sync_parent_dir(&path).await.unwrap();
        sync_parent_dir(Path::new("relative.jsonl")).await.unwrap();

        let store = FileChunkStore::open(&path).await.unwrap();
        store.append("s1", 0, Payload::fragment("a")).await.unwrap();
        drop(store);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("stream_data.jsonl")]);
    }

    #[tokio::test]
    async fn poisoned_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let store = FileChunkStore::open(&path).await.unwrap();
        store.append("s1", 0, Payload::fragment("a")).await.unwrap();

        store.writer.lock().await.poisoned = true;
        assert!(matches!(
            store.append("s1", 1, Payload::fragment("b")).await,
            Err(Error::Io(_))
        ));
        assert_eq!(store.last_sequence("s1").await.unwrap(), Some(0));
        drop(store);

        // Reopening recovers from the log and accepts appends again.
        let store = FileChunkStore::open(&path).await.unwrap();
        store.append("s1", 1, Payload::fragment("b")).await.unwrap();
    }
}
