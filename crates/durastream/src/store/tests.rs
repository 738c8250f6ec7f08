use crate::{ChunkStore, Error, FileChunkStore, MemoryChunkStore, Payload};
use std::sync::Arc;
use tempfile::TempDir;

async fn seed<S: ChunkStore>(store: &S, stream_id: &str, words: &[&str]) {
    for (seq, word) in words.iter().enumerate() {
        store
            .append(stream_id, seq as u64, Payload::fragment(*word))
            .await
            .unwrap();
    }
}

async fn run_gap_rejection<S: ChunkStore>(store: S) {
    seed(&store, "s2", &["a", "b"]).await;

    assert!(matches!(
        store.append("s2", 3, Payload::fragment("d")).await,
        Err(Error::OutOfOrder {
            expected: 2,
            actual: 3,
            ..
        })
    ));
    let chunk = store.append("s2", 2, Payload::fragment("c")).await.unwrap();
    assert_eq!(chunk.sequence, 2);
    assert_eq!(chunk.stream_id, "s2");
}

async fn run_new_stream_must_start_at_zero<S: ChunkStore>(store: S) {
    assert!(matches!(
        store.append("fresh", 1, Payload::fragment("x")).await,
        Err(Error::OutOfOrder {
            expected: 0,
            actual: 1,
            ..
        })
    ));
    assert_eq!(store.last_sequence("fresh").await.unwrap(), None);
    store.append("fresh", 0, Payload::fragment("x")).await.unwrap();
    assert_eq!(store.last_sequence("fresh").await.unwrap(), Some(0));
}

async fn run_duplicate_rejection<S: ChunkStore>(store: S) {
    seed(&store, "s1", &["a", "b", "c"]).await;

    for seq in 0..3 {
        let err = store
            .append("s1", seq, Payload::fragment("again"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::DuplicateSequence { sequence, .. } if sequence == seq),
            "unexpected error for {seq}: {err}"
        );
        assert!(err.is_write_conflict());
    }
    assert_eq!(store.read_after("s1", None).await.unwrap().len(), 3);
}

async fn run_read_after_is_ordered_and_exclusive<S: ChunkStore>(store: S) {
    assert!(store.read_after("s1", None).await.unwrap().is_empty());

    seed(&store, "s1", &["a", "b", "c"]).await;
    seed(&store, "other", &["z"]).await;

    let seqs = |chunks: Vec<crate::Chunk>| chunks.iter().map(|c| c.sequence).collect::<Vec<_>>();
    assert_eq!(seqs(store.read_after("s1", None).await.unwrap()), vec![0, 1, 2]);
    assert_eq!(seqs(store.read_after("s1", Some(0)).await.unwrap()), vec![1, 2]);
    assert_eq!(seqs(store.read_after("s1", Some(1)).await.unwrap()), vec![2]);
    assert!(store.read_after("s1", Some(2)).await.unwrap().is_empty());
    assert!(store.read_after("s1", Some(99)).await.unwrap().is_empty());
    assert!(store.read_after("s1", Some(u64::MAX)).await.unwrap().is_empty());
    assert_eq!(seqs(store.read_after("other", None).await.unwrap()), vec![0]);
}

async fn run_completion_tracks_terminal_chunk<S: ChunkStore>(store: S) {
    assert!(!store.is_complete("s1").await.unwrap());
    seed(&store, "s1", &["a"]).await;
    assert!(!store.is_complete("s1").await.unwrap());

    store.append("s1", 1, Payload::terminal()).await.unwrap();
    assert!(store.is_complete("s1").await.unwrap());
    assert!(!store.is_complete("s2").await.unwrap());

    let last = store.read_after("s1", Some(0)).await.unwrap();
    assert_eq!(last.len(), 1);
    assert!(last[0].is_terminal());
}

async fn run_concurrent_writers_single_winner<S: ChunkStore>(store: S) {
    const WRITERS: usize = 16;

    let store = Arc::new(store);
    seed(store.as_ref(), "s1", &["a"]).await;

    let tasks: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .append("s1", 1, Payload::fragment(format!("writer-{writer}")))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(Error::DuplicateSequence { sequence: 1, .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.last_sequence("s1").await.unwrap(), Some(1));
}

async fn file_store() -> (FileChunkStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileChunkStore::open(dir.path().join("chunks.jsonl"))
        .await
        .unwrap();
    (store, dir)
}

#[tokio::test]
async fn memory_gap_rejection() {
    run_gap_rejection(MemoryChunkStore::new()).await;
}

#[tokio::test]
async fn file_gap_rejection() {
    let (store, _dir) = file_store().await;
    run_gap_rejection(store).await;
}

#[tokio::test]
async fn memory_new_stream_must_start_at_zero() {
    run_new_stream_must_start_at_zero(MemoryChunkStore::new()).await;
}

#[tokio::test]
async fn file_new_stream_must_start_at_zero() {
    let (store, _dir) = file_store().await;
    run_new_stream_must_start_at_zero(store).await;
}

#[tokio::test]
async fn memory_duplicate_rejection() {
    run_duplicate_rejection(MemoryChunkStore::new()).await;
}

#[tokio::test]
async fn file_duplicate_rejection() {
    let (store, _dir) = file_store().await;
    run_duplicate_rejection(store).await;
}

#[tokio::test]
async fn memory_read_after_is_ordered_and_exclusive() {
    run_read_after_is_ordered_and_exclusive(MemoryChunkStore::new()).await;
}

#[tokio::test]
async fn file_read_after_is_ordered_and_exclusive() {
    let (store, _dir) = file_store().await;
    run_read_after_is_ordered_and_exclusive(store).await;
}

#[tokio::test]
async fn memory_completion_tracks_terminal_chunk() {
    run_completion_tracks_terminal_chunk(MemoryChunkStore::new()).await;
}

#[tokio::test]
async fn file_completion_tracks_terminal_chunk() {
    let (store, _dir) = file_store().await;
    run_completion_tracks_terminal_chunk(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_writers_single_winner() {
    run_concurrent_writers_single_winner(MemoryChunkStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_concurrent_writers_single_winner() {
    let (store, _dir) = file_store().await;
    run_concurrent_writers_single_winner(store).await;
}
