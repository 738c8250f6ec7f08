use super::{
    Inner,
    registry::{RunClaim, RunEvent, RunOutcome},
};
use crate::{ChunkStore, Error, GenerationRequest, Payload, ProducerFactory, Result};
use futures::StreamExt;
use std::sync::Arc;

/// Drives one producer run to completion.
///
/// Every fragment is appended to the store before it is published, so a
/// subscriber never sees a chunk that a later reader could not replay. The run
/// is owned by the registry claim, not by any subscriber, and keeps going
/// after every client has detached.
pub(super) async fn drive_run<S: ChunkStore, F: ProducerFactory>(
    inner: Arc<Inner<S, F>>,
    request: GenerationRequest,
    claim: RunClaim,
) {
    let stream_id = claim.stream_id().to_string();
    match produce(&inner, &request, &claim).await {
        Ok(Some(chunks)) => {
            tracing::info!(%stream_id, chunks, "Producer run complete");
            claim.finish(RunOutcome::Completed);
        }
        Ok(None) => {
            tracing::debug!(%stream_id, "Stream already complete, nothing to produce");
            claim.finish(RunOutcome::Completed);
        }
        Err(e) if e.is_write_conflict() => {
            tracing::warn!(%stream_id, "Producer run abandoned after write conflict: {e}");
            claim.finish(RunOutcome::Abandoned);
        }
        Err(e) => {
            tracing::error!(%stream_id, "Producer run failed: {e}");
            let reason = match e {
                Error::ProducerFailure { reason } => reason,
                other => other.to_string(),
            };
            claim.finish(RunOutcome::Failed { reason });
        }
    }
}

/// Appends fragments and then the terminal chunk. Returns the number of
/// chunks written, or `None` if the stream was already complete.
async fn produce<S: ChunkStore, F: ProducerFactory>(
    inner: &Inner<S, F>,
    request: &GenerationRequest,
    claim: &RunClaim,
) -> Result<Option<u64>> {
    let stream_id = claim.stream_id();
    if inner.store.is_complete(stream_id).await? {
        return Ok(None);
    }

    // A retried run numbers its fragments after whatever an earlier, failed
    // run left behind.
    let first = inner
        .store
        .last_sequence(stream_id)
        .await?
        .map_or(0, |last| last + 1);
    let mut next = first;

    let fragments = inner.factory.start(request);
    futures::pin_mut!(fragments);

    while let Some(fragment) = fragments.next().await {
        let content = fragment?;
        let chunk = inner
            .store
            .append(stream_id, next, Payload::fragment(content))
            .await?;
        tracing::trace!(%stream_id, sequence = next, "Fragment persisted");
        claim.publish(RunEvent::Chunk(chunk));
        next += 1;
    }

    let terminal = inner
        .store
        .append(stream_id, next, Payload::terminal())
        .await?;
    claim.publish(RunEvent::Chunk(terminal));

    Ok(Some(next + 1 - first))
}
