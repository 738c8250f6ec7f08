use super::{
    Followed, StreamCoordinator,
    registry::{RUN_ENDED_EARLY, RunEvent, RunOutcome},
};
use crate::{
    Chunk, ChunkStore, Error, EventFrame, GenerationRequest, ProducerFactory, Result,
    transport::{FrameSender, disconnected},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::MissedTickBehavior,
};

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    New,
    /// Delivering persisted chunks from the store.
    Replaying,
    /// Attached to the stream's run and forwarding chunks as they persist.
    LiveTailing,
    /// The terminal chunk was delivered.
    Complete,
}

enum Delivery {
    Delivered,
    /// Already at or before the cursor.
    Skipped,
    /// Ahead of the cursor. The missing chunks have to come from the store.
    Gap,
}

enum Tail {
    Complete,
    Resync,
    Failed(String),
    Abandoned,
}

enum Step {
    Event(core::result::Result<RunEvent, RecvError>),
    Poll,
}

/// Per-client catch-up and live-tail loop.
///
/// The cursor is the sequence of the last chunk this client has received.
/// Every chunk is delivered at most once and in order: anything at or before
/// the cursor is dropped, anything past `cursor + 1` sends the task back to
/// the store to fill the gap.
pub(super) struct SubscriptionTask<S, F> {
    coordinator: StreamCoordinator<S, F>,
    request: GenerationRequest,
    cursor: Option<u64>,
    /// The run this subscription follows once it has attached to one.
    run_id: Option<u64>,
    sink: FrameSender,
    state: SubscriptionState,
}

impl<S: ChunkStore, F: ProducerFactory> SubscriptionTask<S, F> {
    pub(super) const fn new(
        coordinator: StreamCoordinator<S, F>,
        request: GenerationRequest,
        cursor: Option<u64>,
        sink: FrameSender,
    ) -> Self {
        Self {
            coordinator,
            request,
            cursor,
            run_id: None,
            sink,
            state: SubscriptionState::New,
        }
    }

    pub(super) async fn run(mut self) -> Result<()> {
        loop {
            self.transition(SubscriptionState::Replaying);
            if self.catch_up().await? {
                return Ok(());
            }

            // Attach before the second read: every chunk persisted after this
            // point is published to `events`, every chunk persisted before it
            // is in the store.
            let events = match self.coordinator.attach_or_start(&self.request, self.run_id)? {
                Followed::Run { run_id, events } => {
                    self.run_id = Some(run_id);
                    events
                }
                Followed::Ended(outcome) => return self.after_run_ended(outcome).await,
            };
            if self.catch_up().await? {
                return Ok(());
            }

            self.transition(SubscriptionState::LiveTailing);
            match self.tail(events).await? {
                Tail::Complete => return Ok(()),
                Tail::Resync => continue,
                Tail::Failed(reason) => return Err(Error::ProducerFailure { reason }),
                Tail::Abandoned => return self.poll_until_complete().await,
            }
        }
    }

    /// Finishes a subscription whose run ended while it was not listening.
    ///
    /// Whatever the run persisted is still delivered. If that does not
    /// complete the stream, the run's failure ends the subscription; another
    /// run is only started by a later subscription.
    async fn after_run_ended(&mut self, outcome: Option<RunOutcome>) -> Result<()> {
        if self.catch_up().await? {
            return Ok(());
        }
        match outcome {
            Some(RunOutcome::Abandoned) => self.poll_until_complete().await,
            Some(RunOutcome::Failed { reason }) => Err(Error::ProducerFailure { reason }),
            Some(RunOutcome::Completed) | None => Err(Error::ProducerFailure {
                reason: RUN_ENDED_EARLY.to_string(),
            }),
        }
    }

    fn transition(&mut self, next: SubscriptionState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, cursor = ?self.cursor, "Subscription state change");
            self.state = next;
        }
    }

    /// Delivers everything the store holds past the cursor. Returns `true`
    /// once the terminal chunk has been delivered or the cursor is already
    /// past it.
    async fn catch_up(&mut self) -> Result<bool> {
        let store = self.coordinator.store();
        let stream_id = self.request.stream_id.as_str();

        // Checked first: a stream that is complete now has its terminal chunk
        // in the read below.
        let complete = store.is_complete(stream_id).await?;
        let chunks = store.read_after(stream_id, self.cursor).await?;

        for chunk in chunks {
            self.deliver(chunk).await?;
        }
        if complete {
            self.transition(SubscriptionState::Complete);
        }
        Ok(self.state == SubscriptionState::Complete)
    }

    async fn deliver(&mut self, chunk: Chunk) -> Result<Delivery> {
        if self.cursor.is_some_and(|cursor| chunk.sequence <= cursor) {
            return Ok(Delivery::Skipped);
        }
        let expected = self.cursor.map_or(0, |cursor| cursor + 1);
        if chunk.sequence != expected {
            return Ok(Delivery::Gap);
        }

        let sequence = chunk.sequence;
        let terminal = chunk.is_terminal();
        self.sink.send(EventFrame::from(chunk)).await?;
        self.cursor = Some(sequence);
        if terminal {
            self.transition(SubscriptionState::Complete);
        }
        Ok(Delivery::Delivered)
    }

    /// Forwards run events until the stream completes or the task has to
    /// fall back to the store.
    async fn tail(&mut self, mut events: broadcast::Receiver<RunEvent>) -> Result<Tail> {
        let mut poll = tokio::time::interval(self.coordinator.config().poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();

        loop {
            let step = tokio::select! {
                () = self.sink.closed() => return Err(disconnected()),
                event = events.recv() => Step::Event(event),
                _ = poll.tick() => Step::Poll,
            };

            match step {
                Step::Event(Ok(RunEvent::Chunk(chunk))) => {
                    if let Delivery::Gap = self.deliver(chunk).await? {
                        return Ok(Tail::Resync);
                    }
                    if self.state == SubscriptionState::Complete {
                        return Ok(Tail::Complete);
                    }
                }
                Step::Event(Ok(RunEvent::Failed { reason })) => return Ok(Tail::Failed(reason)),
                Step::Event(Ok(RunEvent::Abandoned)) => return Ok(Tail::Abandoned),
                Step::Event(Err(RecvError::Lagged(missed))) => {
                    tracing::debug!(missed, "Subscriber lagged behind the run, resyncing from store");
                    return Ok(Tail::Resync);
                }
                // The run is gone. Its outcome is in the registry.
                Step::Event(Err(RecvError::Closed)) => return Ok(Tail::Resync),
                Step::Poll => {
                    if self.catch_up().await? {
                        return Ok(Tail::Complete);
                    }
                }
            }
        }
    }

    /// Follows a stream written by someone else, from the store alone.
    async fn poll_until_complete(&mut self) -> Result<()> {
        let mut poll = tokio::time::interval(self.coordinator.config().poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.sink.closed() => return Err(disconnected()),
                _ = poll.tick() => {}
            }
            if self.catch_up().await? {
                return Ok(());
            }
        }
    }
}
