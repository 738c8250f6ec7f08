//! The stream coordinator: one producer run per stream, any number of
//! resumable readers.
//!
//! A subscriber first replays the stream from the [`ChunkStore`], then
//! attaches to the stream's live run (starting one if the stream is cold and
//! incomplete), then forwards chunks as the run persists them. Chunks reach a
//! subscriber only after they are durable, so any frame a client has seen can
//! be replayed from its `eventId` after a reconnect.
//!
//! ## Runs
//!
//! Runs are owned by the coordinator, not by the subscriber that triggered
//! them. A client disconnecting never cancels a run; the remaining chunks are
//! persisted for the next reader. At most one run per stream is active, which
//! makes the coordinator the only writer the store sees for that stream.
//!
//! ## Failure
//!
//! - A producer error stops the run without writing a terminal chunk. Every
//!   attached subscriber ends with [`Error::ProducerFailure`]; the next
//!   subscription starts a fresh run that numbers its chunks after the last
//!   persisted one.
//! - A write conflict ([`Error::DuplicateSequence`], [`Error::OutOfOrder`])
//!   means some other writer owns the stream. The run stops and attached
//!   subscribers fall back to polling the store.
//! - A slow or gone client ends only its own subscription with
//!   [`Error::TransportFailure`].

mod registry;
mod run;
mod subscription;

use self::{
    registry::{Attachment, RunEvent, RunOutcome, RunRegistry},
    subscription::SubscriptionTask,
};
use crate::{
    ChunkStore, Error, GenerationRequest, ProducerFactory, Result, Subscription,
    transport::FrameSender, validate_stream_id,
};
use core::{future::Future, time::Duration};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tuning knobs for a [`StreamCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often a tailing subscriber re-reads the store.
    pub poll_interval: Duration,
    /// Frames buffered per subscription before sends start waiting.
    pub stream_buffer_size: usize,
    /// Events buffered per run before slow subscribers lag and resync.
    pub broadcast_capacity: usize,
    /// How long a send may wait for a client to drain its buffer.
    pub send_timeout: Duration,
    /// Upper bound on a subscription's lifetime. `None` is unbounded.
    pub max_subscription_lifetime: Option<Duration>,
    pub max_stream_id_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stream_buffer_size: 8,
            broadcast_capacity: 256,
            send_timeout: Duration::from_secs(30),
            max_subscription_lifetime: None,
            max_stream_id_len: 128,
        }
    }
}

/// A point-in-time view of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_id: String,
    pub last_sequence: Option<u64>,
    pub complete: bool,
    /// A producer run is currently active for the stream.
    pub live: bool,
}

/// Coordinates producer runs and subscriptions over a [`ChunkStore`].
///
/// Cheap to clone; clones share the store, the producer factory and the run
/// registry. Subscriptions and runs are spawned onto the current Tokio
/// runtime.
pub struct StreamCoordinator<S, F> {
    inner: Arc<Inner<S, F>>,
}

struct Inner<S, F> {
    store: S,
    factory: F,
    registry: RunRegistry,
    config: CoordinatorConfig,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    subscriptions: Arc<AtomicUsize>,
}

impl<S, F> Clone for StreamCoordinator<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ChunkStore, F: ProducerFactory> StreamCoordinator<S, F> {
    pub fn new(store: S, factory: F, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                registry: RunRegistry::new(config.broadcast_capacity),
                config,
                shutting_down: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                subscriptions: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Opens a subscription to `request.stream_id`.
    ///
    /// `cursor` is the sequence of the last chunk the client already has, or
    /// `None` to receive the stream from the start. The returned
    /// [`Subscription`] yields every chunk after the cursor exactly once and
    /// in order, ending with the terminal frame. If the stream is incomplete
    /// and no run is active, one is started with `request` as its input.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if [`Self::shutdown`] has been called.
    /// - [`Error::InvalidRequest`] if the stream id is not usable.
    ///
    /// Failures after the subscription is established arrive as the final
    /// `Err` item of the stream.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn subscribe(
        &self,
        request: GenerationRequest,
        cursor: Option<u64>,
    ) -> Result<Subscription> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        validate_stream_id(&request.stream_id, self.inner.config.max_stream_id_len)?;

        let config = &self.inner.config;
        let (tx, rx) = mpsc::channel(config.stream_buffer_size.max(1));
        let sink = FrameSender::new(tx, config.send_timeout);
        let stream_id = request.stream_id.clone();

        let guard = ActiveSubscription::new(Arc::clone(&self.inner.subscriptions));
        let lifetime = config.max_subscription_lifetime;
        let shutdown = self.inner.shutdown.clone();
        let task = SubscriptionTask::new(self.clone(), request, cursor, sink.clone());

        let fut = async move {
            let _guard = guard;
            let result = tokio::select! {
                () = shutdown.cancelled() => Err(Error::ServiceShutdown),
                result = with_lifetime(lifetime, task.run()) => result,
            };

            match result {
                Ok(()) => tracing::debug!("Subscription complete"),
                Err(e @ Error::TransportFailure { .. }) => {
                    tracing::debug!("Subscriber detached: {e}");
                }
                Err(e) => {
                    tracing::warn!("Subscription ended with error: {e}");
                    sink.fail(e).await;
                }
            }
        };
        let span = tracing::info_span!("subscription", stream_id = %stream_id, cursor = ?cursor);
        tokio::spawn(fut.instrument(span));

        Ok(Subscription::new(stream_id, rx))
    }

    /// Reports what the store and the registry know about `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an unusable stream id, or the
    /// store's error.
    pub async fn status(&self, stream_id: &str) -> Result<StreamStatus> {
        validate_stream_id(stream_id, self.inner.config.max_stream_id_len)?;
        let store = &self.inner.store;
        Ok(StreamStatus {
            stream_id: stream_id.to_string(),
            last_sequence: store.last_sequence(stream_id).await?,
            complete: store.is_complete(stream_id).await?,
            live: self.inner.registry.is_live(stream_id),
        })
    }

    /// Number of producer runs in flight.
    pub fn active_runs(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of subscriptions whose task is still running.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Gracefully shuts the coordinator down.
    ///
    /// - Refuses new subscriptions and new runs.
    /// - Waits up to `drain_timeout` for active runs to finish and for their
    ///   subscribers to flush the final frames.
    /// - Ends every remaining subscription with [`Error::ServiceShutdown`].
    ///
    /// Runs still going after the timeout are left to finish on their own;
    /// whatever they persist is picked up by readers after a restart.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        // === Phase 0: Stop accepting new work ===
        tracing::info!("Refusing new subscriptions");
        self.inner.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Let active runs and their subscribers finish ===
        tracing::info!(
            "Draining producer runs ({} active) and subscriptions ({} active)",
            self.active_runs(),
            self.active_subscriptions()
        );
        let drain_result = tokio::time::timeout(drain_timeout, async {
            self.inner.registry.wait_idle().await;
            while self.active_subscriptions() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("All runs and subscriptions drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} runs, {} subscriptions still active)",
                self.active_runs(),
                self.active_subscriptions()
            ),
        }

        // === Phase 2: End remaining subscriptions ===
        tracing::debug!(
            "Cancelling {} remaining subscriptions",
            self.active_subscriptions()
        );
        self.inner.shutdown.cancel();

        tracing::info!("Coordinator shutdown complete");
    }

    /// Attaches to the stream's live run, starting one if there is none.
    ///
    /// `previous` is the run the subscription followed before a resync. A
    /// subscription that has followed a run never starts another one; once
    /// that run is gone it gets [`Followed::Ended`].
    fn attach_or_start(
        &self,
        request: &GenerationRequest,
        previous: Option<u64>,
    ) -> Result<Followed> {
        let runs = &self.inner.registry;
        let attachment = if self.is_shutting_down() {
            runs.attach(&request.stream_id, previous)
                .ok_or(Error::ServiceShutdown)?
        } else {
            runs.attach_or_claim(&request.stream_id, previous)
        };

        match attachment {
            Attachment::Live { run_id, events } => Ok(Followed::Run { run_id, events }),
            Attachment::Ended(outcome) => Ok(Followed::Ended(outcome)),
            Attachment::Claimed { events, claim } => {
                let run_id = claim.run_id();
                tracing::debug!(run_id, "Starting producer run");
                let span = tracing::info_span!(
                    parent: None,
                    "producer_run",
                    stream_id = %request.stream_id,
                    run_id
                );
                tokio::spawn(
                    run::drive_run(Arc::clone(&self.inner), request.clone(), claim)
                        .instrument(span),
                );
                Ok(Followed::Run { run_id, events })
            }
        }
    }
}

/// The run a subscription follows, as seen from the subscription.
enum Followed {
    Run {
        run_id: u64,
        events: broadcast::Receiver<RunEvent>,
    },
    Ended(Option<RunOutcome>),
}

async fn with_lifetime(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<()>>,
) -> Result<()> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::SubscriptionTimeout(limit))?,
        None => fut.await,
    }
}

/// Counts a subscription task for as long as it is alive.
struct ActiveSubscription(Arc<AtomicUsize>);

impl ActiveSubscription {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
