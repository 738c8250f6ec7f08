use crate::Chunk;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Notify, broadcast};

/// Reason recorded for a run that was dropped without reporting an outcome.
pub(crate) const RUN_ENDED_EARLY: &str = "producer run ended before completing the stream";

/// What an active run tells the subscribers attached to it.
#[derive(Debug, Clone)]
pub(crate) enum RunEvent {
    /// A chunk was persisted. Published only after the store acknowledged it.
    Chunk(Chunk),
    /// The producer failed before its end-of-sequence. No terminal chunk was
    /// written.
    Failed { reason: String },
    /// The run lost a write conflict and stopped. Some other writer owns the
    /// stream now.
    Abandoned,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Failed { reason: String },
    Abandoned,
}

/// Tracks which streams currently have a producer run.
///
/// At most one run per stream id is registered at any time. The check for an
/// existing run and the registration of a new one happen under one lock, so
/// concurrent subscribers to a cold stream elect exactly one of them to start
/// the producer.
///
/// The registry also remembers the last failed or abandoned run of each
/// stream, so a subscriber that missed the run's final event can still learn
/// how it ended.
#[derive(Debug, Clone)]
pub(crate) struct RunRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    runs: Mutex<Runs>,
    next_run_id: AtomicU64,
    capacity: usize,
    idle: Notify,
}

#[derive(Debug, Default)]
struct Runs {
    active: HashMap<String, RunSlot>,
    ended: HashMap<String, EndedRun>,
}

#[derive(Debug)]
struct RunSlot {
    run_id: u64,
    events: broadcast::Sender<RunEvent>,
}

#[derive(Debug)]
struct EndedRun {
    run_id: u64,
    outcome: RunOutcome,
}

/// Result of [`RunRegistry::attach_or_claim`] and [`RunRegistry::attach`].
#[derive(Debug)]
pub(crate) enum Attachment {
    /// The run is active. The receiver sees its events from now on.
    Live {
        run_id: u64,
        events: broadcast::Receiver<RunEvent>,
    },
    /// No run existed and the caller now owns the slot. It must start the
    /// producer and keep `claim` alive for the duration of the run.
    Claimed {
        events: broadcast::Receiver<RunEvent>,
        claim: RunClaim,
    },
    /// The run the caller followed is gone. Carries its outcome if the
    /// registry still has it.
    Ended(Option<RunOutcome>),
}

/// Ownership of a stream's run slot. Dropping it deregisters the run.
#[derive(Debug)]
pub(crate) struct RunClaim {
    registry: RunRegistry,
    stream_id: String,
    run_id: u64,
    events: broadcast::Sender<RunEvent>,
    outcome: Option<RunOutcome>,
}

impl Runs {
    /// Looks up the run a subscriber should follow.
    ///
    /// With `previous` set, only that run qualifies; any other state means
    /// it has ended.
    fn follow(&self, stream_id: &str, previous: Option<u64>) -> Option<Attachment> {
        let slot = self.active.get(stream_id);
        match (slot, previous) {
            (Some(slot), Some(run_id)) if slot.run_id != run_id => {
                Some(Attachment::Ended(self.outcome(stream_id, run_id)))
            }
            (Some(slot), _) => Some(Attachment::Live {
                run_id: slot.run_id,
                events: slot.events.subscribe(),
            }),
            (None, Some(run_id)) => Some(Attachment::Ended(self.outcome(stream_id, run_id))),
            (None, None) => None,
        }
    }

    fn outcome(&self, stream_id: &str, run_id: u64) -> Option<RunOutcome> {
        self.ended
            .get(stream_id)
            .filter(|ended| ended.run_id == run_id)
            .map(|ended| ended.outcome.clone())
    }
}

impl RunRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runs: Mutex::new(Runs::default()),
                next_run_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribes to the run for `stream_id`, registering a new one if none
    /// is active.
    ///
    /// `previous` is the run the caller was following before, if any. Once
    /// that run is gone the caller gets [`Attachment::Ended`] and never
    /// claims a new run.
    pub(crate) fn attach_or_claim(&self, stream_id: &str, previous: Option<u64>) -> Attachment {
        let mut runs = self.inner.runs.lock();
        if let Some(attachment) = runs.follow(stream_id, previous) {
            return attachment;
        }

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(self.inner.capacity);
        runs.active.insert(
            stream_id.to_string(),
            RunSlot {
                run_id,
                events: tx.clone(),
            },
        );

        Attachment::Claimed {
            events: rx,
            claim: RunClaim {
                registry: self.clone(),
                stream_id: stream_id.to_string(),
                run_id,
                events: tx,
                outcome: None,
            },
        }
    }

    /// Like [`Self::attach_or_claim`] but never starts a run. Returns `None`
    /// if there is nothing to follow.
    pub(crate) fn attach(&self, stream_id: &str, previous: Option<u64>) -> Option<Attachment> {
        self.inner.runs.lock().follow(stream_id, previous)
    }

    pub(crate) fn is_live(&self, stream_id: &str) -> bool {
        self.inner.runs.lock().active.contains_key(stream_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.runs.lock().active.len()
    }

    /// Resolves once no run is registered.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, stream_id: &str, run_id: u64, outcome: RunOutcome) {
        let mut runs = self.inner.runs.lock();
        if runs
            .active
            .get(stream_id)
            .is_some_and(|slot| slot.run_id == run_id)
        {
            runs.active.remove(stream_id);
        }
        match outcome {
            RunOutcome::Completed => {
                runs.ended.remove(stream_id);
            }
            outcome => {
                runs.ended
                    .insert(stream_id.to_string(), EndedRun { run_id, outcome });
            }
        }
        if runs.active.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl RunClaim {
    pub(crate) fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub(crate) const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Fans an event out to every attached subscriber.
    pub(crate) fn publish(&self, event: RunEvent) {
        // No receivers is fine: subscribers come and go independently of the
        // run.
        let _ = self.events.send(event);
    }

    /// Records how the run ended, tells attached subscribers, and releases
    /// the slot.
    pub(crate) fn finish(mut self, outcome: RunOutcome) {
        match &outcome {
            RunOutcome::Completed => {}
            RunOutcome::Failed { reason } => self.publish(RunEvent::Failed {
                reason: reason.clone(),
            }),
            RunOutcome::Abandoned => self.publish(RunEvent::Abandoned),
        }
        self.outcome = Some(outcome);
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| RunOutcome::Failed {
            reason: RUN_ENDED_EARLY.to_string(),
        });
        tracing::trace!(stream_id = %self.stream_id, run_id = self.run_id, ?outcome, "Run released");
        self.registry.release(&self.stream_id, self.run_id, outcome);
    }
}
