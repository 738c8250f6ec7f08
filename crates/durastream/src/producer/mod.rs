//! The producer adapter: the external content generator, seen as an ordered
//! stream of fragments.
//!
//! A producer is deliberately *not* resumable. Every call to
//! [`ProducerFactory::start`] begins a fresh run at fragment 0, and a run that
//! fails mid-way cannot be continued. Making the overall stream resumable for
//! readers is the coordinator's job, built on the chunk store.

mod scripted;

pub use scripted::*;

use crate::Result;
use futures::Stream;
use std::collections::BTreeMap;

/// Generation parameters handed to a producer when a run starts.
///
/// `params` is opaque to the stream log. The HTTP front end fills it from the
/// subscribe request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationRequest {
    pub stream_id: String,
    pub params: BTreeMap<String, String>,
}

impl GenerationRequest {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Starts producer runs.
///
/// The returned stream is lazy and finite: it yields content fragments in
/// order and ends with `None` once the producer has nothing more to say. An
/// `Err` item ends the run as a failure; the coordinator stops reading after
/// it.
pub trait ProducerFactory: Send + Sync + 'static {
    type Fragments: Stream<Item = Result<String>> + Send + 'static;

    fn start(&self, request: &GenerationRequest) -> Self::Fragments;
}
