//! Delivery primitives between the coordinator and a client connection.
//!
//! Each subscription owns a bounded channel. The coordinator writes
//! [`EventFrame`]s into it through a [`FrameSender`]; the connection side
//! drains it as a [`Subscription`] stream and serializes each frame onto the
//! wire. A slow reader fills the channel and makes sends time out; a gone
//! reader closes it. Both surface as [`Error::TransportFailure`] on that one
//! subscription and never reach the producer run.

use crate::{Chunk, Error, Result};
use core::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_stream::wrappers::ReceiverStream;

/// One framed event as delivered to a client.
///
/// Serialized with the keys `story`, `streamId`, `eventId` and `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub story: String,
    pub stream_id: String,
    pub event_id: u64,
    pub end: bool,
}

impl EventFrame {
    /// Encodes the frame as the JSON object carried in an SSE `data:` field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Chunk> for EventFrame {
    fn from(chunk: Chunk) -> Self {
        Self {
            story: chunk.payload.content,
            stream_id: chunk.stream_id,
            event_id: chunk.sequence,
            end: chunk.payload.end,
        }
    }
}

/// The coordinator's end of a subscription channel.
#[derive(Debug, Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::Sender<Result<EventFrame>>,
    send_timeout: Duration,
}

impl FrameSender {
    pub(crate) const fn new(tx: mpsc::Sender<Result<EventFrame>>, send_timeout: Duration) -> Self {
        Self { tx, send_timeout }
    }

    /// Pushes a frame, waiting at most `send_timeout` for channel capacity.
    pub(crate) async fn send(&self, frame: EventFrame) -> Result<()> {
        match self.tx.send_timeout(Ok(frame), self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::TransportFailure {
                context: format!(
                    "client did not drain frames within {:?}",
                    self.send_timeout
                ),
            }),
            Err(SendTimeoutError::Closed(_)) => Err(disconnected()),
        }
    }

    /// Best-effort delivery of a terminal error to the client.
    pub(crate) async fn fail(&self, err: Error) {
        if let Err(e) = self.tx.send_timeout(Err(err), self.send_timeout).await {
            tracing::debug!("Failed to forward subscription error: {e}");
        }
    }

    /// Resolves once the client side has gone away.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await;
    }
}

pub(crate) fn disconnected() -> Error {
    Error::TransportFailure {
        context: "client disconnected".to_string(),
    }
}

/// A client's attachment to a stream: catch-up frames, then live frames.
///
/// The stream ends after the terminal frame (`end = true`), or after a single
/// `Err` item if the subscription failed. Dropping it detaches the client;
/// the producer run, if any, keeps going.
#[derive(Debug)]
pub struct Subscription {
    stream_id: String,
    frames: ReceiverStream<Result<EventFrame>>,
}

impl Subscription {
    pub(crate) fn new(stream_id: String, rx: mpsc::Receiver<Result<EventFrame>>) -> Self {
        Self {
            stream_id,
            frames: ReceiverStream::new(rx),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

impl Stream for Subscription {
    type Item = Result<EventFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}
