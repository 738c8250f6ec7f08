use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque chunk content plus the end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub content: String,
    pub end: bool,
}

impl Payload {
    /// A regular fragment produced by a run.
    pub fn fragment(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            end: false,
        }
    }

    /// The synthetic terminal payload appended after the producer finishes.
    pub const fn terminal() -> Self {
        Self {
            content: String::new(),
            end: true,
        }
    }
}

/// One persisted, sequence-numbered fragment of a stream.
///
/// `sequence` is the only ordering key. `persisted_at_ms` is wall-clock
/// milliseconds since the Unix epoch and exists for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub stream_id: String,
    pub sequence: u64,
    pub payload: Payload,
    pub persisted_at_ms: u64,
}

impl Chunk {
    /// Builds a chunk stamped with the current wall-clock time.
    pub fn new(stream_id: impl Into<String>, sequence: u64, payload: Payload) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence,
            payload,
            persisted_at_ms: now_millis(),
        }
    }

    /// Returns `true` if this chunk carries the end-of-stream marker.
    pub const fn is_terminal(&self) -> bool {
        self.payload.end
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Checks that `stream_id` is usable as a log key and a URL path segment.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the identifier is empty, longer than
/// `max_len` bytes, or contains control characters or `/`.
pub fn validate_stream_id(stream_id: &str, max_len: usize) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::InvalidRequest {
            reason: "stream id must not be empty".to_string(),
        });
    }
    if stream_id.len() > max_len {
        return Err(Error::InvalidRequest {
            reason: format!(
                "stream id is {} bytes, maximum is {max_len}",
                stream_id.len()
            ),
        });
    }
    if stream_id.chars().any(|c| c.is_control() || c == '/') {
        return Err(Error::InvalidRequest {
            reason: "stream id contains a control character or '/'".to_string(),
        });
    }
    Ok(())
}
