//! Error types for the stream log.
//!
//! A single [`Error`] enum covers every failure the store, the coordinator
//! and the delivery side can surface. The variants fall into three groups:
//!
//! - Write-boundary violations: [`Error::DuplicateSequence`] and
//!   [`Error::OutOfOrder`]. These mean a coordinator bug or two writers for
//!   one stream and are never retried.
//! - Run and subscription outcomes: [`Error::ProducerFailure`],
//!   [`Error::TransportFailure`], [`Error::SubscriptionTimeout`],
//!   [`Error::ServiceShutdown`], [`Error::InvalidRequest`].
//! - Storage plumbing: [`Error::Corrupted`], [`Error::Io`], [`Error::Codec`].

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the stream log.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A chunk already exists at `(stream_id, sequence)`.
    #[error("Duplicate sequence {sequence} for stream `{stream_id}`")]
    DuplicateSequence { stream_id: String, sequence: u64 },

    /// The sequence is not the next one for the stream.
    #[error("Out of order append for stream `{stream_id}`: expected {expected}, got {actual}")]
    OutOfOrder {
        stream_id: String,
        expected: u64,
        actual: u64,
    },

    /// The producer raised before reaching end-of-sequence.
    #[error("Producer failed: {reason}")]
    ProducerFailure { reason: String },

    /// The client side of a subscription went away or stopped reading.
    #[error("Transport failure: {context}")]
    TransportFailure { context: String },

    /// The subscription outlived its configured maximum lifetime.
    #[error("Subscription exceeded its maximum lifetime of {0:?}")]
    SubscriptionTimeout(Duration),

    /// The request was malformed (bad stream identifier, bad cursor).
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The coordinator is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The persisted log could not be recovered.
    #[error("Corrupted log at line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for the errors raised at the store's write boundary.
    ///
    /// A producer run that hits one of these has lost the right to write and
    /// must stop appending.
    pub const fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateSequence { .. } | Self::OutOfOrder { .. }
        )
    }
}
