//! Error taxonomy (spec §7).
//!
//! Each class below is a `thiserror` enum matched by its owning
//! component to decide retry/count/fatal handling; `anyhow` is used
//! only at the process boundary (see `main.rs`), in the style of
//! `barter-integration`'s typed-error-under-`anyhow` split.

use thiserror::Error;

/// Transport-layer failures owned by C1. All are recovered locally by
/// reconnect with backoff; none propagate past the upstream connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("socket error: {0}")]
    SocketError(String),
    #[error("abnormal close: code={code:?} reason={reason}")]
    AbnormalClose { code: Option<u16>, reason: String },
    #[error("heartbeat lost")]
    HeartbeatLost,
}

/// Protocol-layer decode failures owned by C3. Counted per class,
/// never fatal to the socket (spec §4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("malformed numeric field '{field}': {value}")]
    MalformedNumeric { field: String, value: String },
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("frame not associated with a known stream key")]
    UnassociatedFrame,
}

/// Pipeline-layer failures owned by C4. Surfaced to callers; upstream
/// must pause or buffer (spec §4.3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("backpressure: queue at capacity")]
    Backpressure,
    #[error("pipeline is not started")]
    PipelineStopped,
    #[error("circuit open for channel {0}")]
    CircuitOpen(String),
}

/// Durable-publisher failures owned by C5 (spec §7). Transient classes
/// enter retry; permanent classes fail the message immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublisherError {
    #[error("batch failed transiently: {0}")]
    BatchFailedTransient(String),
    #[error("batch failed permanently: {0}")]
    BatchFailedPermanent(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("authentication failure: {0}")]
    Auth(String),
}

impl PublisherError {
    /// Whether C5's retry loop should re-attempt this class of failure
    /// (spec §4.4 "only the configured retryable error classes are retried").
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublisherError::BatchFailedTransient(_))
    }
}

/// Broadcast-server failures owned by C6. Connection-level; never
/// fatal to the process (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("connection refused: over maxConnections limit")]
    ConnectionRefusedOverLimit,
    #[error("rate limited")]
    RateLimited,
    #[error("send queue full")]
    SendQueueFull,
}

/// Lifecycle / programmer errors owned by C8.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("component not initialized")]
    NotInitialized,
    #[error("already started")]
    AlreadyStarted,
    #[error("shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_publisher_errors_are_retryable() {
        assert!(PublisherError::BatchFailedTransient("x".into()).is_retryable());
        assert!(!PublisherError::BatchFailedPermanent("x".into()).is_retryable());
        assert!(!PublisherError::TopicNotFound("t".into()).is_retryable());
        assert!(!PublisherError::QuotaExceeded.is_retryable());
        assert!(!PublisherError::Auth("bad key".into()).is_retryable());
    }
}
