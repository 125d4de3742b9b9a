//! The capability interface C4 drives every output channel through
//! (design note §9: "polymorphism over channel kinds ... expressed as a
//! capability interface `{submit(batch), health(), describe()}`").

use async_trait::async_trait;

use crate::schema::CanonicalRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Durable,
    Broadcast,
    Cache,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelCapabilities {
    pub supports_batching: bool,
    pub supports_ordering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub id: String,
    pub kind: ChannelKind,
    pub capabilities: ChannelCapabilities,
}

/// Why a batch submission failed, coarse enough for C4's circuit breaker
/// to decide retry-vs-count without knowing the channel's own error
/// taxonomy (spec §4.3 "per-channel dead-end").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSubmitError {
    Transient(String),
    Permanent(String),
}

/// One output destination (durable publisher, broadcast server,
/// subscriber cache) as seen by C4. A record reaching a channel already
/// carries its routing decision (ordering key, topic); the channel only
/// needs to move bytes.
#[async_trait]
pub trait OutputChannel: Send + Sync {
    fn describe(&self) -> ChannelDescriptor;
    async fn submit(&self, batch: Vec<CanonicalRecord>) -> Result<(), ChannelSubmitError>;
    fn health(&self) -> ChannelHealth;
}
