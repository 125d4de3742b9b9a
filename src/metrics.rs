//! Per-component runtime counters.
//!
//! Generalizes the teacher's single global `RuntimeMetrics` singleton
//! into one atomics struct per component, each owned by the component
//! whose lifetime bounds it (design note §9: "every cache [and, by
//! extension, every metrics struct] is owned by the component whose
//! lifetime bounds it; the supervisor is the only root holder").
//!
//! These are read-only inputs to the externally-owned `/metrics` HTTP
//! exposition (spec §6); this crate never renders text itself.

use std::sync::atomic::{AtomicU64, Ordering};

/// C1/C2 upstream-connection counters.
#[derive(Default)]
pub struct UpstreamMetrics {
    pub frames_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub heartbeats_lost: AtomicU64,
    pub socket_errors: AtomicU64,
}

impl UpstreamMetrics {
    pub fn snapshot(&self) -> UpstreamMetricsSnapshot {
        UpstreamMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            heartbeats_lost: self.heartbeats_lost.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamMetricsSnapshot {
    pub frames_received: u64,
    pub reconnects: u64,
    pub heartbeats_lost: u64,
    pub socket_errors: u64,
}

/// C3 adapter-normalizer counters, one per error class named in spec §7.
#[derive(Default)]
pub struct AdapterMetrics {
    pub parsed_ok: AtomicU64,
    pub unknown_event: AtomicU64,
    pub missing_field: AtomicU64,
    pub malformed_numeric: AtomicU64,
    pub unassociated_frame: AtomicU64,
    pub malformed_frame: AtomicU64,
}

/// C4 data-flow manager counters.
#[derive(Default)]
pub struct DataFlowMetrics {
    pub enqueued: AtomicU64,
    pub backpressure_rejections: AtomicU64,
    pub delivered: AtomicU64,
    pub channel_unavailable_drops: AtomicU64,
    pub circuit_opens: AtomicU64,
    pub queue_depth: AtomicU64,
}

impl DataFlowMetrics {
    pub fn snapshot(&self) -> DataFlowMetricsSnapshot {
        DataFlowMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            channel_unavailable_drops: self.channel_unavailable_drops.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataFlowMetricsSnapshot {
    pub enqueued: u64,
    pub backpressure_rejections: u64,
    pub delivered: u64,
    pub channel_unavailable_drops: u64,
    pub circuit_opens: u64,
    pub queue_depth: u64,
}

/// C5 durable-publisher counters.
#[derive(Default)]
pub struct PublisherMetrics {
    pub published_ok: AtomicU64,
    pub published_failed: AtomicU64,
    pub retries: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub compressed_batches: AtomicU64,
}

/// C6 broadcast-server counters.
#[derive(Default)]
pub struct BroadcastMetrics {
    pub connections_active: AtomicU64,
    pub connections_refused: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub rate_limited: AtomicU64,
}

/// C7 subscriber-cache counters.
#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataflow_snapshot_reflects_increments() {
        let metrics = DataFlowMetrics::default();
        metrics.enqueued.fetch_add(3, Ordering::Relaxed);
        metrics.delivered.fetch_add(2, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.enqueued, 3);
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.backpressure_rejections, 0);
    }
}
