//! In-flight flow control for the durable publisher (spec §4.4,
//! §3 "In-flight pending message"): bounds outstanding message count
//! and bytes so one slow channel can't grow memory without limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::PublisherFlowControlConfig;

pub struct FlowControl {
    max_messages: usize,
    max_bytes: usize,
    allow_excess: bool,
    outstanding_messages: AtomicUsize,
    outstanding_bytes: AtomicUsize,
    notify: Notify,
}

/// Released automatically when a message finishes publishing (acked or
/// given up on). Holds an `Arc` rather than borrowing so it can outlive
/// the `reserve()` call and travel with a message sitting in a batch
/// across several publish attempts.
pub struct Reservation {
    flow_control: Arc<FlowControl>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.flow_control.outstanding_messages.fetch_sub(1, Ordering::AcqRel);
        self.flow_control.outstanding_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        self.flow_control.notify.notify_waiters();
    }
}

impl FlowControl {
    pub fn new(config: &PublisherFlowControlConfig) -> Self {
        Self {
            max_messages: config.max_outstanding_messages,
            max_bytes: config.max_outstanding_bytes,
            allow_excess: config.allow_excess_messages,
            outstanding_messages: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Reserves capacity for one in-flight message of `bytes` size.
    /// When the bound would be exceeded and `allowExcessMessages` is
    /// `false`, suspends the caller until another reservation is
    /// dropped and capacity frees, rather than failing the publish
    /// (spec §4.4 "new publishes block until capacity is available").
    pub async fn reserve(self: &Arc<Self>, bytes: usize) -> Reservation {
        loop {
            let notified = self.notify.notified();
            let messages = self.outstanding_messages.fetch_add(1, Ordering::AcqRel) + 1;
            let total_bytes = self.outstanding_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;

            let over_limit = messages > self.max_messages || total_bytes > self.max_bytes;
            if over_limit && !self.allow_excess {
                self.outstanding_messages.fetch_sub(1, Ordering::AcqRel);
                self.outstanding_bytes.fetch_sub(bytes, Ordering::AcqRel);
                notified.await;
                continue;
            }
            return Reservation { flow_control: self.clone(), bytes };
        }
    }

    pub fn outstanding_messages(&self) -> usize {
        self.outstanding_messages.load(Ordering::Acquire)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max_messages: usize, max_bytes: usize, allow_excess: bool) -> PublisherFlowControlConfig {
        PublisherFlowControlConfig { max_outstanding_messages: max_messages, max_outstanding_bytes: max_bytes, allow_excess_messages: allow_excess }
    }

    #[tokio::test]
    async fn reservation_within_bounds_succeeds_and_tracks_usage() {
        let flow = Arc::new(FlowControl::new(&config(10, 10_000, false)));
        let reservation = flow.reserve(100).await;
        assert_eq!(flow.outstanding_messages(), 1);
        assert_eq!(flow.outstanding_bytes(), 100);
        drop(reservation);
        assert_eq!(flow.outstanding_messages(), 0);
        assert_eq!(flow.outstanding_bytes(), 0);
    }

    #[tokio::test]
    async fn reservation_over_message_limit_blocks_until_the_first_is_dropped() {
        let flow = Arc::new(FlowControl::new(&config(1, 10_000, false)));
        let first = flow.reserve(10).await;
        assert_eq!(flow.outstanding_messages(), 1);

        let waiter = flow.clone();
        let pending = tokio::spawn(async move { waiter.reserve(10).await });
        // Give the spawned task a chance to run and block on `notified()`.
        tokio::task::yield_now().await;
        assert_eq!(flow.outstanding_messages(), 1); // still just the first reservation

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("reserve should unblock once capacity frees")
            .unwrap();
        assert_eq!(flow.outstanding_messages(), 1);
        drop(second);
        assert_eq!(flow.outstanding_messages(), 0);
    }

    #[tokio::test]
    async fn allow_excess_messages_lets_reservation_through_over_the_limit() {
        let flow = Arc::new(FlowControl::new(&config(1, 10_000, true)));
        let _first = flow.reserve(10).await;
        let second = flow.reserve(10).await;
        assert_eq!(flow.outstanding_messages(), 2);
        drop(second);
    }

    #[tokio::test]
    async fn byte_limit_is_enforced_independently_of_message_count() {
        let flow = Arc::new(FlowControl::new(&config(100, 50, false)));
        let waiter = flow.clone();
        let pending = tokio::spawn(async move { waiter.reserve(51).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished()); // over the byte limit, blocked with nothing to free it
        pending.abort();
    }
}
