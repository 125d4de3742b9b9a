//! Object pool for in-flight pending messages (spec §3 "In-flight
//! pending message"): reuses allocations across the publish/retry
//! cycle instead of allocating a fresh struct per attempt.

use std::time::Instant;

use parking_lot::Mutex;

use super::serializer::{Envelope, MessageHeader};

/// One message on its way through the durable publisher: its wire
/// envelope, how many attempts it has had, and when the first one
/// started (spec §4.4 "total retry deadline is measured from the
/// first attempt").
pub struct PendingMessage {
    pub envelope: Option<Envelope>,
    pub ordering_key: String,
    pub attempt: u32,
    pub first_attempt_at: Option<Instant>,
}

impl PendingMessage {
    fn reset(&mut self, envelope: Envelope, ordering_key: String) {
        self.envelope = Some(envelope);
        self.ordering_key = ordering_key;
        self.attempt = 0;
        self.first_attempt_at = None;
    }

    pub fn record_attempt(&mut self) {
        self.attempt += 1;
        self.first_attempt_at.get_or_insert_with(Instant::now);
    }

    pub fn elapsed_since_first_attempt(&self) -> std::time::Duration {
        self.first_attempt_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn header(&self) -> Option<&MessageHeader> {
        self.envelope.as_ref().map(|e| &e.header)
    }
}

/// A bounded free list of [`PendingMessage`] allocations.
pub struct PendingMessagePool {
    capacity: usize,
    free: Mutex<Vec<PendingMessage>>,
}

impl PendingMessagePool {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, free: Mutex::new(Vec::with_capacity(capacity)) }
    }

    pub fn acquire(&self, envelope: Envelope, ordering_key: impl Into<String>) -> PendingMessage {
        let ordering_key = ordering_key.into();
        if let Some(mut message) = self.free.lock().pop() {
            message.reset(envelope, ordering_key);
            return message;
        }
        PendingMessage { envelope: Some(envelope), ordering_key, attempt: 0, first_attempt_at: None }
    }

    pub fn release(&self, mut message: PendingMessage) {
        message.envelope = None;
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(message);
        }
    }

    pub fn len_free(&self) -> usize {
        self.free.lock().len()
    }
}
