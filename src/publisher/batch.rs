//! Per-topic batching for the durable publisher (spec §4.4): a batch
//! flushes when any of `maxMessages`, `maxBytes`, or `maxMilliseconds`
//! is crossed.

use std::time::{Duration, Instant};

use crate::config::PublisherBatchingConfig;

use super::pool::PendingMessage;

pub struct TopicBatch {
    pub topic: String,
    messages: Vec<PendingMessage>,
    bytes: usize,
    opened_at: Instant,
}

impl TopicBatch {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), messages: Vec::new(), bytes: 0, opened_at: Instant::now() }
    }

    pub fn push(&mut self, message: PendingMessage) {
        if self.messages.is_empty() {
            self.opened_at = Instant::now();
        }
        self.bytes += message.header().map(|h| h.original_size).unwrap_or(0);
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn should_flush(&self, config: &PublisherBatchingConfig) -> bool {
        !self.messages.is_empty()
            && (self.messages.len() >= config.max_messages
                || self.bytes >= config.max_bytes
                || self.opened_at.elapsed() >= config.max_milliseconds)
    }

    pub fn take(&mut self) -> Vec<PendingMessage> {
        self.bytes = 0;
        std::mem::take(&mut self.messages)
    }
}
