//! Per-connection state for the broadcast server (spec §3 "active
//! broadcast connection record", §4.6): subscriptions, a bounded
//! drop-oldest outbox, and a token-bucket rate limiter.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

const OUTBOX_CAPACITY: usize = 1024;

/// Token-bucket limiter for `maxMessagesPerMinute` (spec §4.6).
pub struct RateLimiter {
    capacity: f64,
    refill_per_ms: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        let capacity = max_per_minute as f64;
        Self { capacity, refill_per_ms: capacity / 60_000.0, state: Mutex::new((capacity, Instant::now())) }
    }

    /// Attempts to consume one token; `false` means the caller should
    /// be rate-limited this tick.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        let (tokens, last) = *state;
        let elapsed_ms = last.elapsed().as_secs_f64() * 1000.0;
        let replenished = (tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        if replenished >= 1.0 {
            *state = (replenished - 1.0, Instant::now());
            true
        } else {
            *state = (replenished, Instant::now());
            false
        }
    }
}

/// Bounded outbound message queue that drops the oldest entry rather
/// than blocking the fan-out loop when a slow consumer falls behind
/// (spec §4.6 "send queue ... drop-oldest").
pub struct Outbox {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Default for Outbox {
    fn default() -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(OUTBOX_CAPACITY)), notify: Notify::new() }
    }
}

impl Outbox {
    /// Pushes `message`, returning `true` if the oldest queued message
    /// was dropped to make room.
    pub fn push(&self, message: String) -> bool {
        let mut queue = self.queue.lock();
        let dropped = if queue.len() >= OUTBOX_CAPACITY {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    pub async fn recv(&self) -> String {
        loop {
            if let Some(message) = self.queue.lock().pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Topic-subscription set plus activity bookkeeping for one connection.
pub struct ConnectionRecord {
    pub id: Uuid,
    pub outbox: Outbox,
    pub rate_limiter: RateLimiter,
    subscriptions: Mutex<HashSet<String>>,
    last_activity: Mutex<Instant>,
    consecutive_rate_violations: AtomicU32,
    close_reason: Mutex<Option<String>>,
    close_notify: Notify,
}

impl ConnectionRecord {
    pub fn new(max_messages_per_minute: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox: Outbox::default(),
            rate_limiter: RateLimiter::new(max_messages_per_minute),
            subscriptions: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            consecutive_rate_violations: AtomicU32::new(0),
            close_reason: Mutex::new(None),
            close_notify: Notify::new(),
        }
    }

    /// Records one inbound rate-limit violation and returns the new
    /// streak length, so the caller can decide whether this offender has
    /// crossed the close threshold (spec §4.6).
    pub fn record_rate_violation(&self) -> u32 {
        self.consecutive_rate_violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_rate_violations(&self) {
        self.consecutive_rate_violations.store(0, Ordering::Relaxed);
    }

    /// Asks the writer task to close the socket with `reason`, used for
    /// repeated rate-limit offenders (spec §4.6 "repeated offenders may
    /// be closed with a policy code"). Protocol-agnostic on purpose: the
    /// writer task decides the actual close code.
    pub fn request_close(&self, reason: impl Into<String>) {
        *self.close_reason.lock() = Some(reason.into());
        self.close_notify.notify_one();
    }

    /// Resolves once `request_close` has been called, yielding its reason.
    pub async fn closed(&self) -> String {
        self.close_notify.notified().await;
        self.close_reason.lock().take().unwrap_or_default()
    }

    pub fn subscribe(&self, topics: impl IntoIterator<Item = String>) {
        self.subscriptions.lock().extend(topics);
        self.touch();
    }

    pub fn unsubscribe(&self, topics: &[String]) {
        let mut subs = self.subscriptions.lock();
        for topic in topics {
            subs.remove(topic);
        }
        self.touch();
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}
