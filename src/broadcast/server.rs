//! Broadcast WebSocket server (C6, spec §4.6): accepts reader
//! connections, matches outbound records against each connection's
//! subscriptions, and sweeps idle connections.
//!
//! The accept loop and socket I/O are thin glue around
//! [`ConnectionPool`], which carries all the logic that can be
//! exercised without a live socket.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use async_trait::async_trait;

use crate::config::BroadcastConfig;
use crate::dataflow::{ChannelCapabilities, ChannelDescriptor, ChannelHealth, ChannelKind, ChannelSubmitError, OutputChannel};
use crate::errors::BroadcastError;
use crate::metrics::BroadcastMetrics;
use crate::publisher::TopicRouter;
use crate::schema::CanonicalRecord;

use super::connection::ConnectionRecord;
use super::protocol::{parse_inbound, InboundMessage, OutboundMessage};

/// Consecutive inbound rate-limit violations before a connection is
/// closed outright (spec §4.6 "repeated offenders may be closed").
const MAX_CONSECUTIVE_RATE_VIOLATIONS: u32 = 5;

/// Tracks every live connection and decides admission, fan-out, and
/// idle eviction. Free of any socket I/O so it can be unit tested.
pub struct ConnectionPool {
    config: BroadcastConfig,
    connections: RwLock<HashMap<Uuid, Arc<ConnectionRecord>>>,
    metrics: Arc<BroadcastMetrics>,
}

impl ConnectionPool {
    pub fn new(config: BroadcastConfig, metrics: Arc<BroadcastMetrics>) -> Self {
        Self { config, connections: RwLock::new(HashMap::new()), metrics }
    }

    /// Admits a new connection unless `maxConnections` is already
    /// reached (spec §4.6 "connections beyond the limit are refused").
    pub fn try_register(&self) -> Result<Arc<ConnectionRecord>, BroadcastError> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            self.metrics.connections_refused.fetch_add(1, Ordering::Relaxed);
            return Err(BroadcastError::ConnectionRefusedOverLimit);
        }
        let record = Arc::new(ConnectionRecord::new(self.config.rate_limit.max_messages_per_minute));
        connections.insert(record.id, record.clone());
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    pub fn remove(&self, id: Uuid) {
        if self.connections.write().remove(&id).is_some() {
            self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Delivers `record` to every subscribed connection. `maxMessagesPerMinute`
    /// gates inbound control frames (see `handle_connection`), not this
    /// outbound fan-out — a slow reader's outbox just drops its oldest
    /// entry instead (spec §4.6).
    pub fn broadcast(&self, record: &CanonicalRecord, topic_router: &TopicRouter) {
        let topic = topic_router.topic_for(record);
        let message = OutboundMessage::Record { record }.to_json();
        for connection in self.connections.read().values() {
            if !connection.is_subscribed(&topic) {
                continue;
            }
            if connection.outbox.push(message.clone()) {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn note_rate_limited(&self) {
        self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the ids of connections idle longer than `idleTimeout`
    /// (spec §4.6 "a periodic sweep closes idle connections").
    pub fn sweep_idle(&self) -> Vec<Uuid> {
        self.connections
            .read()
            .values()
            .filter(|c| c.idle_for() >= self.config.idle_timeout)
            .map(|c| c.id)
            .collect()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }
}

/// Runs the accept loop until the process shuts down. Each accepted
/// connection gets a reader task (inbound control frames) and a writer
/// task (drains the outbox), mirroring the upstream connection's
/// split-task structure.
pub async fn serve(listener: TcpListener, pool: Arc<ConnectionPool>) -> anyhow::Result<()> {
    let sweep_pool = pool.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_pool.cleanup_interval());
        loop {
            ticker.tick().await;
            for id in sweep_pool.sweep_idle() {
                sweep_pool.remove(id);
            }
        }
    });

    loop {
        let (stream, _addr) = listener.accept().await?;
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, pool).await {
                log::debug!("broadcast connection ended: {error}");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, pool: Arc<ConnectionPool>) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let record = match pool.try_register() {
        Ok(record) => record,
        Err(_) => return Ok(()),
    };
    let (mut sink, mut source) = ws_stream.split();
    sink.send(Message::Text(OutboundMessage::Welcome { connection_id: record.id.to_string() }.to_json().into())).await.ok();

    let writer_record = record.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                message = writer_record.outbox.recv() => {
                    if sink.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                reason = writer_record.closed() => {
                    let frame = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
                    sink.send(Message::Close(Some(frame))).await.ok();
                    break;
                }
            }
        }
    });

    while let Some(frame) = source.next().await {
        let Ok(frame) = frame else { break };
        let Message::Text(text) = frame else { continue };
        record.touch();

        // maxMessagesPerMinute gates inbound control frames, not outbound
        // delivery (spec §4.6). Repeated offenders get disconnected.
        if !record.rate_limiter.try_consume() {
            pool.note_rate_limited();
            record.outbox.push(OutboundMessage::Error { message: "rate limit exceeded".into() }.to_json());
            if record.record_rate_violation() >= MAX_CONSECUTIVE_RATE_VIOLATIONS {
                record.request_close("too many rate limit violations");
                break;
            }
            continue;
        }
        record.reset_rate_violations();

        match parse_inbound(&text) {
            Ok(InboundMessage::Subscribe { topics }) => {
                record.subscribe(topics.clone());
                record.outbox.push(OutboundMessage::Status { subscribed: topics, unsubscribed: vec![] }.to_json());
            }
            Ok(InboundMessage::Unsubscribe { topics }) => {
                record.unsubscribe(&topics);
                record.outbox.push(OutboundMessage::Status { subscribed: vec![], unsubscribed: topics }.to_json());
            }
            Ok(InboundMessage::Ping) => {
                record.outbox.push(OutboundMessage::Pong.to_json());
            }
            Err(error) => {
                record.outbox.push(OutboundMessage::Error { message: error.to_string() }.to_json());
            }
        }
    }

    // Give a close requested mid-loop a moment to reach the writer task
    // before it's aborted; a normal socket-close exit skips straight past.
    if writer.is_finished() {
        writer.await.ok();
    } else {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.abort();
    }
    pool.remove(record.id);
    Ok(())
}

/// Adapts the live-reader fan-out to the [`OutputChannel`] interface
/// so the data-flow manager can route to it exactly like a durable
/// channel (spec §3 "Routing rule" targets channels uniformly).
pub struct BroadcastChannel {
    pool: Arc<ConnectionPool>,
    topic_router: TopicRouter,
}

impl BroadcastChannel {
    pub fn new(pool: Arc<ConnectionPool>, topic_router: TopicRouter) -> Self {
        Self { pool, topic_router }
    }
}

#[async_trait]
impl OutputChannel for BroadcastChannel {
    fn describe(&self) -> ChannelDescriptor {
        ChannelDescriptor { id: "broadcast".into(), kind: ChannelKind::Broadcast, capabilities: ChannelCapabilities { supports_batching: false, supports_ordering: false } }
    }

    async fn submit(&self, batch: Vec<CanonicalRecord>) -> Result<(), ChannelSubmitError> {
        for record in &batch {
            self.pool.broadcast(record, &self.topic_router);
        }
        Ok(())
    }

    fn health(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}
