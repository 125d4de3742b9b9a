//! C1: owns one WebSocket to an exchange. Writes framed bytes up, emits
//! parsed frames down; heartbeats, reconnects with backoff (spec §4.1).

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::errors::TransportError;
use crate::metrics::UpstreamMetrics;
use crate::upstream::multiplexer::StreamMultiplexer;
use crate::util::now_ms;

pub type WsError = tokio_tungstenite::tungstenite::Error;
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// A single decoded text frame handed off to C3 for parsing.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub text: String,
}

/// Injectable transport so C1's reconnect logic is unit-testable without
/// a real network socket (design note §9).
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsSource), TransportError>;
}

/// Production factory backed by `tokio-tungstenite`.
pub struct TungsteniteSocketFactory;

#[async_trait]
impl SocketFactory for TungsteniteSocketFactory {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsSource), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
        let (sink, source) = stream.split();
        Ok((Box::pin(sink), Box::pin(source)))
    }
}

/// State machine in spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Exponential backoff with a cap and a bounded attempt count (spec §4.1).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Why a single connection task stopped running; decides whether the
/// supervising reconnect loop tries again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    ShutdownRequested,
    ReplacedByRebuild,
    Abnormal,
    Stale,
    DownstreamGone,
}

/// Owns a single live WebSocket plus its reconnect supervisor.
///
/// Multiple `add_stream`/`remove_stream` topology changes are folded
/// into the multiplexer; when `auto_manage` is set, a change triggers
/// `rebuild`, which opens the replacement socket before closing the
/// current one (spec §4.1).
pub struct UpstreamConnection {
    exchange: String,
    state: Arc<RwLock<ConnectionState>>,
    multiplexer: Arc<AsyncMutex<StreamMultiplexer>>,
    factory: Arc<dyn SocketFactory>,
    auto_manage: bool,
    reconnect_policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    frame_tx: mpsc::Sender<InboundFrame>,
    metrics: Arc<UpstreamMetrics>,
    /// Generation of the socket currently allowed to forward frames;
    /// bumped by `rebuild` so late frames on the outgoing socket are
    /// discarded rather than double-delivered (spec §4.1).
    active_generation: Arc<AtomicU64>,
    running: AsyncMutex<Option<RunningConnection>>,
}

struct RunningConnection {
    shutdown: Arc<Notify>,
    supervisor: JoinHandle<()>,
}

impl UpstreamConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: impl Into<String>,
        base_url: impl Into<String>,
        factory: Arc<dyn SocketFactory>,
        auto_manage: bool,
        reconnect_policy: ReconnectPolicy,
        heartbeat_interval: Duration,
        connection_timeout: Duration,
        frame_tx: mpsc::Sender<InboundFrame>,
        metrics: Arc<UpstreamMetrics>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            multiplexer: Arc::new(AsyncMutex::new(StreamMultiplexer::new(base_url))),
            factory,
            auto_manage,
            reconnect_policy,
            heartbeat_interval,
            connection_timeout,
            frame_tx,
            metrics,
            active_generation: Arc::new(AtomicU64::new(0)),
            running: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Opens the socket and starts the reconnect supervisor. Transitions
    /// CONNECTING -> CONNECTED on open, CONNECTING -> ERROR on a failure
    /// before open (spec §4.1).
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        let url = self.multiplexer.lock().await.current_url();
        let generation = self.active_generation.load(Ordering::SeqCst);

        let (sink, source) = match tokio::time::timeout(self.connection_timeout, self.factory.connect(&url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Error);
                return Err(TransportError::ConnectTimeout(self.connection_timeout));
            }
        };
        self.set_state(ConnectionState::Connected);

        let shutdown = Arc::new(Notify::new());
        let task = ConnectionTask {
            sink,
            source,
            generation,
            active_generation: self.active_generation.clone(),
            frame_tx: self.frame_tx.clone(),
            metrics: self.metrics.clone(),
            heartbeat_interval: self.heartbeat_interval,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(task.run());

        let supervisor = tokio::spawn(Self::supervise(
            self.state.clone(),
            self.multiplexer.clone(),
            self.factory.clone(),
            self.reconnect_policy.clone(),
            self.connection_timeout,
            self.heartbeat_interval,
            self.frame_tx.clone(),
            self.metrics.clone(),
            self.active_generation.clone(),
            handle,
        ));

        *self.running.lock().await = Some(RunningConnection { shutdown, supervisor });
        Ok(())
    }

    /// Graceful close; transitions to DISCONNECTED (spec §4.1).
    pub async fn disconnect(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.shutdown.notify_waiters();
            running.supervisor.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Mutates the active stream set; rebuilds the socket when
    /// `auto_manage` is enabled (spec §4.1).
    pub async fn add_stream(&self, key: impl Into<String>) -> Result<(), TransportError> {
        let key = key.into();
        let added = self.multiplexer.lock().await.add_stream(key);
        if added && self.auto_manage && self.state() == ConnectionState::Connected {
            self.rebuild().await?;
        }
        Ok(())
    }

    /// Mutates the active stream set; rebuilds the socket when
    /// `auto_manage` is enabled. A no-op on an unknown key (spec §4.1).
    pub async fn remove_stream(&self, key: &str) -> Result<(), TransportError> {
        let removed = self.multiplexer.lock().await.remove_stream(key);
        if removed && self.auto_manage && self.state() == ConnectionState::Connected {
            self.rebuild().await?;
        }
        Ok(())
    }

    /// Opens the replacement socket at the new URL and only *after* it
    /// is OPEN closes the current one (spec §4.1). Frames still arriving
    /// on the outgoing socket after this point are discarded via the
    /// generation counter rather than forwarded twice.
    async fn rebuild(&self) -> Result<(), TransportError> {
        let url = self.multiplexer.lock().await.current_url();
        let new_generation = self.active_generation.load(Ordering::SeqCst) + 1;

        let (sink, source) = match tokio::time::timeout(self.connection_timeout, self.factory.connect(&url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::ConnectTimeout(self.connection_timeout)),
        };

        let new_shutdown = Arc::new(Notify::new());
        let task = ConnectionTask {
            sink,
            source,
            generation: new_generation,
            active_generation: self.active_generation.clone(),
            frame_tx: self.frame_tx.clone(),
            metrics: self.metrics.clone(),
            heartbeat_interval: self.heartbeat_interval,
            shutdown: new_shutdown.clone(),
        };
        let handle = tokio::spawn(task.run());

        // Only now is the replacement socket OPEN: flip the generation so
        // the outgoing socket's read loop starts discarding frames, then
        // ask it to close.
        self.active_generation.store(new_generation, Ordering::SeqCst);
        if let Some(old) = self.running.lock().await.take() {
            old.shutdown.notify_waiters();
            old.supervisor.abort();
        }

        let supervisor = tokio::spawn(Self::supervise(
            self.state.clone(),
            self.multiplexer.clone(),
            self.factory.clone(),
            self.reconnect_policy.clone(),
            self.connection_timeout,
            self.heartbeat_interval,
            self.frame_tx.clone(),
            self.metrics.clone(),
            self.active_generation.clone(),
            handle,
        ));
        *self.running.lock().await = Some(RunningConnection { shutdown: new_shutdown, supervisor });
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        state: Arc<RwLock<ConnectionState>>,
        multiplexer: Arc<AsyncMutex<StreamMultiplexer>>,
        factory: Arc<dyn SocketFactory>,
        policy: ReconnectPolicy,
        connection_timeout: Duration,
        heartbeat_interval: Duration,
        frame_tx: mpsc::Sender<InboundFrame>,
        metrics: Arc<UpstreamMetrics>,
        active_generation: Arc<AtomicU64>,
        mut current_task: JoinHandle<DisconnectReason>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let reason = match current_task.await {
                Ok(reason) => reason,
                Err(_) => DisconnectReason::Abnormal,
            };

            match reason {
                DisconnectReason::ShutdownRequested | DisconnectReason::ReplacedByRebuild => return,
                DisconnectReason::DownstreamGone => {
                    *state.write() = ConnectionState::Error;
                    return;
                }
                DisconnectReason::Abnormal | DisconnectReason::Stale => {
                    metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }

            *state.write() = ConnectionState::Reconnecting;
            attempt += 1;
            if attempt > policy.max_attempts {
                *state.write() = ConnectionState::Error;
                log::error!("upstream reconnect attempts exhausted, staying in ERROR");
                return;
            }
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;

            let url = multiplexer.lock().await.current_url();
            let generation = active_generation.load(Ordering::SeqCst);
            let connected = tokio::time::timeout(connection_timeout, factory.connect(&url)).await;
            let (sink, source) = match connected {
                Ok(Ok(pair)) => pair,
                _ => continue,
            };

            *state.write() = ConnectionState::Connected;
            let shutdown = Arc::new(Notify::new());
            let task = ConnectionTask {
                sink,
                source,
                generation,
                active_generation: active_generation.clone(),
                frame_tx: frame_tx.clone(),
                metrics: metrics.clone(),
                heartbeat_interval,
                shutdown,
            };
            current_task = tokio::spawn(task.run());
            attempt = 0;
        }
    }
}

/// One running socket's read/write/heartbeat loop, mirroring the
/// teacher's `master_sender` writer-select pattern but split so Ping
/// replies go out through the same sink the read loop observed them on.
struct ConnectionTask {
    sink: WsSink,
    source: WsSource,
    generation: u64,
    active_generation: Arc<AtomicU64>,
    frame_tx: mpsc::Sender<InboundFrame>,
    metrics: Arc<UpstreamMetrics>,
    heartbeat_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ConnectionTask {
    async fn run(mut self) -> DisconnectReason {
        let last_frame_at = AtomicI64::new(now_ms());
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            if self.active_generation.load(Ordering::SeqCst) != self.generation {
                let _ = self.sink.send(Message::Close(None)).await;
                return DisconnectReason::ReplacedByRebuild;
            }

            tokio::select! {
                maybe_msg = self.source.next() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame_at.store(now_ms(), Ordering::Relaxed);
                            self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                            if self.active_generation.load(Ordering::SeqCst) != self.generation {
                                continue; // superseded mid-receive: discard per spec §4.1
                            }
                            if self.frame_tx.send(InboundFrame { text: text.to_string() }).await.is_err() {
                                return DisconnectReason::DownstreamGone;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_frame_at.store(now_ms(), Ordering::Relaxed);
                            let _ = self.sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_frame_at.store(now_ms(), Ordering::Relaxed);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return DisconnectReason::Abnormal;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) => {
                            self.metrics.socket_errors.fetch_add(1, Ordering::Relaxed);
                            return DisconnectReason::Abnormal;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let last = last_frame_at.load(Ordering::Relaxed);
                    let stale_after = 2 * self.heartbeat_interval.as_millis() as i64;
                    if now_ms() - last > stale_after {
                        self.metrics.heartbeats_lost.fetch_add(1, Ordering::Relaxed);
                        let _ = self.sink.send(Message::Close(None)).await;
                        return DisconnectReason::Stale;
                    }
                }
                _ = self.shutdown.notified() => {
                    let _ = self.sink.send(Message::Close(None)).await;
                    return DisconnectReason::ShutdownRequested;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::{Context, Poll};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    /// In-memory duplex socket for deterministic tests (no real network).
    struct FakeSink(mpsc::UnboundedSender<Message>);

    impl Sink<Message> for FakeSink {
        type Error = WsError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            let _ = self.0.send(item);
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FakeFactory {
        /// Queues of frames to emit for each successive `connect` call.
        scripts: TokioMutex<VecDeque<Result<Vec<Message>, TransportError>>>,
    }

    impl FakeFactory {
        fn new(scripts: Vec<Result<Vec<Message>, TransportError>>) -> Self {
            Self { scripts: TokioMutex::new(scripts.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl SocketFactory for FakeFactory {
        async fn connect(&self, _url: &str) -> Result<(WsSink, WsSource), TransportError> {
            let script = self.scripts.lock().await.pop_front().unwrap_or(Ok(vec![]));
            let frames = script?;
            let (tx, _rx) = mpsc::unbounded_channel();
            let sink: WsSink = Box::pin(FakeSink(tx));
            let source: WsSource = Box::pin(futures_util::stream::iter(frames.into_iter().map(Ok)).chain(
                futures_util::stream::pending(),
            ));
            Ok((sink, source))
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_connected_on_success() {
        let factory = Arc::new(FakeFactory::new(vec![Ok(vec![])]));
        let (tx, _rx) = mpsc::channel(16);
        let conn = UpstreamConnection::new(
            "binance",
            "wss://x",
            factory,
            false,
            ReconnectPolicy { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), multiplier: 2.0, max_attempts: 3 },
            Duration::from_secs(30),
            Duration::from_secs(1),
            tx,
            Arc::new(UpstreamMetrics::default()),
        );
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_transitions_to_error_on_pre_open_failure() {
        let factory = Arc::new(FakeFactory::new(vec![Err(TransportError::SocketError("refused".into()))]));
        let (tx, _rx) = mpsc::channel(16);
        let conn = UpstreamConnection::new(
            "binance",
            "wss://x",
            factory,
            false,
            ReconnectPolicy { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), multiplier: 2.0, max_attempts: 3 },
            Duration::from_secs(30),
            Duration::from_secs(1),
            tx,
            Arc::new(UpstreamMetrics::default()),
        );
        let err = conn.connect().await;
        assert!(err.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn valid_frames_are_delivered_and_invalid_ones_are_the_adapters_problem() {
        let factory = Arc::new(FakeFactory::new(vec![Ok(vec![
            Message::Text("frame-one".into()),
            Message::Text("frame-two".into()),
        ])]));
        let (tx, mut rx) = mpsc::channel(16);
        let conn = UpstreamConnection::new(
            "binance",
            "wss://x",
            factory,
            false,
            ReconnectPolicy { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), multiplier: 2.0, max_attempts: 3 },
            Duration::from_secs(30),
            Duration::from_secs(1),
            tx,
            Arc::new(UpstreamMetrics::default()),
        );
        conn.connect().await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.text, "frame-one");
        assert_eq!(second.text, "frame-two");
        conn.disconnect().await;
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = ReconnectPolicy { initial_delay: Duration::from_millis(100), max_delay: Duration::from_secs(5), multiplier: 2.0, max_attempts: 10 };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn add_stream_with_auto_manage_rebuilds_and_preserves_delivery() {
        let factory = Arc::new(FakeFactory::new(vec![
            Ok(vec![Message::Text("btc-frame".into())]),
            Ok(vec![Message::Text("eth-frame".into())]),
        ]));
        let (tx, mut rx) = mpsc::channel(16);
        let conn = UpstreamConnection::new(
            "binance",
            "wss://x",
            factory,
            true,
            ReconnectPolicy { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), multiplier: 2.0, max_attempts: 3 },
            Duration::from_secs(30),
            Duration::from_secs(1),
            tx,
            Arc::new(UpstreamMetrics::default()),
        );
        conn.add_stream("btcusdt@trade").await.unwrap();
        conn.connect().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "btc-frame");

        conn.add_stream("ethusdt@trade").await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.text, "eth-frame");
        conn.disconnect().await;
    }

    #[test]
    fn add_stream_idempotent_via_underlying_multiplexer() {
        // covered at the multiplexer unit level; re-asserted here at the
        // seam C1 delegates to, to document the contract it relies on.
        let mut mux = StreamMultiplexer::new("wss://x");
        assert!(mux.add_stream("btcusdt@trade"));
        assert!(!mux.add_stream("btcusdt@trade"));
    }
}
