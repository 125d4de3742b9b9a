//! C4: data-flow manager. Ingests canonical records, applies routing,
//! batches per channel, and exerts backpressure (spec §4.3).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::config::DataflowConfig;
use crate::dataflow::breaker::CircuitBreaker;
use crate::dataflow::channel::{ChannelSubmitError, OutputChannel};
use crate::dataflow::routing::RoutingTable;
use crate::errors::PipelineError;
use crate::metrics::DataFlowMetrics;
use crate::schema::{CanonicalRecord, RoutingKey};

/// Picks the shard that owns `key`'s records. Every record for the same
/// `(exchange, symbol, data-type)` hashes to the same shard, so a single
/// worker drains them in the order they were enqueued (spec §4.3
/// "delivered to every channel in source order").
fn shard_for(key: &RoutingKey, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

struct ChannelBatch {
    records: Vec<CanonicalRecord>,
    oldest_buffered_at: Option<Instant>,
}

impl ChannelBatch {
    fn new() -> Self {
        Self { records: Vec::new(), oldest_buffered_at: None }
    }

    fn push(&mut self, record: CanonicalRecord) {
        if self.oldest_buffered_at.is_none() {
            self.oldest_buffered_at = Some(Instant::now());
        }
        self.records.push(record);
    }

    fn take(&mut self) -> Vec<CanonicalRecord> {
        self.oldest_buffered_at = None;
        std::mem::take(&mut self.records)
    }

    fn should_flush(&self, batch_size: usize, flush_timeout: Duration) -> bool {
        if self.records.is_empty() {
            return false;
        }
        self.records.len() >= batch_size || self.oldest_buffered_at.is_some_and(|t| t.elapsed() >= flush_timeout)
    }
}

struct ChannelEntry {
    channel: Arc<dyn OutputChannel>,
    breaker: Arc<CircuitBreaker>,
}

pub struct DataFlowManager {
    config: DataflowConfig,
    routing: Arc<RoutingTable>,
    channels: Arc<RwLock<HashMap<String, ChannelEntry>>>,
    batches: Arc<AsyncMutex<HashMap<String, ChannelBatch>>>,
    /// One ingress queue per shard, keyed by `shard_for(record.routing_key())`.
    /// Every worker owns exactly one shard's receiver for the manager's
    /// lifetime, so two workers never dequeue the same key (spec §4.3).
    shard_count: usize,
    ingress_txs: RwLock<Option<Vec<mpsc::Sender<(CanonicalRecord, String)>>>>,
    ingress_rxs: AsyncMutex<Option<Vec<mpsc::Receiver<(CanonicalRecord, String)>>>>,
    metrics: Arc<DataFlowMetrics>,
    started: std::sync::atomic::AtomicBool,
    shutdown: Arc<Notify>,
    worker_handles: AsyncMutex<Vec<JoinHandle<()>>>,
    flusher_handle: AsyncMutex<Option<JoinHandle<()>>>,
    soft_threshold_crossed: std::sync::atomic::AtomicBool,
}

impl DataFlowManager {
    pub fn new(config: DataflowConfig, routing: RoutingTable, metrics: Arc<DataFlowMetrics>) -> Self {
        let shard_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        // Each shard gets the full configured capacity rather than an even
        // split: admission is already bounded by `metrics.queue_depth`
        // against `max_queue_size` in `process`, so a narrower per-shard
        // bound would reject records a skewed key distribution happens to
        // route to a busy shard even though the pipeline overall has room.
        let per_shard_capacity = config.performance.max_queue_size.max(1);
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..shard_count).map(|_| mpsc::channel(per_shard_capacity)).unzip();
        Self {
            config,
            routing: Arc::new(routing),
            channels: Arc::new(RwLock::new(HashMap::new())),
            batches: Arc::new(AsyncMutex::new(HashMap::new())),
            shard_count,
            ingress_txs: RwLock::new(Some(txs)),
            ingress_rxs: AsyncMutex::new(Some(rxs)),
            metrics,
            started: std::sync::atomic::AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            worker_handles: AsyncMutex::new(Vec::new()),
            flusher_handle: AsyncMutex::new(None),
            soft_threshold_crossed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Idempotent by channel id (spec §4.3).
    pub fn register_channel(&self, channel: Arc<dyn OutputChannel>) {
        let id = channel.describe().id.clone();
        let mut channels = self.channels.write();
        channels.entry(id).or_insert_with(|| ChannelEntry {
            channel,
            breaker: Arc::new(CircuitBreaker::new(self.config.error_handling.circuit_breaker_threshold, BREAKER_COOLDOWN)),
        });
    }

    pub fn process(&self, record: CanonicalRecord, source_tag: impl Into<String>) -> Result<(), PipelineError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PipelineError::PipelineStopped);
        }
        let depth = self.metrics.queue_depth.load(Ordering::Relaxed) as usize;
        if depth >= self.config.performance.max_queue_size {
            self.metrics.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::Backpressure);
        }
        if self.config.performance.enable_backpressure && depth >= self.config.performance.backpressure_threshold {
            if !self.soft_threshold_crossed.swap(true, Ordering::Relaxed) {
                log::warn!("dataflow queue depth {depth} at or above soft backpressure threshold");
            }
        } else {
            self.soft_threshold_crossed.store(false, Ordering::Relaxed);
        }

        let shard = shard_for(&record.routing_key(), self.shard_count);
        let tx = self.ingress_txs.read().as_ref().map(|txs| txs[shard].clone());
        let Some(tx) = tx else { return Err(PipelineError::PipelineStopped) };
        match tx.try_send((record, source_tag.into())) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::PipelineStopped),
        }
    }

    /// Starts the worker pool draining the ingress queue plus a
    /// time-based flusher for buffers no new record arrives to tick
    /// (spec §5 "a batch flusher is one per channel").
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rxs = self.ingress_rxs.lock().await.take().expect("start called once");
        let mut handles = Vec::with_capacity(rxs.len());
        for rx in rxs {
            let manager = self.clone();
            handles.push(tokio::spawn(async move { manager.worker_loop(rx).await }));
        }
        *self.worker_handles.lock().await = handles;

        let manager = self.clone();
        *self.flusher_handle.lock().await = Some(tokio::spawn(async move { manager.flush_loop().await }));
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(CanonicalRecord, String)>) {
        while let Some((record, _source_tag)) = rx.recv().await {
            self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.route_and_buffer(record).await;
        }
    }

    async fn route_and_buffer(&self, record: CanonicalRecord) {
        let decision = self.routing.resolve(&record);
        let mut to_flush = Vec::new();
        {
            let mut batches = self.batches.lock().await;
            for target in &decision.targets {
                let buffer = batches.entry(target.channel_id.clone()).or_insert_with(ChannelBatch::new);
                buffer.push(record.clone());
                if buffer.should_flush(self.config.batching.batch_size, self.config.batching.flush_timeout) {
                    to_flush.push((target.channel_id.clone(), buffer.take()));
                }
            }
        }
        for (channel_id, batch) in to_flush {
            self.submit_to_channel(&channel_id, batch).await;
        }
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.batching.flush_timeout);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due: Vec<(String, Vec<CanonicalRecord>)> = {
                        let mut batches = self.batches.lock().await;
                        batches
                            .iter_mut()
                            .filter(|(_, b)| b.should_flush(self.config.batching.batch_size, self.config.batching.flush_timeout))
                            .map(|(id, b)| (id.clone(), b.take()))
                            .collect()
                    };
                    for (channel_id, batch) in due {
                        self.submit_to_channel(&channel_id, batch).await;
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    async fn submit_to_channel(&self, channel_id: &str, batch: Vec<CanonicalRecord>) {
        if batch.is_empty() {
            return;
        }
        let entry = { self.channels.read().get(channel_id).map(|e| (e.channel.clone(), e.breaker.clone())) };
        let Some((channel, breaker)) = entry else {
            self.metrics.channel_unavailable_drops.fetch_add(batch.len() as u64, Ordering::Relaxed);
            return;
        };
        if !breaker.allow() {
            self.metrics.channel_unavailable_drops.fetch_add(batch.len() as u64, Ordering::Relaxed);
            return;
        }
        let delivered = batch.len() as u64;
        match channel.submit(batch).await {
            Ok(()) => {
                breaker.record_success();
                self.metrics.delivered.fetch_add(delivered, Ordering::Relaxed);
            }
            Err(ChannelSubmitError::Transient(reason)) | Err(ChannelSubmitError::Permanent(reason)) => {
                log::warn!("channel {channel_id} rejected a batch of {delivered}: {reason}");
                if breaker.record_failure() {
                    self.metrics.circuit_opens.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics.channel_unavailable_drops.fetch_add(delivered, Ordering::Relaxed);
            }
        }
    }

    /// Stops workers, flushing pending batches within a bounded grace
    /// period before forcing drain (spec §4.3).
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.ingress_txs.write().take(); // close every shard: workers drain then exit
        self.shutdown.notify_waiters();

        for handle in self.worker_handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.flusher_handle.lock().await.take() {
            handle.abort();
        }

        let grace = self.config.performance.processing_timeout;
        let pending: Vec<(String, Vec<CanonicalRecord>)> = {
            let mut batches = self.batches.lock().await;
            batches.iter_mut().map(|(id, b)| (id.clone(), b.take())).collect()
        };
        for (channel_id, batch) in pending {
            if batch.is_empty() {
                continue;
            }
            let channel = self.channels.read().get(&channel_id).map(|e| e.channel.clone());
            if let Some(channel) = channel {
                let dropped = batch.len() as u64;
                match tokio::time::timeout(grace, channel.submit(batch)).await {
                    Ok(Ok(())) => self.metrics.delivered.fetch_add(dropped, Ordering::Relaxed),
                    _ => self.metrics.channel_unavailable_drops.fetch_add(dropped, Ordering::Relaxed),
                };
            }
        }
    }

    pub fn metrics(&self) -> Arc<DataFlowMetrics> {
        self.metrics.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
