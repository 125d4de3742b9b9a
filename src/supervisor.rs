//! C8: integration supervisor. Owns every upstream connection (C1/C2)
//! and the data-flow manager (C4), which in turn owns the durable
//! publisher (C5), broadcast server (C6), and subscriber cache (C7).
//! Drives the `initialize` / `start` / `stop` / `destroy` lifecycle
//! and aggregates a process-wide health report (spec §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastChannel, ConnectionPool};
use crate::cache::SubscriberCache;
use crate::config::Config;
use crate::dataflow::{DataFlowManager, RoutingConditions, RoutingRule, RoutingTable, RoutingTarget};
use crate::errors::LifecycleError;
use crate::exchanges::get_adapter;
use crate::metrics::{AdapterMetrics, BroadcastMetrics, CacheMetrics, DataFlowMetrics, PublisherMetrics, UpstreamMetrics, UpstreamMetricsSnapshot};
use crate::publisher::{RedisPublisher, TopicRouter};
use crate::schema::CanonicalRecord;
use crate::upstream::connection::{InboundFrame, ReconnectPolicy, TungsteniteSocketFactory};
use crate::upstream::{ConnectionState, UpstreamConnection};
use crate::util::now_ms;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_TOPIC_TEMPLATE: &str = "{prefix}.{environment}.{exchange}.{type}.{symbol}";
const DEFAULT_TOPIC_PREFIX: &str = "marketdata";
const ROUTING_CACHE_CAPACITY: usize = 4096;
/// A record older than this relative to now is considered stale for
/// health-reporting purposes (spec §4.8 "staleness window").
const STALENESS_WINDOW: Duration = Duration::from_secs(30);

pub struct ExchangeHandle {
    pub name: String,
    pub connection: Arc<UpstreamConnection>,
    pub metrics: Arc<UpstreamMetrics>,
}

/// One-shot snapshot of process health (spec §4.8), consumed by the
/// externally-owned `/health` and `/api/stats` admin endpoints.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub upstream: HashMap<String, ConnectionState>,
    pub queue_depth: u64,
    pub backpressure_rejections: u64,
    pub circuit_opens: u64,
    pub last_record_age: Option<Duration>,
    pub stale: bool,
}

pub struct Supervisor {
    config: Config,
    exchanges: Vec<ExchangeHandle>,
    dataflow: Arc<DataFlowManager>,
    broadcast_pool: Arc<ConnectionPool>,
    cache: Arc<SubscriberCache>,
    last_record_at: Arc<AtomicI64>,
    adapter_metrics: Arc<AdapterMetrics>,
    started: AtomicBool,
}

impl Supervisor {
    /// Validates `config`, wires every component, and resolves each
    /// enabled adapter — but opens no sockets yet (spec §4.8 "initialize
    /// builds the object graph; start opens connections").
    pub async fn initialize(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let dataflow_metrics = Arc::new(DataFlowMetrics::default());
        let publisher_metrics = Arc::new(PublisherMetrics::default());
        let broadcast_metrics = Arc::new(BroadcastMetrics::default());
        let cache_metrics = Arc::new(CacheMetrics::default());
        let adapter_metrics = Arc::new(AdapterMetrics::default());

        // A single catch-all rule fans every record out to all three
        // channels; per-channel filtering rules are an externally
        // configured extension point this object graph leaves room for
        // (spec §3 "Routing rule" is generic over conditions/targets).
        let fan_out_rule = RoutingRule {
            priority: 0,
            conditions: RoutingConditions::default(),
            targets: vec![
                RoutingTarget { channel_id: "durable".into(), topic_template: DEFAULT_TOPIC_TEMPLATE.into() },
                RoutingTarget { channel_id: "broadcast".into(), topic_template: DEFAULT_TOPIC_TEMPLATE.into() },
                RoutingTarget { channel_id: "cache".into(), topic_template: DEFAULT_TOPIC_TEMPLATE.into() },
            ],
            short_circuit: true,
        };
        let routing = RoutingTable::new(vec![fan_out_rule], "durable", DEFAULT_TOPIC_TEMPLATE, ROUTING_CACHE_CAPACITY);
        let dataflow = Arc::new(DataFlowManager::new(config.dataflow.clone(), routing, dataflow_metrics));

        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let redis_client = redis::Client::open(redis_url)?;
        let redis_conn = redis_client.get_connection_manager().await?;
        let durable = RedisPublisher::new("durable", redis_conn, config.publisher.clone(), &config.service, publisher_metrics);
        dataflow.register_channel(durable);

        let broadcast_pool = Arc::new(ConnectionPool::new(config.broadcast.clone(), broadcast_metrics));
        let broadcast_router = TopicRouter::new(DEFAULT_TOPIC_TEMPLATE, DEFAULT_TOPIC_PREFIX, config.service.environment.clone());
        dataflow.register_channel(Arc::new(BroadcastChannel::new(broadcast_pool.clone(), broadcast_router)));

        let cache = Arc::new(SubscriberCache::new(config.cache.clone(), cache_metrics));
        dataflow.register_channel(cache.clone());

        let last_record_at = Arc::new(AtomicI64::new(0));
        let mut exchanges = Vec::new();
        for adapter_cfg in config.adapters.iter().filter(|a| a.enabled) {
            let Some(adapter) = get_adapter(&adapter_cfg.name) else {
                log::warn!("no adapter registered for exchange '{}', skipping", adapter_cfg.name);
                continue;
            };

            let metrics = Arc::new(UpstreamMetrics::default());
            let (frame_tx, frame_rx) = mpsc::channel::<InboundFrame>(1024);
            let reconnect_policy = ReconnectPolicy {
                initial_delay: adapter_cfg.connection.retry_interval,
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                max_attempts: adapter_cfg.connection.max_retries,
            };
            let connection = Arc::new(UpstreamConnection::new(
                adapter_cfg.name.clone(),
                adapter_cfg.endpoints.ws.clone(),
                Arc::new(TungsteniteSocketFactory),
                true,
                reconnect_policy,
                adapter_cfg.connection.heartbeat_interval,
                adapter_cfg.connection.timeout,
                frame_tx,
                metrics.clone(),
            ));

            for key in adapter.stream_keys_for(&adapter_cfg.subscription) {
                connection.add_stream(key).await?;
            }

            spawn_normalizer(adapter.clone(), frame_rx, dataflow.clone(), adapter_metrics.clone(), last_record_at.clone());

            exchanges.push(ExchangeHandle { name: adapter_cfg.name.clone(), connection, metrics });
        }

        Ok(Self {
            config,
            exchanges,
            dataflow,
            broadcast_pool,
            cache,
            last_record_at,
            adapter_metrics,
            started: AtomicBool::new(false),
        })
    }

    /// Opens every upstream connection, starts the data-flow manager's
    /// workers, and begins accepting broadcast readers.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted.into());
        }

        self.dataflow.start().await;

        let listener = TcpListener::bind((self.config.service.host.as_str(), self.config.service.port)).await?;
        let pool = self.broadcast_pool.clone();
        tokio::spawn(async move {
            if let Err(error) = crate::broadcast::serve(listener, pool).await {
                log::error!("broadcast server exited: {error}");
            }
        });

        for exchange in &self.exchanges {
            if let Err(error) = exchange.connection.connect().await {
                log::error!("initial connect failed for {}: {error}", exchange.name);
            }
        }
        Ok(())
    }

    /// Graceful stop: closes every upstream connection and drains the
    /// data-flow manager's in-flight work.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(LifecycleError::NotInitialized);
        }
        for exchange in &self.exchanges {
            exchange.connection.disconnect().await;
        }
        self.dataflow.stop().await;
        Ok(())
    }

    pub fn health_report(&self) -> HealthReport {
        let upstream = self.exchanges.iter().map(|e| (e.name.clone(), e.connection.state())).collect();
        let snapshot = self.dataflow.metrics().snapshot();
        let last = self.last_record_at.load(Ordering::Relaxed);
        let last_record_age = if last == 0 { None } else { Some(Duration::from_millis((now_ms() - last).max(0) as u64)) };
        let stale = last_record_age.is_some_and(|age| age >= STALENESS_WINDOW);
        HealthReport {
            upstream,
            queue_depth: snapshot.queue_depth,
            backpressure_rejections: snapshot.backpressure_rejections,
            circuit_opens: snapshot.circuit_opens,
            last_record_age,
            stale,
        }
    }

    pub fn upstream_metrics(&self, exchange: &str) -> Option<UpstreamMetricsSnapshot> {
        self.exchanges.iter().find(|e| e.name == exchange).map(|e| e.metrics.snapshot())
    }

    pub fn cache(&self) -> &Arc<SubscriberCache> {
        &self.cache
    }
}

/// C3's runtime home: drains one exchange's decoded frames, parses
/// each with its adapter, and forwards canonical records into C4.
fn spawn_normalizer(
    adapter: Arc<dyn crate::exchanges::adapter::ExchangeAdapter>,
    mut frame_rx: mpsc::Receiver<InboundFrame>,
    dataflow: Arc<DataFlowManager>,
    metrics: Arc<AdapterMetrics>,
    last_record_at: Arc<AtomicI64>,
) {
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match adapter.parse_message(&frame.text) {
                crate::exchanges::adapter::ParseResult::Record(record) => {
                    metrics.parsed_ok.fetch_add(1, Ordering::Relaxed);
                    touch_last_record(&last_record_at, &record);
                    if let Err(error) = dataflow.process(record, adapter.name()) {
                        log::warn!("dataflow rejected record from {}: {error}", adapter.name());
                    }
                }
                crate::exchanges::adapter::ParseResult::Control => {}
                crate::exchanges::adapter::ParseResult::UnknownEvent(_) => {
                    metrics.unknown_event.fetch_add(1, Ordering::Relaxed);
                }
                crate::exchanges::adapter::ParseResult::UnassociatedFrame => {
                    metrics.unassociated_frame.fetch_add(1, Ordering::Relaxed);
                }
                crate::exchanges::adapter::ParseResult::Error(error) => {
                    count_protocol_error(&metrics, &error);
                }
            }
        }
    });
}

fn count_protocol_error(metrics: &Arc<AdapterMetrics>, error: &crate::errors::ProtocolError) {
    use crate::errors::ProtocolError;
    match error {
        ProtocolError::MalformedFrame(_) => metrics.malformed_frame.fetch_add(1, Ordering::Relaxed),
        ProtocolError::UnknownEvent(_) => metrics.unknown_event.fetch_add(1, Ordering::Relaxed),
        ProtocolError::MalformedNumeric { .. } => metrics.malformed_numeric.fetch_add(1, Ordering::Relaxed),
        ProtocolError::MissingField(_) => metrics.missing_field.fetch_add(1, Ordering::Relaxed),
        ProtocolError::UnassociatedFrame => metrics.unassociated_frame.fetch_add(1, Ordering::Relaxed),
    };
}

/// Marks that a record was just parsed, for `health_report`'s staleness
/// check. Uses wall-clock receive time rather than `record.received_at`
/// so a burst of replayed/backlogged records can't hide a stalled feed.
fn touch_last_record(last_record_at: &AtomicI64, _record: &CanonicalRecord) {
    last_record_at.store(now_ms(), Ordering::Relaxed);
}
