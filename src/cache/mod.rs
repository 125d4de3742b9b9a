//! C7: subscriber cache. Holds the most recent record per
//! `(exchange, symbol, data-type)` so a newly-subscribed reader can be
//! replayed up to a watermark before switching to the live stream
//! (spec §4.7, §9 "replay-before-live-with-watermark").

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::config::CacheConfig;
use crate::dataflow::{ChannelCapabilities, ChannelDescriptor, ChannelHealth, ChannelKind, ChannelSubmitError, OutputChannel};
use crate::metrics::CacheMetrics;
use crate::schema::{CanonicalRecord, RoutingKey};

struct Entry {
    record: CanonicalRecord,
    stored_at: Instant,
}

/// One replayed record plus the watermark (`receivedAt`) a live
/// subscriber should skip up to, so the replay-then-live handoff never
/// double-delivers (spec §9 Open Question resolution).
#[derive(Debug, Clone)]
pub struct ReplayedRecord {
    pub record: CanonicalRecord,
    pub watermark: i64,
}

pub struct SubscriberCache {
    max_size: usize,
    ttl: Duration,
    entries: RwLock<IndexMap<RoutingKey, Entry>>,
    metrics: Arc<CacheMetrics>,
}

impl SubscriberCache {
    pub fn new(config: CacheConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self { max_size: config.max_size, ttl: config.ttl, entries: RwLock::new(IndexMap::new()), metrics }
    }

    pub fn put(&self, record: CanonicalRecord) {
        let key = record.routing_key();
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some((_, _)) = entries.shift_remove_index(0) {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(key, Entry { record, stored_at: Instant::now() });
    }

    /// Returns the cached record for `key` if present and not expired.
    pub fn get(&self, key: &RoutingKey) -> Option<CanonicalRecord> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.record.clone())
    }

    /// Snapshots the cached record for every key a new subscriber asks
    /// for, each carrying the watermark the live stream should resume
    /// after.
    pub fn replay(&self, keys: &[RoutingKey]) -> Vec<ReplayedRecord> {
        keys.iter()
            .filter_map(|key| {
                let record = self.get(key)?;
                let watermark = record.received_at;
                Some(ReplayedRecord { record, watermark })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[async_trait]
impl OutputChannel for SubscriberCache {
    fn describe(&self) -> ChannelDescriptor {
        ChannelDescriptor { id: "cache".into(), kind: ChannelKind::Cache, capabilities: ChannelCapabilities { supports_batching: false, supports_ordering: false } }
    }

    async fn submit(&self, batch: Vec<CanonicalRecord>) -> Result<(), ChannelSubmitError> {
        for record in batch {
            self.put(record);
        }
        Ok(())
    }

    fn health(&self) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Payload, Side, TradeData};
    use rust_decimal::Decimal;

    fn record(symbol: &str, received_at: i64) -> CanonicalRecord {
        CanonicalRecord {
            exchange: "binance".into(),
            symbol: symbol.into(),
            data_type: DataType::Trade,
            timestamp: received_at - 5,
            received_at,
            data: Payload::Trade(TradeData { id: "1".into(), price: Decimal::ONE, quantity: Decimal::ONE, side: Side::Buy }),
            skip_batching: false,
        }
    }

    fn config(max_size: usize, ttl_ms: u64) -> CacheConfig {
        CacheConfig { max_size, ttl: Duration::from_millis(ttl_ms) }
    }

    #[test]
    fn put_then_get_returns_the_latest_record() {
        let cache = SubscriberCache::new(config(10, 60_000), Arc::new(CacheMetrics::default()));
        let r = record("BTC/USDT", 100);
        let key = r.routing_key();
        cache.put(r.clone());
        assert_eq!(cache.get(&key), Some(r));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = SubscriberCache::new(config(10, 5), Arc::new(CacheMetrics::default()));
        let r = record("BTC/USDT", 100);
        let key = r.routing_key();
        cache.put(r);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn eviction_is_fifo_once_at_capacity() {
        let cache = SubscriberCache::new(config(2, 60_000), Arc::new(CacheMetrics::default()));
        cache.put(record("A/USDT", 1));
        cache.put(record("B/USDT", 2));
        cache.put(record("C/USDT", 3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&record("A/USDT", 1).routing_key()), None);
        assert!(cache.get(&record("C/USDT", 3).routing_key()).is_some());
    }

    #[test]
    fn replay_returns_watermark_equal_to_received_at() {
        let cache = SubscriberCache::new(config(10, 60_000), Arc::new(CacheMetrics::default()));
        let r = record("BTC/USDT", 555);
        cache.put(r.clone());
        let replayed = cache.replay(&[r.routing_key()]);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].watermark, 555);
    }

    #[test]
    fn replay_skips_keys_with_no_cached_record() {
        let cache = SubscriberCache::new(config(10, 60_000), Arc::new(CacheMetrics::default()));
        let missing_key = record("ZZZ/USDT", 1).routing_key();
        assert!(cache.replay(&[missing_key]).is_empty());
    }
}
