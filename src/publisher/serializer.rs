//! Topic router and message serializer (spec §4.5, explicitly scoped as
//! "C5 internals" — distinct from the channel-routing rules C4 owns in
//! [`crate::dataflow::routing`]). Decides the outbound topic name for a
//! record and builds the header-plus-payload wire envelope the durable
//! channel publishes.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataflow::routing::render_topic;
use crate::schema::{CanonicalRecord, RoutingKey};
use crate::util::{checksum_hex16, now_ms};

const SCHEMA_VERSION: u32 = 1;
const TOPIC_CACHE_CAPACITY: usize = 4096;

/// The header every published message carries (spec §4.5): identity,
/// timing, format/compression tags, and an integrity checksum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub id: Uuid,
    pub event_timestamp: i64,
    pub schema_version: u32,
    pub format: &'static str,
    pub compressed: Option<&'static str>,
    pub original_size: usize,
    pub checksum: String,
    pub exchange: String,
    pub symbol: String,
    pub data_type: String,
}

/// A fully-assembled outbound message: the topic to publish on, the
/// header, and the (possibly compressed) payload bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// Derives topic names for outbound records, independent of C4's
/// channel-routing rules. Caches by `(exchange, symbol, data-type)`
/// with bounded, FIFO-evicted capacity (spec §4.5 "a bounded cache
/// skips rule evaluation on hot paths").
pub struct TopicRouter {
    template: String,
    prefix: String,
    environment: String,
    cache: Mutex<IndexMap<RoutingKey, String>>,
}

impl TopicRouter {
    pub fn new(template: impl Into<String>, prefix: impl Into<String>, environment: impl Into<String>) -> Self {
        Self { template: template.into(), prefix: prefix.into(), environment: environment.into(), cache: Mutex::new(IndexMap::new()) }
    }

    pub fn topic_for(&self, record: &CanonicalRecord) -> String {
        let key = record.routing_key();
        if let Some(topic) = self.cache.lock().get(&key) {
            return topic.clone();
        }
        let topic = render_topic(&self.template, &self.prefix, &self.environment, record);
        let mut cache = self.cache.lock();
        if cache.len() >= TOPIC_CACHE_CAPACITY {
            cache.shift_remove_index(0);
        }
        cache.insert(key, topic.clone());
        topic
    }
}

/// Builds the header and JSON payload for one record. Compression is
/// applied by the caller (the channel owns the [`super::compression::Compressor`]
/// since its threshold decision needs the serialized size).
pub struct Serializer {
    router: TopicRouter,
}

impl Serializer {
    pub fn new(router: TopicRouter) -> Self {
        Self { router }
    }

    /// Serializes `record` to JSON and builds its (uncompressed) header.
    /// Compression, if any, is layered on by the publishing channel,
    /// which then overwrites `compressed`/`original_size` accordingly.
    pub fn encode(&self, record: &CanonicalRecord) -> Result<(String, MessageHeader, Vec<u8>), serde_json::Error> {
        let topic = self.router.topic_for(record);
        let payload = serde_json::to_vec(record)?;
        let header = MessageHeader {
            id: Uuid::new_v4(),
            event_timestamp: record.timestamp,
            schema_version: SCHEMA_VERSION,
            format: "json",
            compressed: None,
            original_size: payload.len(),
            checksum: checksum_hex16(&payload),
            exchange: record.exchange.clone(),
            symbol: record.symbol.clone(),
            data_type: record.data_type.as_tag(),
        };
        Ok((topic, header, payload))
    }

    /// A cache-dedup key stable across retries of the same logical
    /// message: same record content and minute bucket hash to the same
    /// digest (spec §3 "In-flight pending message" / §9 dedup note).
    pub fn dedup_key(&self, record: &CanonicalRecord, payload: &[u8]) -> String {
        let bucket = record.timestamp / 60_000;
        checksum_hex16(format!("{}|{}|{bucket}", checksum_hex16(payload), now_ms() / 60_000).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Payload, Side, TradeData};
    use rust_decimal::Decimal;

    fn sample_record(symbol: &str) -> CanonicalRecord {
        CanonicalRecord {
            exchange: "binance".into(),
            symbol: symbol.into(),
            data_type: DataType::Trade,
            timestamp: 1_699_000_000_000,
            received_at: 1_699_000_000_010,
            data: Payload::Trade(TradeData { id: "1".into(), price: Decimal::ONE, quantity: Decimal::ONE, side: Side::Buy }),
            skip_batching: false,
        }
    }

    #[test]
    fn topic_router_renders_and_caches_consistently() {
        let router = TopicRouter::new("{prefix}.{environment}.{exchange}.{type}.{symbol}", "md", "prod");
        let topic_a = router.topic_for(&sample_record("BTC/USDT"));
        let topic_b = router.topic_for(&sample_record("BTC/USDT"));
        assert_eq!(topic_a, topic_b);
        assert_eq!(topic_a, "md.prod.binance.trade.btc-usdt");
    }

    #[test]
    fn encode_produces_header_with_matching_checksum() {
        let serializer = Serializer::new(TopicRouter::new("{prefix}.{exchange}.{type}.{symbol}", "md", "prod"));
        let record = sample_record("ETH/USDT");
        let (topic, header, payload) = serializer.encode(&record).unwrap();
        assert_eq!(topic, "md.binance.trade.eth-usdt");
        assert_eq!(header.checksum, checksum_hex16(&payload));
        assert_eq!(header.original_size, payload.len());
        assert_eq!(header.compressed, None);
        assert_eq!(header.format, "json");
    }

    #[test]
    fn dedup_key_is_stable_for_identical_payload_within_the_same_minute() {
        let serializer = Serializer::new(TopicRouter::new("{exchange}", "md", "prod"));
        let record = sample_record("BTC/USDT");
        let payload = serde_json::to_vec(&record).unwrap();
        let a = serializer.dedup_key(&record, &payload);
        let b = serializer.dedup_key(&record, &payload);
        assert_eq!(a, b);
    }
}
