//! Canonical data model shared across the entire pipeline.
//!
//! Every exchange adapter (C3) normalizes into [`CanonicalRecord`]; every
//! output channel (C5/C6/C7) consumes [`CanonicalRecord`] and nothing else.
//! Numeric fields use [`rust_decimal::Decimal`] rather than `f64` so that
//! no precision is silently lost between the wire and the outbound topic
//! (spec §3 invariant).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported kline/candlestick intervals (spec §6: `kline_1m|5m|15m|1h|4h|1d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlineInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl KlineInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlineInterval::OneMinute => "1m",
            KlineInterval::FiveMinutes => "5m",
            KlineInterval::FifteenMinutes => "15m",
            KlineInterval::OneHour => "1h",
            KlineInterval::FourHours => "4h",
            KlineInterval::OneDay => "1d",
        }
    }

    /// Parses the exchange-native interval token (Binance uses the same tokens for `k.i`).
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "1m" => KlineInterval::OneMinute,
            "5m" => KlineInterval::FiveMinutes,
            "15m" => KlineInterval::FifteenMinutes,
            "1h" => KlineInterval::OneHour,
            "4h" => KlineInterval::FourHours,
            "1d" => KlineInterval::OneDay,
            _ => return None,
        })
    }
}

impl Serialize for KlineInterval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for KlineInterval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        KlineInterval::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown kline interval: {s}")))
    }
}

/// One of the canonical market-data kinds this system understands.
///
/// Serializes to the exact tag the wire contract names in spec §6
/// (`trade`, `ticker`, `kline_1m`, ..., `depth`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Trade,
    Ticker,
    Kline(KlineInterval),
    Depth,
}

impl DataType {
    /// Stable wire tag used in topic names, routing rules, and the JSON `type` field.
    pub fn as_tag(&self) -> String {
        match self {
            DataType::Trade => "trade".to_string(),
            DataType::Ticker => "ticker".to_string(),
            DataType::Kline(interval) => format!("kline_{}", interval.as_str()),
            DataType::Depth => "depth".to_string(),
        }
    }
}

/// Trade side, derived from the exchange's maker-flag (spec §4.2 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
}

/// 24h rolling ticker statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerData {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub change: Decimal,
    pub volume: Decimal,
    pub high: Decimal,
    pub low: Decimal,
}

/// One closed or in-progress candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineData {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_time: i64,
    pub close_time: i64,
    pub interval: KlineInterval,
    pub closed: bool,
}

/// One price level in a depth delta. A zero quantity denotes removal
/// of the level (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl DepthLevel {
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Incremental orderbook update: the set of bid/ask levels that changed
/// since the previous update for this (exchange, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthData {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub first_update_id: Option<i64>,
    pub final_update_id: Option<i64>,
}

/// Type-specific payload carried by a [`CanonicalRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Trade(TradeData),
    Ticker(TickerData),
    Kline(KlineData),
    Depth(DepthData),
}

/// The normalized, exchange-agnostic event that flows from C3 onward.
///
/// This is the only type C4/C5/C6/C7 ever see; no adapter-specific
/// structure crosses that boundary (spec §2 data flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub exchange: String,
    /// Canonical `BASE/QUOTE` form, e.g. `BTC/USDT`.
    pub symbol: String,
    pub data_type: DataType,
    /// Source-clock event time, milliseconds since epoch.
    pub timestamp: i64,
    /// Local monotonic receipt time, milliseconds since epoch.
    pub received_at: i64,
    pub data: Payload,
    /// When set, this single record bypasses the output channel's batch
    /// window and is sent as soon as it reaches the front of the queue
    /// (spec §4.4 "skipBatching"). Absent on the wire defaults to `false`
    /// so older producers stay compatible.
    #[serde(default)]
    pub skip_batching: bool,
}

impl CanonicalRecord {
    /// The `(exchange, symbol, type)` tuple used everywhere ordering,
    /// routing-cache, and subscriber-cache keys are derived (spec §3, §4.3, §4.7).
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            data_type: self.data_type,
        }
    }
}

/// `(exchange, symbol, data-type)` — the unit of ordering and caching
/// throughout the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub exchange: String,
    pub symbol: String,
    pub data_type: DataType,
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.exchange, self.symbol, self.data_type.as_tag())
    }
}

/// An active request for (exchange, symbol, data-type) (spec §3).
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub data_type: DataType,
    pub activated_at: i64,
    pub live: bool,
}

impl SubscriptionEntry {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, data_type: DataType, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange: exchange.into(),
            symbol: symbol.into(),
            data_type,
            activated_at: now_ms,
            live: true,
        }
    }
}
