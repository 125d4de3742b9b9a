//! Binance Spot WebSocket adapter — the reference implementation named
//! throughout spec §6 ("Upstream wire protocol (Binance reference)").
//!
//! <https://developers.binance.com/docs/binance-spot-api-docs/websocket-market-streams>

use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

use crate::config::AdapterSubscriptionConfig;
use crate::errors::ProtocolError;
use crate::schema::{
    CanonicalRecord, DataType, DepthData, DepthLevel, KlineData, KlineInterval, Payload, Side,
    TickerData, TradeData,
};
use crate::util::{self, now_ms};

use super::adapter::{ExchangeAdapter, ParseResult};

pub struct BinanceAdapter;

impl BinanceAdapter {
    /// Parses a wire numeric string into an exact decimal, classifying
    /// any failure as `MALFORMED_NUMERIC` (spec §4.2 step 3).
    fn decimal(data: &Value, field: &str) -> Result<Decimal, ProtocolError> {
        let raw = data.get(field).and_then(Value::as_str).ok_or_else(|| ProtocolError::MissingField(field.to_string()))?;
        Decimal::from_str(raw).map_err(|_| ProtocolError::MalformedNumeric { field: field.to_string(), value: raw.to_string() })
    }

    fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str, ProtocolError> {
        data.get(field).and_then(Value::as_str).ok_or_else(|| ProtocolError::MissingField(field.to_string()))
    }

    fn required_i64(data: &Value, field: &str) -> Result<i64, ProtocolError> {
        data.get(field).and_then(Value::as_i64).ok_or_else(|| ProtocolError::MissingField(field.to_string()))
    }

    fn parse_trade(&self, data: &Value) -> Result<CanonicalRecord, ProtocolError> {
        let symbol = util::symbol_from_exchange(Self::required_str(data, "s")?);
        let timestamp = Self::required_i64(data, "T")?;
        let is_maker_buyer = data.get("m").and_then(Value::as_bool).ok_or_else(|| ProtocolError::MissingField("m".to_string()))?;
        Ok(CanonicalRecord {
            exchange: self.name().to_string(),
            symbol,
            data_type: DataType::Trade,
            timestamp,
            received_at: now_ms(),
            data: Payload::Trade(TradeData {
                id: Self::required_i64(data, "t")?.to_string(),
                price: Self::decimal(data, "p")?,
                quantity: Self::decimal(data, "q")?,
                // maker-buy means the buy side rested on the book, so the
                // trade was initiated by the seller (spec §4.2 step 5).
                side: if is_maker_buyer { Side::Sell } else { Side::Buy },
            }),
            skip_batching: false,
        })
    }

    fn parse_ticker(&self, data: &Value) -> Result<CanonicalRecord, ProtocolError> {
        let symbol = util::symbol_from_exchange(Self::required_str(data, "s")?);
        let timestamp = Self::required_i64(data, "E")?;
        Ok(CanonicalRecord {
            exchange: self.name().to_string(),
            symbol,
            data_type: DataType::Ticker,
            timestamp,
            received_at: now_ms(),
            data: Payload::Ticker(TickerData {
                last: Self::decimal(data, "c")?,
                bid: Self::decimal(data, "b")?,
                ask: Self::decimal(data, "a")?,
                change: Self::decimal(data, "P")?,
                volume: Self::decimal(data, "v")?,
                high: Self::decimal(data, "h")?,
                low: Self::decimal(data, "l")?,
            }),
            skip_batching: false,
        })
    }

    fn parse_kline(&self, data: &Value) -> Result<CanonicalRecord, ProtocolError> {
        let k = data.get("k").ok_or_else(|| ProtocolError::MissingField("k".to_string()))?;
        let symbol = util::symbol_from_exchange(Self::required_str(k, "s")?);
        let interval_raw = Self::required_str(k, "i")?;
        let interval = KlineInterval::parse(interval_raw)
            .ok_or_else(|| ProtocolError::MalformedNumeric { field: "k.i".to_string(), value: interval_raw.to_string() })?;
        let timestamp = Self::required_i64(data, "E")?;
        let closed = k.get("x").and_then(Value::as_bool).ok_or_else(|| ProtocolError::MissingField("k.x".to_string()))?;
        Ok(CanonicalRecord {
            exchange: self.name().to_string(),
            symbol,
            data_type: DataType::Kline(interval),
            timestamp,
            received_at: now_ms(),
            data: Payload::Kline(KlineData {
                open: Self::decimal(k, "o")?,
                high: Self::decimal(k, "h")?,
                low: Self::decimal(k, "l")?,
                close: Self::decimal(k, "c")?,
                volume: Self::decimal(k, "v")?,
                open_time: Self::required_i64(k, "t")?,
                close_time: Self::required_i64(k, "T")?,
                interval,
                closed,
            }),
            skip_batching: false,
        })
    }

    fn parse_depth(&self, data: &Value) -> Result<CanonicalRecord, ProtocolError> {
        let symbol = util::symbol_from_exchange(Self::required_str(data, "s")?);
        let timestamp = Self::required_i64(data, "E")?;
        let bids = Self::parse_levels(data, "b")?;
        let asks = Self::parse_levels(data, "a")?;
        Ok(CanonicalRecord {
            exchange: self.name().to_string(),
            symbol,
            data_type: DataType::Depth,
            timestamp,
            received_at: now_ms(),
            data: Payload::Depth(DepthData {
                bids,
                asks,
                first_update_id: data.get("U").and_then(Value::as_i64),
                final_update_id: data.get("u").and_then(Value::as_i64),
            }),
            skip_batching: false,
        })
    }

    fn parse_levels(data: &Value, field: &str) -> Result<Vec<DepthLevel>, ProtocolError> {
        let entries = data.get(field).and_then(Value::as_array).ok_or_else(|| ProtocolError::MissingField(field.to_string()))?;
        entries
            .iter()
            .map(|entry| {
                let price_raw = entry.get(0).and_then(Value::as_str).ok_or_else(|| ProtocolError::MalformedFrame(format!("{field}[]: missing price")))?;
                let qty_raw = entry.get(1).and_then(Value::as_str).ok_or_else(|| ProtocolError::MalformedFrame(format!("{field}[]: missing quantity")))?;
                let price = Decimal::from_str(price_raw).map_err(|_| ProtocolError::MalformedNumeric { field: format!("{field}[].price"), value: price_raw.to_string() })?;
                let quantity = Decimal::from_str(qty_raw).map_err(|_| ProtocolError::MalformedNumeric { field: format!("{field}[].quantity"), value: qty_raw.to_string() })?;
                Ok(DepthLevel { price, quantity })
            })
            .collect()
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self) -> &'static str {
        "wss://stream.binance.com:9443"
    }

    fn stream_key(&self, symbol: &str, data_type_tag: &str) -> Option<String> {
        let exchange_symbol = util::symbol_to_exchange(symbol).to_lowercase();
        let suffix = match data_type_tag {
            "trade" => "trade".to_string(),
            "ticker" => "ticker".to_string(),
            "depth" => "depth".to_string(),
            tag if tag.starts_with("kline_") => tag.to_string(),
            _ => return None,
        };
        Some(format!("{exchange_symbol}@{suffix}"))
    }

    fn build_subscribe_message(&self, stream_keys: &[String]) -> Value {
        json!({
            "method": "SUBSCRIBE",
            "params": stream_keys,
            "id": now_ms(),
        })
    }

    fn stream_keys_for(&self, subscription: &AdapterSubscriptionConfig) -> Vec<String> {
        let mut keys = Vec::with_capacity(subscription.symbols.len() * subscription.data_types.len());
        for symbol in &subscription.symbols {
            for data_type in &subscription.data_types {
                if let Some(key) = self.stream_key(symbol, data_type) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn parse_message(&self, raw: &str) -> ParseResult {
        let envelope: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return ParseResult::Error(ProtocolError::MalformedFrame(e.to_string())),
        };

        // Subscribe acknowledgements carry `result`/`id` and no `stream`.
        if envelope.get("result").is_some() && envelope.get("stream").is_none() {
            return ParseResult::Control;
        }

        // Combined-stream frames wrap the payload under `data` alongside
        // the originating `stream` key; single-stream frames are the
        // payload directly.
        let (stream, data) = match envelope.get("data") {
            Some(data) => (envelope.get("stream").and_then(Value::as_str), data),
            None => (None, &envelope),
        };
        if envelope.get("data").is_some() && stream.is_none() {
            return ParseResult::UnassociatedFrame;
        }

        let event = match data.get("e").and_then(Value::as_str) {
            Some(e) => e,
            None => return ParseResult::Control,
        };

        let result = match event {
            "trade" => self.parse_trade(data),
            "24hrTicker" => self.parse_ticker(data),
            "kline" => self.parse_kline(data),
            "depthUpdate" => self.parse_depth(data),
            other => return ParseResult::UnknownEvent(other.to_string()),
        };

        match result {
            Ok(record) => ParseResult::Record(record),
            Err(e) => ParseResult::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_event_with_maker_buyer_as_sell_side() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({
            "e": "trade", "E": 1699123456789_i64, "s": "BTCUSDT",
            "t": 12345, "p": "50123.45", "q": "0.015", "m": true
        })
        .to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Record(record) => {
                assert_eq!(record.symbol, "BTC/USDT");
                assert_eq!(record.data_type, DataType::Trade);
                match record.data {
                    Payload::Trade(trade) => {
                        assert_eq!(trade.side, Side::Sell);
                        assert_eq!(trade.price.to_string(), "50123.45");
                    }
                    other => panic!("expected trade payload, got {other:?}"),
                }
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn parses_taker_buy_trade_as_buy_side() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({
            "e": "trade", "E": 1, "s": "ETHUSDT", "t": 1, "p": "3000.00", "q": "1", "m": false
        })
        .to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Record(record) => match record.data {
                Payload::Trade(trade) => assert_eq!(trade.side, Side::Buy),
                other => panic!("expected trade payload, got {other:?}"),
            },
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn depth_update_filters_zero_quantity_removal_levels_are_kept_not_dropped() {
        // Per spec §3, a zero-quantity level denotes removal and must be
        // preserved in the canonical record (the sink acts on it), not
        // silently filtered as the teacher's adapter used to do.
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 10, "u": 12,
            "b": [["100.00", "0.00000000"]],
            "a": [["101.00", "2.5"]]
        })
        .to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Record(record) => match record.data {
                Payload::Depth(depth) => {
                    assert_eq!(depth.bids.len(), 1);
                    assert!(depth.bids[0].is_removal());
                    assert_eq!(depth.asks.len(), 1);
                    assert!(!depth.asks[0].is_removal());
                }
                other => panic!("expected depth payload, got {other:?}"),
            },
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn malformed_numeric_field_is_classified_not_panicking() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({
            "e": "trade", "E": 1, "s": "BTCUSDT", "t": 1, "p": "not-a-number", "q": "1", "m": false
        })
        .to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Error(ProtocolError::MalformedNumeric { field, .. }) => assert_eq!(field, "p"),
            other => panic!("expected MalformedNumeric, got {other:?}"),
        }
    }

    #[test]
    fn missing_field_is_named_in_the_error() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({ "e": "trade", "s": "BTCUSDT" }).to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Error(ProtocolError::MissingField(field)) => assert_eq!(field, "T"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_reported_without_error() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({ "e": "aggTrade", "s": "BTCUSDT" }).to_string();
        assert_eq!(adapter.parse_message(&raw), ParseResult::UnknownEvent("aggTrade".to_string()));
    }

    #[test]
    fn subscribe_ack_is_a_control_frame() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({ "result": null, "id": 1 }).to_string();
        assert_eq!(adapter.parse_message(&raw), ParseResult::Control);
    }

    #[test]
    fn combined_stream_wrapper_without_stream_key_is_unassociated() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({ "data": { "e": "trade" } }).to_string();
        assert_eq!(adapter.parse_message(&raw), ParseResult::UnassociatedFrame);
    }

    #[test]
    fn kline_event_parses_interval_and_closed_flag() {
        let adapter = BinanceAdapter;
        let raw = serde_json::json!({
            "e": "kline", "E": 123,
            "k": { "s": "BTCUSDT", "i": "1m", "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10", "t": 100, "T": 159, "x": true }
        })
        .to_string();
        match adapter.parse_message(&raw) {
            ParseResult::Record(record) => {
                assert_eq!(record.data_type, DataType::Kline(KlineInterval::OneMinute));
                match record.data {
                    Payload::Kline(k) => assert!(k.closed),
                    other => panic!("expected kline payload, got {other:?}"),
                }
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn stream_keys_for_builds_every_symbol_data_type_combination() {
        let adapter = BinanceAdapter;
        let subscription = AdapterSubscriptionConfig {
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            data_types: vec!["trade".to_string(), "kline_1m".to_string()],
        };
        let keys = adapter.stream_keys_for(&subscription);
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&"btcusdt@trade".to_string()));
        assert!(keys.contains(&"ethusdt@kline_1m".to_string()));
    }
}
