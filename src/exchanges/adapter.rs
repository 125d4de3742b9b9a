//! C3: the seam between the generic pipeline and exchange-specific wire
//! formats (spec §4.2). Parsing is pure: no I/O, no clock beyond
//! stamping receipt time.

use crate::config::AdapterSubscriptionConfig;
use crate::errors::ProtocolError;
use crate::schema::{CanonicalRecord, DataType};

/// The outcome of parsing one raw frame (spec §4.2 edge cases).
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A market-data record was decoded.
    Record(CanonicalRecord),
    /// Recognized as a non-market control frame (ack, ping, subscribe
    /// confirmation) — not an error, nothing to count as a failure.
    Control,
    /// Recognized but not a canonical data type this system tracks.
    UnknownEvent(String),
    /// A stream-multiplexed frame with no attributable stream key.
    UnassociatedFrame,
    /// Decoding failed; see [`ProtocolError`] for the specific class.
    Error(ProtocolError),
}

/// Exchange-specific mapping between the system's logical model and
/// one exchange's wire protocol. One adapter per exchange (spec §4.2).
pub trait ExchangeAdapter: Send + Sync {
    /// Canonical exchange identifier, matched against `adapters[].name`.
    fn name(&self) -> &'static str;

    /// Base WebSocket endpoint, with no stream suffix (C2 builds the rest).
    fn ws_url(&self) -> &'static str;

    /// The stream key C2 multiplexes on for one (symbol, data-type tag)
    /// pair, e.g. `btcusdt@trade`, `btcusdt@kline_1m`.
    fn stream_key(&self, symbol: &str, data_type_tag: &str) -> Option<String>;

    /// Builds the subscribe control frame for a batch of stream keys.
    fn build_subscribe_message(&self, stream_keys: &[String]) -> serde_json::Value;

    /// Every stream key implied by a subscription block (spec §6
    /// `adapters[].subscription`), used at startup to seed C2.
    fn stream_keys_for(&self, subscription: &AdapterSubscriptionConfig) -> Vec<String>;

    /// Maps one raw text frame to zero or one canonical record
    /// (spec §4.2 algorithm). Must never panic.
    fn parse_message(&self, raw: &str) -> ParseResult;
}
