//! C2: tracks the active set of exchange stream keys and reshapes the
//! upstream URL whenever that set changes (spec §4.1).

use std::collections::BTreeSet;

/// Base WebSocket endpoint plus the two URL forms Binance (and most
/// combined-stream exchanges) support: single-stream and combined-stream.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    base_url: String,
    /// Lexicographically ordered so the combined URL is deterministic
    /// (spec §4.1 "relative key order is lexicographic").
    active: BTreeSet<String>,
}

impl StreamMultiplexer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), active: BTreeSet::new() }
    }

    /// Adds a stream key to the active set. Idempotent: re-adding an
    /// existing key is a no-op and returns `false` (spec §4.1).
    pub fn add_stream(&mut self, key: impl Into<String>) -> bool {
        self.active.insert(key.into())
    }

    /// Removes a stream key. A no-op on an unknown key, returns `false`
    /// (spec §4.1).
    pub fn remove_stream(&mut self, key: &str) -> bool {
        self.active.remove(key)
    }

    pub fn active_streams(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Builds the upstream URL reflecting the current active set
    /// (spec §4.1 URL construction rules):
    /// - empty set -> base path, no stream suffix
    /// - single key -> `/ws/<key>`
    /// - multiple keys -> `/stream?streams=k1/k2/...`
    pub fn current_url(&self) -> String {
        match self.active.len() {
            0 => self.base_url.clone(),
            1 => {
                let key = self.active.iter().next().expect("len checked above");
                format!("{}/ws/{}", self.base_url, key)
            }
            _ => {
                let joined = self.active.iter().cloned().collect::<Vec<_>>().join("/");
                format!("{}/stream?streams={}", self.base_url, joined)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_connects_to_base_url_without_suffix() {
        let mux = StreamMultiplexer::new("wss://stream.binance.com:9443");
        assert_eq!(mux.current_url(), "wss://stream.binance.com:9443");
    }

    #[test]
    fn single_key_uses_single_stream_path() {
        let mut mux = StreamMultiplexer::new("wss://stream.binance.com:9443");
        mux.add_stream("btcusdt@trade");
        assert_eq!(mux.current_url(), "wss://stream.binance.com:9443/ws/btcusdt@trade");
    }

    #[test]
    fn multiple_keys_use_combined_path_in_lexicographic_order() {
        let mut mux = StreamMultiplexer::new("wss://stream.binance.com:9443");
        mux.add_stream("ethusdt@trade");
        mux.add_stream("btcusdt@trade");
        assert_eq!(
            mux.current_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[test]
    fn many_streams_preserve_deterministic_order_and_count() {
        let mut mux = StreamMultiplexer::new("wss://stream.binance.com:9443");
        let mut keys: Vec<String> = (0..150).map(|i| format!("sym{i:04}usdt@trade")).collect();
        for key in &keys {
            mux.add_stream(key.clone());
        }
        assert_eq!(mux.len(), 150);
        keys.sort();
        let expected = format!("wss://stream.binance.com:9443/stream?streams={}", keys.join("/"));
        assert_eq!(mux.current_url(), expected);
    }

    #[test]
    fn add_stream_is_idempotent() {
        let mut mux = StreamMultiplexer::new("wss://x");
        assert!(mux.add_stream("btcusdt@trade"));
        assert!(!mux.add_stream("btcusdt@trade"));
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn remove_stream_on_unknown_key_is_a_no_op() {
        let mut mux = StreamMultiplexer::new("wss://x");
        assert!(!mux.remove_stream("nope@trade"));
        assert!(mux.is_empty());
    }

    #[test]
    fn topology_transition_preserves_remaining_key() {
        let mut mux = StreamMultiplexer::new("wss://x");
        mux.add_stream("btcusdt@trade");
        mux.add_stream("ethusdt@trade");
        assert!(mux.remove_stream("ethusdt@trade"));
        assert_eq!(mux.current_url(), "wss://x/ws/btcusdt@trade");
    }
}
