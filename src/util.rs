//! Shared, allocation-aware helpers used by all components.
//!
//! IMPORTANT:
//! - No exchange-specific business logic should live here beyond the
//!   Binance base/quote heuristic, which several adapters would share
//!   if more exchanges were added.
//! - This module must remain lightweight and deterministic.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Used for `receivedAt` stamping (C3) and for any timestamp fallback
/// when an exchange omits one.
///
/// PANIC:
/// - Panics if system time is before UNIX_EPOCH (should never happen).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX_EPOCH")
        .as_millis() as i64
}

/// Quote assets tried in order when splitting a Binance-style concatenated
/// symbol (`BTCUSDT`) back into `BASE/QUOTE`. Longest-first so `USDT` wins
/// over `USD` for pairs like `BTCUSDT`.
const BINANCE_QUOTES: [&str; 6] = ["USDT", "BUSD", "USDC", "BTC", "ETH", "USD"];

/// Converts the canonical `BASE/QUOTE` form into Binance's concatenated
/// wire form (`BTC/USDT` -> `BTCUSDT`), lowercased for stream-key use.
pub fn symbol_to_exchange(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// Converts a Binance wire symbol (`BTCUSDT`) back into the canonical
/// `BASE/QUOTE` form, using the longest matching known quote asset.
///
/// Falls back to returning the input unchanged if no known quote asset
/// matches — callers should treat that as a best-effort result, not a
/// parse failure; the adapter contract (spec §4.2) only requires the
/// symbol field in general, and a failed split still produces a record
/// rather than `MISSING_FIELD`.
pub fn symbol_from_exchange(symbol: &str) -> String {
    for quote in BINANCE_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}/{quote}");
            }
        }
    }
    symbol.to_string()
}

/// First 16 hex characters of the SHA-256 digest of `bytes` — the
/// checksum format the message header carries (spec §4.5).
pub fn checksum_hex16(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_to_exchange_strips_separator() {
        assert_eq!(symbol_to_exchange("BTC/USDT"), "BTCUSDT");
    }

    #[test]
    fn symbol_from_exchange_prefers_longest_quote() {
        assert_eq!(symbol_from_exchange("BTCUSDT"), "BTC/USDT");
        assert_eq!(symbol_from_exchange("ETHBUSD"), "ETH/BUSD");
        assert_eq!(symbol_from_exchange("ETHBTC"), "ETH/BTC");
    }

    #[test]
    fn symbol_from_exchange_falls_back_on_unknown_quote() {
        assert_eq!(symbol_from_exchange("WEIRDPAIR"), "WEIRDPAIR");
    }

    #[test]
    fn checksum_hex16_is_stable_and_sized() {
        let a = checksum_hex16(b"hello");
        let b = checksum_hex16(b"hello");
        let c = checksum_hex16(b"world");
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
