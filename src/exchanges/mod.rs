//! Exchange adapter registry and factory (C3).
//!
//! All exchange-specific logic lives in dedicated adapter modules; the
//! rest of the application interacts exclusively through the
//! `ExchangeAdapter` trait.

pub mod adapter;
pub mod binance;

use std::sync::Arc;

use adapter::ExchangeAdapter;

/// Resolves an adapter by the `adapters[].name` configured (spec §6).
pub fn get_adapter(name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
    match name {
        "binance" => Some(Arc::new(binance::BinanceAdapter)),
        _ => None,
    }
}
