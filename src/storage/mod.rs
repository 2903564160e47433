// =============================================================================
// Storage collaborator
// =============================================================================
//
// The time-series engine itself (tables, compression, retention) lives
// outside this service. Collectors only need the narrow surface below:
// append a tick, upsert a bar on its natural key, resolve instrument tokens.
// =============================================================================

pub mod instruments;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Bar, Instrument, Tick, Timeframe};

pub use memory::MemoryStore;

#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Append a raw tick.
    async fn insert_tick(&self, tick: &Tick) -> Result<(), StoreError>;

    /// Insert or replace the bar keyed by
    /// `(exchange, symbol, window_start, timeframe)`.
    async fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError>;

    /// Resolve a symbol to its broker token. `Ok(None)` means unknown.
    async fn lookup_instrument_token(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Result<Option<u32>, StoreError>;

    /// Most recent bar for `symbol` at `timeframe`, across exchanges.
    async fn latest_bar(&self, symbol: &str, timeframe: Timeframe)
        -> Result<Option<Bar>, StoreError>;
}

/// Resolve `symbol` by trying each exchange in order. Lookup errors are
/// treated like a miss on that exchange.
pub async fn resolve_instrument(
    store: &dyn MarketStore,
    exchanges: &[String],
    symbol: &str,
) -> Option<Instrument> {
    for exchange in exchanges {
        match store.lookup_instrument_token(exchange, symbol).await {
            Ok(Some(token)) if token != 0 => {
                return Some(Instrument::new(exchange.clone(), symbol, token));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(exchange = %exchange, symbol = %symbol, error = %e, "instrument lookup failed");
            }
        }
    }
    None
}
