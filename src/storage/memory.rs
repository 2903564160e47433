// =============================================================================
// MemoryStore -- in-process tick log, bar table and instrument lookup
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::storage::MarketStore;
use crate::types::{Bar, BarKey, Instrument, Tick, Timeframe};

/// Thread-safe in-memory implementation of [`MarketStore`].
///
/// Ticks are kept in a ring trimmed to `max_ticks`; bars live in a map keyed
/// by their natural key so a re-flush replaces the earlier row.
pub struct MemoryStore {
    ticks: RwLock<VecDeque<Tick>>,
    max_ticks: usize,
    bars: RwLock<BTreeMap<BarKey, Bar>>,
    instruments: RwLock<HashMap<(String, String), u32>>,
    bar_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(max_ticks: usize) -> Self {
        Self {
            ticks: RwLock::new(VecDeque::with_capacity(max_ticks.min(4096))),
            max_ticks,
            bars: RwLock::new(BTreeMap::new()),
            instruments: RwLock::new(HashMap::new()),
            bar_writes: AtomicU64::new(0),
        }
    }

    pub fn register_instruments(&self, instruments: impl IntoIterator<Item = Instrument>) {
        let mut map = self.instruments.write();
        for inst in instruments {
            map.insert((inst.exchange.to_uppercase(), inst.symbol.to_uppercase()), inst.token);
        }
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.read().len()
    }

    /// Ticks currently retained for `symbol`, oldest first.
    pub fn ticks_for(&self, symbol: &str) -> Vec<Tick> {
        self.ticks
            .read()
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.read().len()
    }

    /// Bars for `symbol` at `timeframe`, ordered by window start.
    pub fn bars_for(&self, symbol: &str, timeframe: Timeframe) -> Vec<Bar> {
        let mut bars: Vec<Bar> = self
            .bars
            .read()
            .values()
            .filter(|b| b.symbol == symbol && b.timeframe == timeframe)
            .cloned()
            .collect();
        bars.sort_by_key(|b| b.window_start);
        bars
    }

    pub fn bar_count(&self) -> usize {
        self.bars.read().len()
    }

    /// Total upserts accepted, including replacements of an existing key.
    pub fn bar_writes(&self) -> u64 {
        self.bar_writes.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn insert_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(StoreError::Rejected(format!(
                "non-positive price {} for {}",
                tick.price, tick.symbol
            )));
        }
        let mut ring = self.ticks.write();
        ring.push_back(tick.clone());
        while ring.len() > self.max_ticks {
            ring.pop_front();
        }
        Ok(())
    }

    async fn upsert_bar(&self, bar: &Bar) -> Result<(), StoreError> {
        if !bar.is_consistent() {
            return Err(StoreError::Rejected(format!(
                "inconsistent OHLC for {} @ {}",
                bar.symbol, bar.window_start
            )));
        }
        self.bars.write().insert(bar.key(), bar.clone());
        self.bar_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn lookup_instrument_token(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(self
            .instruments
            .read()
            .get(&(exchange.to_uppercase(), symbol.to_uppercase()))
            .copied())
    }

    async fn latest_bar(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Bar>, StoreError> {
        Ok(self
            .bars
            .read()
            .values()
            .filter(|b| b.symbol == symbol && b.timeframe == timeframe)
            .max_by_key(|b| b.window_start)
            .cloned())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_bar(minute: u32, close: f64) -> Bar {
        Bar {
            exchange: "NSE".into(),
            symbol: "INFY".into(),
            instrument_token: 408065,
            timeframe: Timeframe::M1,
            window_start: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10,
            trades_count: Some(1),
            vwap: Some(close),
            open_interest: None,
            source: "test".into(),
        }
    }

    fn sample_tick(price: f64) -> Tick {
        Tick {
            exchange: "NSE".into(),
            symbol: "INFY".into(),
            instrument_token: 408065,
            timestamp: Utc::now(),
            price,
            quantity: 5,
            side: crate::types::Side::Buy,
            open_interest: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_same_key() {
        let store = MemoryStore::new(10);
        store.upsert_bar(&sample_bar(15, 100.0)).await.unwrap();
        store.upsert_bar(&sample_bar(15, 101.0)).await.unwrap();
        store.upsert_bar(&sample_bar(16, 102.0)).await.unwrap();

        assert_eq!(store.bar_count(), 2);
        assert_eq!(store.bar_writes(), 3);
        let bars = store.bars_for("INFY", Timeframe::M1);
        assert_eq!(bars[0].close, 101.0);
        let latest = store.latest_bar("INFY", Timeframe::M1).await.unwrap().unwrap();
        assert_eq!(latest.close, 102.0);
    }

    #[tokio::test]
    async fn tick_ring_is_trimmed() {
        let store = MemoryStore::new(3);
        for i in 0..5 {
            store.insert_tick(&sample_tick(100.0 + i as f64)).await.unwrap();
        }
        let prices: Vec<f64> = store.ticks_for("INFY").iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![102.0, 103.0, 104.0]);
    }

    #[tokio::test]
    async fn rejects_bad_records() {
        let store = MemoryStore::new(3);
        assert!(store.insert_tick(&sample_tick(0.0)).await.is_err());

        let mut bar = sample_bar(15, 100.0);
        bar.high = 90.0;
        assert!(store.upsert_bar(&bar).await.is_err());
        assert_eq!(store.bar_count(), 0);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let store = MemoryStore::new(3);
        store.register_instruments([Instrument::new("NSE", "RELIANCE", 738561)]);
        assert_eq!(
            store.lookup_instrument_token("nse", "reliance").await.unwrap(),
            Some(738561)
        );
        assert_eq!(store.lookup_instrument_token("BSE", "RELIANCE").await.unwrap(), None);
    }
}
