// =============================================================================
// SyntheticSource -- random-walk tick generator
// =============================================================================
//
// Every cadence tick, each subscribed instrument gets one tick priced within
// ±0.5% of its reference. The reference then drifts 1% toward the sample.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::market_data::source::{EventSink, SourceEvent, TickSource};
use crate::types::{CollectorKind, Instrument, MarketClock, Side, Tick};

/// Maximum relative move per tick.
pub const MAX_PERTURBATION: f64 = 0.005;

/// Reference prices for liquid NSE names.
const KNOWN_BASE_PRICES: &[(&str, f64)] = &[
    ("RELIANCE", 2500.0),
    ("TCS", 3500.0),
    ("INFY", 1450.0),
    ("HDFCBANK", 1650.0),
    ("ICICIBANK", 1100.0),
    ("SBIN", 750.0),
    ("BHARTIARTL", 1200.0),
    ("ITC", 450.0),
    ("HINDUNILVR", 2400.0),
    ("LT", 3450.0),
    ("KOTAKBANK", 1750.0),
    ("AXISBANK", 1050.0),
    ("BAJFINANCE", 6800.0),
    ("ASIANPAINT", 2900.0),
    ("MARUTI", 12500.0),
    ("TATASTEEL", 140.0),
    ("WIPRO", 450.0),
    ("SUNPHARMA", 1650.0),
    ("TITAN", 3200.0),
    ("NESTLEIND", 2400.0),
];

pub fn known_base_price(symbol: &str) -> Option<f64> {
    KNOWN_BASE_PRICES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| *p)
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyntheticSource {
    name: String,
    cadence: Duration,
    seed: Option<u64>,
    clock: Arc<MarketClock>,
    instruments: Arc<RwLock<BTreeMap<u32, Instrument>>>,
    running: Mutex<Option<Running>>,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, cadence: Duration, clock: Arc<MarketClock>) -> Self {
        Self {
            name: name.into(),
            cadence,
            seed: None,
            clock,
            instruments: Arc::new(RwLock::new(BTreeMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Fix the RNG seed for reproducible walks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[async_trait]
impl TickSource for SyntheticSource {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Synthetic
    }

    fn start(&self, sink: EventSink) -> Result<(), SourceError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SourceError::AlreadyRunning);
        }

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cancel = CancellationToken::new();
        let walk = RandomWalk {
            name: self.name.clone(),
            cadence: self.cadence,
            clock: self.clock.clone(),
            instruments: self.instruments.clone(),
            references: HashMap::new(),
            rng,
            sink,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(walk.run());
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!(source = %self.name, error = %e, "synthetic source task ended abnormally");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    fn subscribe(&self, instruments: &[Instrument]) {
        let mut map = self.instruments.write();
        for inst in instruments {
            map.insert(inst.token, inst.clone());
        }
    }

    fn unsubscribe(&self, instruments: &[Instrument]) {
        let mut map = self.instruments.write();
        for inst in instruments {
            map.remove(&inst.token);
        }
    }

    fn subscriptions(&self) -> Vec<Instrument> {
        self.instruments.read().values().cloned().collect()
    }
}

struct RandomWalk {
    name: String,
    cadence: Duration,
    clock: Arc<MarketClock>,
    instruments: Arc<RwLock<BTreeMap<u32, Instrument>>>,
    references: HashMap<u32, f64>,
    rng: StdRng,
    sink: EventSink,
    cancel: CancellationToken,
}

impl RandomWalk {
    async fn run(mut self) {
        let count = self.instruments.read().len();
        info!(source = %self.name, instruments = count, cadence_ms = self.cadence.as_millis() as u64, "synthetic source started");
        self.sink.emit(SourceEvent::Connected { instruments: count });

        let mut ticker = tokio::time::interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.emit_round(),
            }
        }
        debug!(source = %self.name, "synthetic source stopped");
    }

    fn emit_round(&mut self) {
        let instruments: Vec<Instrument> = self.instruments.read().values().cloned().collect();
        self.references
            .retain(|token, _| instruments.iter().any(|i| i.token == *token));

        let now = self.clock.now();
        for inst in instruments {
            let reference = match self.references.get(&inst.token) {
                Some(p) => *p,
                None => known_base_price(&inst.symbol)
                    .unwrap_or_else(|| self.rng.gen_range(100.0..5000.0)),
            };

            let change = self.rng.gen_range(-MAX_PERTURBATION..=MAX_PERTURBATION);
            let price = reference * (1.0 + change);
            self.references
                .insert(inst.token, reference * 0.99 + price * 0.01);

            let tick = Tick {
                exchange: inst.exchange,
                symbol: inst.symbol,
                instrument_token: inst.token,
                timestamp: now,
                price,
                quantity: self.rng.gen_range(100..1000),
                side: if change >= 0.0 { Side::Buy } else { Side::Sell },
                open_interest: None,
            };
            self.sink.emit(SourceEvent::Tick(tick));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::mpsc;

    fn sink() -> (EventSink, mpsc::Receiver<SourceEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        (EventSink::new(tx, Arc::new(AtomicU64::new(0))), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn emits_bounded_ticks_on_cadence() {
        let src = SyntheticSource::new("sim", Duration::from_secs(1), Arc::new(MarketClock::new()))
            .with_seed(7);
        src.subscribe(&[Instrument::new("NSE", "RELIANCE", 738561)]);

        let (sink, mut rx) = sink();
        src.start(sink).unwrap();
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        src.stop().await;

        let mut ticks = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let SourceEvent::Tick(t) = ev {
                ticks.push(t);
            }
        }

        // Immediate first tick, then one per second.
        assert_eq!(ticks.len(), 10);
        for t in &ticks {
            assert!((t.price / 2500.0 - 1.0).abs() <= 0.01, "price {} drifted", t.price);
            assert!((100..1000).contains(&t.quantity));
            assert_ne!(t.side, Side::Unknown);
        }
        assert!(ticks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_changes_apply_next_round() {
        let src = SyntheticSource::new("sim", Duration::from_secs(1), Arc::new(MarketClock::new()))
            .with_seed(1);
        let tcs = Instrument::new("NSE", "TCS", 2953217);
        src.subscribe(&[tcs.clone()]);

        let (sink, mut rx) = sink();
        src.start(sink).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        src.subscribe(&[Instrument::new("NSE", "ZZTEST", 42)]);
        src.unsubscribe(&[tcs]);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        src.stop().await;

        let mut symbols = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let SourceEvent::Tick(t) = ev {
                symbols.push(t.symbol);
            }
        }
        assert_eq!(symbols, vec!["TCS".to_string(), "ZZTEST".to_string()]);
    }

    #[test]
    fn known_prices_cover_seed_list() {
        assert_eq!(known_base_price("RELIANCE"), Some(2500.0));
        assert_eq!(known_base_price("NESTLEIND"), Some(2400.0));
        assert_eq!(known_base_price("UNKNOWN"), None);
    }
}
