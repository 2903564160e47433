// =============================================================================
// CandleBuilder -- folds ticks for one instrument into timeframe bars
// =============================================================================
//
// Pure state machine: no I/O, no clocks. The owning collector wraps each
// builder in a mutex because the tick path and the periodic flush path both
// touch it.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::types::{Bar, Instrument, Tick, Timeframe};

/// What happened to a tick handed to [`CandleBuilder::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Folded into the open window.
    Accumulated,
    /// The tick opened a new window; the previous window had unflushed data
    /// and is returned here.
    Rolled(Bar),
    /// Older than the open window. Discarded.
    Late,
}

#[derive(Debug)]
pub struct CandleBuilder {
    instrument: Instrument,
    timeframe: Timeframe,
    source: String,
    current: Option<Bar>,
    /// Set by `update`, cleared by `flush`.
    pending: bool,
    trades: u32,
    notional: f64,
}

impl CandleBuilder {
    pub fn new(instrument: Instrument, timeframe: Timeframe, source: impl Into<String>) -> Self {
        Self {
            instrument,
            timeframe,
            source: source.into(),
            current: None,
            pending: false,
            trades: 0,
            notional: 0.0,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Start of the open window, if any tick has been seen.
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.current.as_ref().map(|b| b.window_start)
    }

    /// Snapshot of the in-progress bar.
    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    pub fn update(&mut self, tick: &Tick) -> TickOutcome {
        let window = self.timeframe.window_start(tick.timestamp);

        let open_window = match self.current.as_ref() {
            Some(bar) => bar.window_start,
            None => {
                self.open(window, tick);
                return TickOutcome::Accumulated;
            }
        };

        if window < open_window {
            return TickOutcome::Late;
        }

        if window > open_window {
            let rolled = self.flush();
            self.open(window, tick);
            return match rolled {
                Some(bar) => TickOutcome::Rolled(bar),
                None => TickOutcome::Accumulated,
            };
        }

        self.fold(tick);
        TickOutcome::Accumulated
    }

    /// Emit the open bar if anything arrived since the last flush.
    ///
    /// The bar itself is kept so that a later tick for the same window
    /// resumes it; the resulting re-flush carries the same key and is an
    /// upsert downstream.
    pub fn flush(&mut self) -> Option<Bar> {
        if !self.pending {
            return None;
        }
        self.pending = false;
        self.current.clone()
    }

    /// Flush only once the open window has ended at `now`.
    pub fn flush_if_elapsed(&mut self, now: DateTime<Utc>) -> Option<Bar> {
        let start = self.window_start()?;
        if now >= self.timeframe.window_end(start) {
            self.flush()
        } else {
            None
        }
    }

    fn open(&mut self, window_start: DateTime<Utc>, tick: &Tick) {
        self.trades = 1;
        self.notional = tick.price * tick.quantity as f64;
        self.current = Some(Bar {
            exchange: self.instrument.exchange.clone(),
            symbol: self.instrument.symbol.clone(),
            instrument_token: self.instrument.token,
            timeframe: self.timeframe,
            window_start,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
            trades_count: Some(1),
            vwap: vwap(self.notional, tick.quantity),
            open_interest: tick.open_interest,
            source: self.source.clone(),
        });
        self.pending = true;
    }

    fn fold(&mut self, tick: &Tick) {
        let Some(bar) = self.current.as_mut() else {
            return;
        };
        self.trades = self.trades.saturating_add(1);
        self.notional += tick.price * tick.quantity as f64;

        bar.high = bar.high.max(tick.price);
        bar.low = bar.low.min(tick.price);
        bar.close = tick.price;
        bar.volume = bar.volume.saturating_add(tick.quantity);
        bar.trades_count = Some(self.trades);
        bar.vwap = vwap(self.notional, bar.volume);
        if tick.open_interest.is_some() {
            bar.open_interest = tick.open_interest;
        }
        self.pending = true;
    }
}

fn vwap(notional: f64, volume: u64) -> Option<f64> {
    (volume > 0).then(|| notional / volume as f64)
}

// =============================================================================
// Tests
// =============================================================================
