// =============================================================================
// Collector -- drives candle builders from one tick source
// =============================================================================
//
// Tasks per running collector:
//   * event loop      -- drains SourceEvents, routes ticks to builders
//   * flush loop      -- flushes elapsed windows on a boundary-aligned timer
//   * persist worker  -- writes ticks and bars to the store
// The source's own task feeds the event loop through a bounded channel.
//
// Shutdown order: source stop (confirmed) -> event loop drained -> flush loop
// cancelled -> final flush-all -> persistence queue drained.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorSettings;
use crate::error::RegistryError;
use crate::market_data::{CandleBuilder, EventSink, SourceEvent, TickOutcome, TickSource};
use crate::storage::MarketStore;
use crate::stream::{DistributionHub, StreamMessage};
use crate::types::{Bar, CollectorKind, ConnectionState, Instrument, MarketClock, Tick, Timeframe};

// =============================================================================
// Options & metrics
// =============================================================================

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub timeframe: Timeframe,
    pub flush_interval: Duration,
    pub event_queue: usize,
    pub persist_queue: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self::from(&CollectorSettings::default())
    }
}

impl From<&CollectorSettings> for CollectorOptions {
    fn from(s: &CollectorSettings) -> Self {
        Self {
            timeframe: s.timeframe,
            flush_interval: s.flush_interval(),
            event_queue: s.event_queue.max(1),
            persist_queue: s.persist_queue.max(1),
        }
    }
}

/// Snapshot of one collector, as served by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorMetrics {
    pub name: String,
    pub kind: CollectorKind,
    pub symbols: Vec<String>,
    pub running: bool,
    pub connection: ConnectionState,
    pub timeframe: Timeframe,
    pub ticks_received: u64,
    pub bars_created: u64,
    pub errors: u64,
    /// Source events lost because the event channel was full.
    pub ticks_dropped: u64,
    pub late_ticks: u64,
    pub uptime_secs: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    ticks_received: AtomicU64,
    bars_created: AtomicU64,
    errors: AtomicU64,
    ticks_dropped: Arc<AtomicU64>,
    late_ticks: AtomicU64,
}

enum PersistJob {
    Tick(Tick),
    Bar(Bar),
}

struct RunHandles {
    cancel: CancellationToken,
    event_loop: JoinHandle<()>,
    flush_loop: JoinHandle<()>,
    persist_worker: JoinHandle<()>,
}

// =============================================================================
// Collector
// =============================================================================

pub struct Collector {
    inner: Arc<CollectorInner>,
    lifecycle: tokio::sync::Mutex<Option<RunHandles>>,
    /// Set once the registry has removed this collector. Checked under the
    /// lifecycle lock so a concurrent `start` cannot revive it.
    retired: AtomicBool,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.source.kind())
            .field("running", &self.is_running())
            .finish()
    }
}

struct CollectorInner {
    name: String,
    options: CollectorOptions,
    source: Arc<dyn TickSource>,
    store: Arc<dyn MarketStore>,
    hub: Arc<DistributionHub>,
    clock: Arc<MarketClock>,
    builders: RwLock<HashMap<u32, Arc<Mutex<CandleBuilder>>>>,
    counters: Counters,
    running: AtomicBool,
    connection: RwLock<ConnectionState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    persist_tx: RwLock<Option<mpsc::Sender<PersistJob>>>,
    /// Latest window stored per instrument; re-flushes of it are not new bars.
    stored_windows: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl Collector {
    pub fn new(
        name: impl Into<String>,
        options: CollectorOptions,
        source: Arc<dyn TickSource>,
        store: Arc<dyn MarketStore>,
        hub: Arc<DistributionHub>,
        clock: Arc<MarketClock>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                name: name.into(),
                options,
                source,
                store,
                hub,
                clock,
                builders: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                running: AtomicBool::new(false),
                connection: RwLock::new(ConnectionState::Idle),
                started_at: RwLock::new(None),
                last_tick_at: RwLock::new(None),
                persist_tx: RwLock::new(None),
                stored_windows: Mutex::new(HashMap::new()),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> CollectorKind {
        self.inner.source.kind()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.read()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn start(&self) -> Result<(), RegistryError> {
        let mut lifecycle = self.lifecycle.lock().await;

        if self.retired.load(Ordering::Acquire) {
            return Err(RegistryError::NotFound(self.inner.name.clone()));
        }

        if let Some(handles) = lifecycle.take() {
            if self.inner.source.is_running() {
                *lifecycle = Some(handles);
                return Err(RegistryError::AlreadyRunning(self.inner.name.clone()));
            }
            // Source gave up (retries exhausted). Tear down the old run;
            // builders are kept so the open window resumes.
            info!(collector = %self.inner.name, "restarting collector after source exit");
            self.shutdown(handles).await;
        }

        let inner = &self.inner;
        let (event_tx, event_rx) = mpsc::channel(inner.options.event_queue);
        let (persist_tx, persist_rx) = mpsc::channel(inner.options.persist_queue);

        *inner.persist_tx.write() = Some(persist_tx);
        let persist_worker = tokio::spawn(persist_loop(inner.clone(), persist_rx));

        let sink = EventSink::new(event_tx, inner.counters.ticks_dropped.clone());
        if let Err(e) = inner.source.start(sink) {
            inner.persist_tx.write().take();
            let _ = persist_worker.await;
            return Err(e.into());
        }

        inner.running.store(true, Ordering::Release);
        *inner.started_at.write() = Some(inner.clock.now());
        inner.set_state(ConnectionState::Connecting, None);

        let cancel = CancellationToken::new();
        let event_loop = tokio::spawn(event_loop(inner.clone(), event_rx));
        let flush_loop = tokio::spawn(flush_loop(inner.clone(), cancel.clone()));

        *lifecycle = Some(RunHandles {
            cancel,
            event_loop,
            flush_loop,
            persist_worker,
        });

        info!(
            collector = %inner.name,
            kind = %inner.source.kind(),
            instruments = inner.builders.read().len(),
            timeframe = %inner.options.timeframe,
            "collector started"
        );
        Ok(())
    }

    /// Mark the collector as removed. Refused while a run is active.
    pub async fn retire(&self) -> Result<(), RegistryError> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() || self.is_running() {
            return Err(RegistryError::StillRunning(self.inner.name.clone()));
        }
        self.retired.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the collector. A no-op when it is not running.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(handles) = lifecycle.take() {
            self.shutdown(handles).await;
            info!(collector = %self.inner.name, "collector stopped");
        }
    }

    async fn shutdown(&self, handles: RunHandles) {
        let inner = &self.inner;

        inner.source.stop().await;

        // The source dropped its sink; the event loop drains and exits.
        if let Err(e) = handles.event_loop.await {
            error!(collector = %inner.name, error = %e, "event loop panicked");
        }

        handles.cancel.cancel();
        if let Err(e) = handles.flush_loop.await {
            error!(collector = %inner.name, error = %e, "flush loop panicked");
        }

        let flushed = inner.flush_all();
        debug!(collector = %inner.name, bars = flushed, "final flush");

        inner.persist_tx.write().take();
        if let Err(e) = handles.persist_worker.await {
            error!(collector = %inner.name, error = %e, "persist worker panicked");
        }

        inner.running.store(false, Ordering::Release);
        inner.set_state(ConnectionState::Stopped, None);
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Resolve `symbols` on `exchange` and subscribe the ones that resolve.
    /// Unknown symbols are skipped with a warning.
    pub async fn subscribe(&self, exchange: &str, symbols: &[String]) -> Vec<Instrument> {
        let mut resolved = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.inner.store.lookup_instrument_token(exchange, symbol).await {
                Ok(Some(token)) if token != 0 => {
                    resolved.push(Instrument::new(exchange, symbol.to_uppercase(), token));
                }
                Ok(_) => {
                    warn!(collector = %self.inner.name, exchange = %exchange, symbol = %symbol, "symbol not found, skipping");
                }
                Err(e) => {
                    warn!(collector = %self.inner.name, symbol = %symbol, error = %e, "instrument lookup failed, skipping");
                }
            }
        }
        self.subscribe_instruments(&resolved);
        resolved
    }

    /// Create builders for new instruments and forward them to the source.
    pub fn subscribe_instruments(&self, instruments: &[Instrument]) {
        if instruments.is_empty() {
            return;
        }
        {
            let mut builders = self.inner.builders.write();
            for inst in instruments {
                builders.entry(inst.token).or_insert_with(|| {
                    Arc::new(Mutex::new(CandleBuilder::new(
                        inst.clone(),
                        self.inner.options.timeframe,
                        self.inner.source_label(),
                    )))
                });
            }
        }
        self.inner.source.subscribe(instruments);
        info!(collector = %self.inner.name, count = instruments.len(), "instruments subscribed");
    }

    /// Remove instruments by symbol. Their open bars are flushed first.
    pub async fn unsubscribe(&self, symbols: &[String]) -> Vec<Instrument> {
        let wanted: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();

        let removed: Vec<Arc<Mutex<CandleBuilder>>> = {
            let mut builders = self.inner.builders.write();
            let tokens: Vec<u32> = builders
                .iter()
                .filter(|(_, b)| wanted.contains(&b.lock().instrument().symbol.to_uppercase()))
                .map(|(t, _)| *t)
                .collect();
            tokens.iter().filter_map(|t| builders.remove(t)).collect()
        };

        let mut instruments = Vec::with_capacity(removed.len());
        let mut bars = Vec::new();
        for builder in removed {
            let mut b = builder.lock();
            instruments.push(b.instrument().clone());
            if let Some(bar) = b.flush() {
                bars.push(bar);
            }
        }

        self.inner.source.unsubscribe(&instruments);
        for bar in bars {
            self.inner.emit_bar_now(bar).await;
        }

        info!(collector = %self.inner.name, count = instruments.len(), "instruments unsubscribed");
        instruments
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.inner.source.subscriptions()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.instruments().into_iter().map(|i| i.symbol).collect()
    }

    /// Flush every builder with pending data regardless of window state.
    pub fn flush_all(&self) -> usize {
        self.inner.flush_all()
    }

    pub fn metrics(&self) -> CollectorMetrics {
        let inner = &self.inner;
        let running = self.is_running();
        let started_at = *inner.started_at.read();
        let uptime_secs = match (running, started_at) {
            (true, Some(at)) => (inner.clock.now() - at).num_seconds(),
            _ => 0,
        };

        CollectorMetrics {
            name: inner.name.clone(),
            kind: inner.source.kind(),
            symbols: self.symbols(),
            running,
            connection: self.connection_state(),
            timeframe: inner.options.timeframe,
            ticks_received: inner.counters.ticks_received.load(Ordering::Relaxed),
            bars_created: inner.counters.bars_created.load(Ordering::Relaxed),
            errors: inner.counters.errors.load(Ordering::Relaxed),
            ticks_dropped: inner.counters.ticks_dropped.load(Ordering::Relaxed),
            late_ticks: inner.counters.late_ticks.load(Ordering::Relaxed),
            uptime_secs,
            started_at,
            last_tick_at: *inner.last_tick_at.read(),
        }
    }
}

// =============================================================================
// Event handling
// =============================================================================

impl CollectorInner {
    fn source_label(&self) -> String {
        match self.source.kind() {
            CollectorKind::Live => "kite_websocket".to_string(),
            CollectorKind::Synthetic => "synthetic".to_string(),
        }
    }

    fn set_state(&self, state: ConnectionState, detail: Option<String>) {
        *self.connection.write() = state;
        self.hub.publish(StreamMessage::status(
            &self.name,
            self.source.kind(),
            state,
            detail,
            self.clock.now(),
        ));
    }

    fn handle_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Tick(tick) => self.on_tick(tick),
            SourceEvent::Connected { instruments } => {
                info!(collector = %self.name, instruments, "source connected");
                // Windows that ended while disconnected are closed now;
                // still-open ones resume with the next tick.
                self.flush_elapsed();
                self.set_state(ConnectionState::Connected, None);
            }
            SourceEvent::Disconnected { reason } => {
                warn!(collector = %self.name, reason = %reason, "source disconnected");
                self.set_state(ConnectionState::Reconnecting, Some(reason));
            }
            SourceEvent::Reconnecting { attempt, delay } => {
                info!(collector = %self.name, attempt, delay_ms = delay.as_millis() as u64, "source reconnecting");
                self.set_state(
                    ConnectionState::Reconnecting,
                    Some(format!("attempt {attempt} in {}ms", delay.as_millis())),
                );
            }
            SourceEvent::ReconnectExhausted { attempts } => {
                error!(collector = %self.name, attempts, "source gave up reconnecting");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.set_state(
                    ConnectionState::Failed,
                    Some(format!("reconnect failed after {attempts} attempts")),
                );
            }
            SourceEvent::Error(msg) => {
                warn!(collector = %self.name, error = %msg, "source error");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_tick(&self, tick: Tick) {
        self.counters.ticks_received.fetch_add(1, Ordering::Relaxed);
        *self.last_tick_at.write() = Some(tick.timestamp);

        self.persist(PersistJob::Tick(tick.clone()));

        let builder = self.builders.read().get(&tick.instrument_token).cloned();
        match builder {
            Some(builder) => {
                let outcome = builder.lock().update(&tick);
                match outcome {
                    TickOutcome::Accumulated => {}
                    TickOutcome::Rolled(bar) => self.emit_bar(bar),
                    TickOutcome::Late => {
                        self.counters.late_ticks.fetch_add(1, Ordering::Relaxed);
                        debug!(collector = %self.name, symbol = %tick.symbol, ts = %tick.timestamp, "late tick discarded");
                    }
                }
            }
            None => {
                debug!(collector = %self.name, token = tick.instrument_token, "tick without builder");
            }
        }

        self.hub.publish(StreamMessage::tick(&tick));
    }

    fn builders_snapshot(&self) -> Vec<Arc<Mutex<CandleBuilder>>> {
        self.builders.read().values().cloned().collect()
    }

    fn flush_elapsed(&self) -> usize {
        let now = self.clock.now();
        let mut count = 0;
        for builder in self.builders_snapshot() {
            let bar = builder.lock().flush_if_elapsed(now);
            if let Some(bar) = bar {
                self.emit_bar(bar);
                count += 1;
            }
        }
        count
    }

    fn flush_all(&self) -> usize {
        let mut count = 0;
        for builder in self.builders_snapshot() {
            let bar = builder.lock().flush();
            if let Some(bar) = bar {
                self.emit_bar(bar);
                count += 1;
            }
        }
        count
    }

    fn emit_bar(&self, bar: Bar) {
        self.hub.publish(StreamMessage::bar(&bar, self.clock.now()));
        self.persist(PersistJob::Bar(bar));
    }

    /// Like `emit_bar`, but writes directly when no worker is running.
    async fn emit_bar_now(&self, bar: Bar) {
        let queued = self.persist_tx.read().is_some();
        if queued {
            self.emit_bar(bar);
            return;
        }
        self.hub.publish(StreamMessage::bar(&bar, self.clock.now()));
        self.write(PersistJob::Bar(bar)).await;
    }

    fn persist(&self, job: PersistJob) {
        let guard = self.persist_tx.read();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(job) {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(collector = %self.name, "persistence queue full, record dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!(collector = %self.name, "persistence worker gone, record dropped");
                }
            }
        }
    }

    async fn write(&self, job: PersistJob) {
        match job {
            PersistJob::Tick(tick) => {
                if let Err(e) = self.store.insert_tick(&tick).await {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(collector = %self.name, symbol = %tick.symbol, error = %e, "failed to store tick");
                }
            }
            PersistJob::Bar(bar) => match self.store.upsert_bar(&bar).await {
                Ok(()) => {
                    let previous = self
                        .stored_windows
                        .lock()
                        .insert(bar.instrument_token, bar.window_start);
                    if previous != Some(bar.window_start) {
                        self.counters.bars_created.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(collector = %self.name, symbol = %bar.symbol, window = %bar.window_start, "bar stored");
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(collector = %self.name, symbol = %bar.symbol, error = %e, "failed to store bar");
                }
            },
        }
    }
}

async fn event_loop(inner: Arc<CollectorInner>, mut rx: mpsc::Receiver<SourceEvent>) {
    while let Some(event) = rx.recv().await {
        inner.handle_event(event);
    }
    debug!(collector = %inner.name, "event loop drained");
}

async fn flush_loop(inner: Arc<CollectorInner>, cancel: CancellationToken) {
    let tf = inner.options.timeframe;
    let now = inner.clock.now();
    let next_boundary = tf.window_end(tf.window_start(now));
    let first = Instant::now() + inner.clock.until(next_boundary);

    let mut ticker = interval_at(first, inner.options.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let flushed = inner.flush_elapsed();
                if flushed > 0 {
                    debug!(collector = %inner.name, bars = flushed, "periodic flush");
                }
            }
        }
    }
}

async fn persist_loop(inner: Arc<CollectorInner>, mut rx: mpsc::Receiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        inner.write(job).await;
    }
    debug!(collector = %inner.name, "persistence queue drained");
}

// =============================================================================
// Tests
// =============================================================================
