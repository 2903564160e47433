// =============================================================================
// LiveSource -- upstream broker session with auto-reconnect
// =============================================================================
//
// One task owns the upstream session. It connects, re-issues the full
// subscription set, pumps ticks into the event sink and, when the session
// drops, retries with capped exponential backoff. The subscription set lives
// outside the task so it survives reconnects.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::market_data::source::{EventSink, SourceEvent, TickSource};
use crate::types::{CollectorKind, Instrument, MarketClock, Side, StreamMode, Tick};

// =============================================================================
// Upstream collaborator
// =============================================================================

/// A tick as decoded from the upstream wire, before instrument enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTick {
    pub token: u32,
    pub price: f64,
    pub quantity: u64,
    pub open_interest: Option<u64>,
    pub exchange_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Ticks(Vec<RawTick>),
    Heartbeat,
    /// Text notice from the upstream (order updates, errors, etc.).
    Notice(String),
}

/// An open streaming session. `next_event` must be cancel-safe.
#[async_trait]
pub trait UpstreamSession: Send {
    async fn subscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError>;
    async fn unsubscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError>;
    async fn set_mode(&mut self, mode: StreamMode, tokens: &[u32]) -> Result<(), SourceError>;
    /// `None` when the session is closed by the remote end.
    async fn next_event(&mut self) -> Option<Result<UpstreamEvent, SourceError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, SourceError>;
}

// =============================================================================
// Reconnect policy
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): the base delay doubled
    /// per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

// =============================================================================
// LiveSource
// =============================================================================

#[derive(Debug)]
enum SessionCommand {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

pub struct LiveSource {
    name: String,
    connector: Arc<dyn UpstreamConnector>,
    policy: ReconnectPolicy,
    mode: StreamMode,
    clock: Arc<MarketClock>,
    instruments: Arc<RwLock<BTreeMap<u32, Instrument>>>,
    running: Mutex<Option<Running>>,
}

impl LiveSource {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn UpstreamConnector>,
        policy: ReconnectPolicy,
        mode: StreamMode,
        clock: Arc<MarketClock>,
    ) -> Self {
        Self {
            name: name.into(),
            connector,
            policy,
            mode,
            clock,
            instruments: Arc::new(RwLock::new(BTreeMap::new())),
            running: Mutex::new(None),
        }
    }

    fn send_command(&self, cmd: SessionCommand) {
        if let Some(running) = self.running.lock().as_ref() {
            // Receiver gone means the task already exited; the set is
            // re-issued on the next start anyway.
            let _ = running.commands.send(cmd);
        }
    }
}

#[async_trait]
impl TickSource for LiveSource {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Live
    }

    fn start(&self, sink: EventSink) -> Result<(), SourceError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SourceError::AlreadyRunning);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = SessionTask {
            name: self.name.clone(),
            connector: self.connector.clone(),
            policy: self.policy,
            mode: self.mode,
            clock: self.clock.clone(),
            instruments: self.instruments.clone(),
            sink,
            commands: cmd_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        *running = Some(Running {
            cancel,
            handle,
            commands: cmd_tx,
        });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!(source = %self.name, error = %e, "live source task ended abnormally");
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
        let mut added = Vec::new();
        {
            let mut map = self.instruments.write();
            for inst in instruments {
                if map.insert(inst.token, inst.clone()).is_none() {
                    added.push(inst.token);
                }
            }
        }
        if !added.is_empty() {
            self.send_command(SessionCommand::Subscribe(added));
        }
    }

    fn unsubscribe(&self, instruments: &[Instrument]) {
        let mut removed = Vec::new();
        {
            let mut map = self.instruments.write();
            for inst in instruments {
                if map.remove(&inst.token).is_some() {
                    removed.push(inst.token);
                }
            }
        }
        if !removed.is_empty() {
            self.send_command(SessionCommand::Unsubscribe(removed));
        }
    }

    fn subscriptions(&self) -> Vec<Instrument> {
        self.instruments.read().values().cloned().collect()
    }
}

// =============================================================================
// Session task
// =============================================================================

enum PumpExit {
    Cancelled,
    Closed(String),
}

struct SessionTask {
    name: String,
    connector: Arc<dyn UpstreamConnector>,
    policy: ReconnectPolicy,
    mode: StreamMode,
    clock: Arc<MarketClock>,
    instruments: Arc<RwLock<BTreeMap<u32, Instrument>>>,
    sink: EventSink,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            info!(source = %self.name, attempt, "connecting upstream session");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.connector.connect() => res,
            };

            match connected {
                Ok(mut session) => match self.resubscribe(session.as_mut()).await {
                    Ok(count) => {
                        attempt = 0;
                        info!(source = %self.name, instruments = count, "upstream session connected");
                        self.sink.emit(SourceEvent::Connected { instruments: count });

                        match self.pump(session.as_mut()).await {
                            PumpExit::Cancelled => {
                                session.close().await;
                                break;
                            }
                            PumpExit::Closed(reason) => {
                                warn!(source = %self.name, reason = %reason, "upstream session closed");
                                self.sink.emit(SourceEvent::Disconnected { reason });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(source = %self.name, error = %e, "resubscribe failed");
                        session.close().await;
                        self.sink.emit(SourceEvent::Disconnected {
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    warn!(source = %self.name, error = %e, "upstream connect failed");
                    self.sink.emit(SourceEvent::Error(e.to_string()));
                }
            }

            attempt += 1;
            if attempt > self.policy.max_retries {
                warn!(source = %self.name, attempts = self.policy.max_retries, "reconnect attempts exhausted");
                self.sink.emit(SourceEvent::ReconnectExhausted {
                    attempts: self.policy.max_retries,
                });
                break;
            }

            let delay = self.policy.delay_for(attempt);
            info!(source = %self.name, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            self.sink.emit(SourceEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(source = %self.name, "live source task exited");
    }

    /// Re-issue the whole current set. Queued commands are superseded by it.
    async fn resubscribe(&mut self, session: &mut dyn UpstreamSession) -> Result<usize, SourceError> {
        while self.commands.try_recv().is_ok() {}

        let tokens: Vec<u32> = self.instruments.read().keys().copied().collect();
        if tokens.is_empty() {
            return Ok(0);
        }
        session.subscribe(&tokens).await?;
        session.set_mode(self.mode, &tokens).await?;
        Ok(tokens.len())
    }

    async fn pump(&mut self, session: &mut dyn UpstreamSession) -> PumpExit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,

                Some(cmd) = self.commands.recv() => {
                    let res = match &cmd {
                        SessionCommand::Subscribe(tokens) => {
                            match session.subscribe(tokens).await {
                                Ok(()) => session.set_mode(self.mode, tokens).await,
                                Err(e) => Err(e),
                            }
                        }
                        SessionCommand::Unsubscribe(tokens) => session.unsubscribe(tokens).await,
                    };
                    if let Err(e) = res {
                        return PumpExit::Closed(format!("command {cmd:?} failed: {e}"));
                    }
                }

                event = session.next_event() => match event {
                    None => return PumpExit::Closed("closed by upstream".into()),
                    Some(Ok(UpstreamEvent::Ticks(raw))) => self.forward_ticks(raw),
                    Some(Ok(UpstreamEvent::Heartbeat)) => {}
                    Some(Ok(UpstreamEvent::Notice(text))) => {
                        debug!(source = %self.name, notice = %text, "upstream notice");
                    }
                    Some(Err(SourceError::Decode(msg))) => {
                        warn!(source = %self.name, error = %msg, "dropping undecodable frame");
                        self.sink.emit(SourceEvent::Error(msg));
                    }
                    Some(Err(e)) => return PumpExit::Closed(e.to_string()),
                },
            }
        }
    }

    fn forward_ticks(&self, raw: Vec<RawTick>) {
        let instruments = self.instruments.read();
        for r in raw {
            let Some(inst) = instruments.get(&r.token) else {
                debug!(source = %self.name, token = r.token, "tick for unsubscribed token");
                continue;
            };
            let tick = Tick {
                exchange: inst.exchange.clone(),
                symbol: inst.symbol.clone(),
                instrument_token: r.token,
                timestamp: r.exchange_time.unwrap_or_else(|| self.clock.now()),
                price: r.price,
                quantity: r.quantity,
                side: Side::Unknown,
                open_interest: r.open_interest,
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
    use crate::market_data::source::mock::{MockConnector, SessionCall};
    use std::sync::atomic::AtomicU64;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_retries: 3,
        }
    }

    fn source(connector: Arc<MockConnector>) -> LiveSource {
        LiveSource::new(
            "test",
            connector,
            policy(),
            StreamMode::Full,
            Arc::new(MarketClock::new()),
        )
    }

    fn sink() -> (EventSink, mpsc::Receiver<SourceEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (EventSink::new(tx, Arc::new(AtomicU64::new(0))), rx)
    }

    async fn wait_connected(rx: &mut mpsc::Receiver<SourceEvent>) {
        loop {
            match rx.recv().await {
                Some(SourceEvent::Connected { .. }) => return,
                Some(_) => continue,
                None => panic!("sink closed before connect"),
            }
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(9), Duration::from_millis(400));
        assert_eq!(p.delay_for(200), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_exactly_prior_set() {
        let connector = Arc::new(MockConnector::new());
        let first = connector.push_session();
        let second = connector.push_session();
        let src = source(connector.clone());

        let a = Instrument::new("NSE", "RELIANCE", 738561);
        let b = Instrument::new("NSE", "TCS", 2953217);
        let c = Instrument::new("NSE", "INFY", 408065);
        src.subscribe(&[a.clone(), b.clone()]);

        let (sink, mut rx) = sink();
        src.start(sink).unwrap();
        wait_connected(&mut rx).await;

        src.subscribe(&[c.clone()]);
        src.unsubscribe(&[a.clone()]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Mid-window drop.
        first.close();
        wait_connected(&mut rx).await;

        let calls = second.calls();
        assert_eq!(
            calls.first(),
            Some(&SessionCall::Subscribe(vec![c.token, b.token]))
        );
        assert_eq!(
            calls.get(1),
            Some(&SessionCall::SetMode(StreamMode::Full, vec![c.token, b.token]))
        );

        let first_calls = first.calls();
        assert!(first_calls.contains(&SessionCall::Subscribe(vec![c.token])));
        assert!(first_calls.contains(&SessionCall::Unsubscribe(vec![a.token])));

        src.stop().await;
        assert!(!src.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_emit_terminal_event() {
        let connector = Arc::new(MockConnector::new());
        let src = source(connector);
        let (sink, mut rx) = sink();
        src.start(sink).unwrap();

        let mut delays = Vec::new();
        let exhausted = loop {
            match rx.recv().await {
                Some(SourceEvent::Reconnecting { delay, .. }) => delays.push(delay),
                Some(SourceEvent::ReconnectExhausted { attempts }) => break attempts,
                Some(_) => {}
                None => panic!("sink closed without terminal event"),
            }
        };

        assert_eq!(exhausted, 3);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        // Task exits and drops the sink.
        assert!(rx.recv().await.is_none());
        assert!(!src.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_enriched_from_subscription_set() {
        let connector = Arc::new(MockConnector::new());
        let session = connector.push_session();
        let src = source(connector);
        src.subscribe(&[Instrument::new("NSE", "SBIN", 779521)]);

        let (sink, mut rx) = sink();
        src.start(sink).unwrap();
        wait_connected(&mut rx).await;

        session.send(UpstreamEvent::Ticks(vec![
            RawTick {
                token: 779521,
                price: 751.5,
                quantity: 10,
                open_interest: None,
                exchange_time: None,
            },
            RawTick {
                token: 1,
                price: 1.0,
                quantity: 1,
                open_interest: None,
                exchange_time: None,
            },
        ]));

        match rx.recv().await {
            Some(SourceEvent::Tick(t)) => {
                assert_eq!(t.symbol, "SBIN");
                assert_eq!(t.exchange, "NSE");
                assert_eq!(t.price, 751.5);
                assert_eq!(t.side, Side::Unknown);
            }
            other => panic!("expected tick, got {other:?}"),
        }

        src.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let connector = Arc::new(MockConnector::new());
        let _session = connector.push_session();
        let src = source(connector);
        let (sink1, _rx1) = sink();
        let (sink2, _rx2) = sink();
        src.start(sink1).unwrap();
        assert!(matches!(src.start(sink2), Err(SourceError::AlreadyRunning)));
        src.stop().await;
    }
}
