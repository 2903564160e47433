// =============================================================================
// DistributionHub -- single-process fan-out to websocket sessions
// =============================================================================
//
// Publishers push into a bounded inbox; one dispatch loop drains it and
// delivers to each session whose subscription set matches the message
// symbol. Delivery uses `try_send` on the session's bounded queue: a full
// queue evicts that session instead of stalling everyone else.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stream::messages::{ControlMessage, StreamMessage};

pub type ClientId = Uuid;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub client_queue: usize,
    pub inbox: usize,
    pub keepalive: Duration,
    pub read_deadline: Duration,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue: 256,
            inbox: 256,
            keepalive: Duration::from_secs(54),
            read_deadline: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected_clients: usize,
    pub published: u64,
    pub delivered: u64,
    /// Messages lost because the inbox was full.
    pub dropped: u64,
    /// Sessions removed because their queue was full.
    pub evicted: u64,
    pub inbox_capacity: usize,
}

pub struct ClientHandle {
    id: ClientId,
    connected_at: DateTime<Utc>,
    subscriptions: RwLock<HashSet<String>>,
    outbound: mpsc::Sender<Arc<StreamMessage>>,
    closed: CancellationToken,
}

impl ClientHandle {
    fn wants(&self, msg: &StreamMessage) -> bool {
        match &msg.symbol {
            Some(symbol) => self.subscriptions.read().contains(symbol),
            None => true,
        }
    }
}

pub struct DistributionHub {
    config: HubConfig,
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    inbox_tx: mpsc::Sender<Arc<StreamMessage>>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Arc<StreamMessage>>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl DistributionHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox.max(1));
        Arc::new(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Queue a message for fan-out. Never blocks.
    pub fn publish(&self, msg: StreamMessage) {
        match self.inbox_tx.try_send(Arc::new(msg)) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Dispatch loop. Runs until `cancel` fires; only the first call gets
    /// the inbox.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut inbox) = self.inbox_rx.lock().take() else {
            warn!("distribution hub dispatch loop already running");
            return;
        };
        info!("distribution hub dispatch loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        self.fan_out(&msg);
                    }
                    None => break,
                },
            }
        }

        let ids: Vec<ClientId> = self.clients.read().keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        info!("distribution hub dispatch loop stopped");
    }

    /// Deliver one message to every interested session. Returns the number
    /// of sessions it reached.
    pub fn fan_out(&self, msg: &Arc<StreamMessage>) -> usize {
        let snapshot: Vec<Arc<ClientHandle>> = self.clients.read().values().cloned().collect();

        let mut delivered = 0;
        let mut overflowed = Vec::new();
        for client in snapshot {
            if !client.wants(msg) {
                continue;
            }
            match client.outbound.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(client.id),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.disconnect(client.id);
                }
            }
        }

        for id in overflowed {
            warn!(client = %id, "client queue full, disconnecting");
            if self.disconnect(id) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Register a new session. The connection acknowledgement is already
    /// queued when this returns.
    pub fn connect(self: &Arc<Self>) -> ClientSession {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.client_queue.max(1));
        let _ = tx.try_send(Arc::new(StreamMessage::connected(&id.to_string())));

        let handle = Arc::new(ClientHandle {
            id,
            connected_at: Utc::now(),
            subscriptions: RwLock::new(HashSet::new()),
            outbound: tx,
            closed: CancellationToken::new(),
        });
        let total = {
            let mut clients = self.clients.write();
            clients.insert(id, handle.clone());
            clients.len()
        };
        info!(client = %id, total, "client connected");

        ClientSession {
            control: SessionControl {
                hub: self.clone(),
                handle,
            },
            outbound: rx,
        }
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(handle) => {
                handle.closed.cancel();
                let secs = (Utc::now() - handle.connected_at).num_seconds();
                info!(client = %id, connected_secs = secs, "client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected_clients: self.client_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            inbox_capacity: self.config.inbox.max(1),
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// A connected client: control half plus its outbound queue.
pub struct ClientSession {
    control: SessionControl,
    outbound: mpsc::Receiver<Arc<StreamMessage>>,
}

impl ClientSession {
    pub fn id(&self) -> ClientId {
        self.control.id()
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    pub fn into_parts(self) -> (SessionControl, mpsc::Receiver<Arc<StreamMessage>>) {
        (self.control, self.outbound)
    }
}

/// What the connection handler should do after a control frame.
#[derive(Debug)]
pub enum ControlAction {
    /// Already answered on the session's own queue.
    Handled,
    /// Send the latest stored bar for each of these symbols.
    SendLatest(Vec<String>),
}

/// Per-session control surface. Dropping it disconnects the session.
pub struct SessionControl {
    hub: Arc<DistributionHub>,
    handle: Arc<ClientHandle>,
}

impl SessionControl {
    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    /// Fires when the hub drops this session.
    pub fn closed(&self) -> CancellationToken {
        self.handle.closed.clone()
    }

    pub fn subscribe(&self, symbols: &[String]) -> Vec<String> {
        let normalized = normalize(symbols);
        {
            let mut subs = self.handle.subscriptions.write();
            for s in &normalized {
                subs.insert(s.clone());
            }
        }
        debug!(client = %self.handle.id, symbols = ?normalized, "client subscribed");
        normalized
    }

    pub fn unsubscribe(&self, symbols: &[String]) -> Vec<String> {
        let normalized = normalize(symbols);
        {
            let mut subs = self.handle.subscriptions.write();
            for s in &normalized {
                subs.remove(s);
            }
        }
        debug!(client = %self.handle.id, symbols = ?normalized, "client unsubscribed");
        normalized
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut out: Vec<String> = self.handle.subscriptions.read().iter().cloned().collect();
        out.sort();
        out
    }

    /// Queue a message for this session only, bypassing the symbol filter.
    pub fn send(&self, msg: StreamMessage) -> bool {
        self.handle.outbound.try_send(Arc::new(msg)).is_ok()
    }

    /// Apply one client text frame. Bad input is answered with an `error`
    /// message, never an Err.
    pub fn handle_control(&self, text: &str) -> ControlAction {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Subscribe { symbols }) => {
                let added = self.subscribe(&symbols);
                self.send(StreamMessage::subscribed(&added));
                ControlAction::Handled
            }
            Ok(ControlMessage::Unsubscribe { symbols }) => {
                let removed = self.unsubscribe(&symbols);
                self.send(StreamMessage::unsubscribed(&removed));
                ControlAction::Handled
            }
            Ok(ControlMessage::GetLatest) => ControlAction::SendLatest(self.subscriptions()),
            Err(e) => {
                debug!(client = %self.handle.id, error = %e, "invalid control message");
                self.send(StreamMessage::error(format!("invalid message: {e}")));
                ControlAction::Handled
            }
        }
    }
}

impl Drop for SessionControl {
    fn drop(&mut self) {
        self.hub.disconnect(self.handle.id);
    }
}

fn normalize(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::messages::MessageKind;
    use crate::types::{Side, Tick};

    fn tick(symbol: &str) -> StreamMessage {
        StreamMessage::tick(&Tick {
            exchange: "NSE".into(),
            symbol: symbol.into(),
            instrument_token: 1,
            timestamp: Utc::now(),
            price: 100.0,
            quantity: 1,
            side: Side::Unknown,
            open_interest: None,
        })
    }

    fn hub_with_queue(queue: usize) -> Arc<DistributionHub> {
        DistributionHub::new(HubConfig {
            client_queue: queue,
            inbox: 64,
            ..HubConfig::default()
        })
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<StreamMessage>>) -> Vec<Arc<StreamMessage>> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn connect_queues_acknowledgement_first() {
        let hub = hub_with_queue(8);
        let session = hub.connect();
        let (_control, mut rx) = session.into_parts();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, MessageKind::Connected);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn delivers_only_to_subscribed_sessions() {
        let hub = hub_with_queue(8);
        let (a, mut a_rx) = hub.connect().into_parts();
        let (b, mut b_rx) = hub.connect().into_parts();
        a.subscribe(&["x".to_string()]);
        b.subscribe(&["Y".to_string()]);
        drain(&mut a_rx);
        drain(&mut b_rx);

        let reached = hub.fan_out(&Arc::new(tick("X")));
        assert_eq!(reached, 1);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut b_rx).is_empty());

        // Symbol-less messages go to everyone.
        hub.fan_out(&Arc::new(StreamMessage::error("broadcast")));
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn saturated_session_is_evicted_without_stalling_others() {
        let hub = hub_with_queue(4);
        let (slow, _slow_rx) = hub.connect().into_parts();
        let (fast, mut fast_rx) = hub.connect().into_parts();
        slow.subscribe(&["RELIANCE".to_string()]);
        fast.subscribe(&["RELIANCE".to_string()]);
        let slow_closed = slow.closed();

        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(hub.clone().run(cancel.clone()));

        let received = tokio::time::timeout(Duration::from_secs(2), async {
            let mut ticks = 0;
            for _ in 0..20 {
                hub.publish(tick("RELIANCE"));
                // Keep the healthy session drained.
                while let Some(msg) = fast_rx.recv().await {
                    if msg.kind == MessageKind::Tick {
                        ticks += 1;
                        break;
                    }
                }
            }
            ticks
        })
        .await
        .expect("healthy session stalled");

        assert_eq!(received, 20);
        assert!(slow_closed.is_cancelled());
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.stats().evicted, 1);

        cancel.cancel();
        dispatch.await.unwrap();
        drop(fast);
    }

    #[test]
    fn dropping_control_disconnects() {
        let hub = hub_with_queue(4);
        let session = hub.connect();
        assert_eq!(hub.client_count(), 1);
        drop(session);
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn control_frames_update_subscriptions_and_reply() {
        let hub = hub_with_queue(8);
        let (ctl, mut rx) = hub.connect().into_parts();
        drain(&mut rx);

        assert!(matches!(
            ctl.handle_control(r#"{"type":"subscribe","symbols":["infy"," tcs "]}"#),
            ControlAction::Handled
        ));
        assert_eq!(ctl.subscriptions(), vec!["INFY".to_string(), "TCS".to_string()]);
        assert_eq!(drain(&mut rx)[0].kind, MessageKind::Subscribed);

        ctl.handle_control(r#"{"type":"unsubscribe","symbols":["TCS"]}"#);
        assert_eq!(ctl.subscriptions(), vec!["INFY".to_string()]);
        assert_eq!(drain(&mut rx)[0].kind, MessageKind::Unsubscribed);

        match ctl.handle_control(r#"{"type":"get_latest"}"#) {
            ControlAction::SendLatest(symbols) => assert_eq!(symbols, vec!["INFY".to_string()]),
            other => panic!("unexpected {other:?}"),
        }

        ctl.handle_control("not json");
        assert_eq!(drain(&mut rx)[0].kind, MessageKind::Error);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn full_inbox_counts_drops() {
        let hub = DistributionHub::new(HubConfig {
            inbox: 2,
            ..HubConfig::default()
        });
        for _ in 0..5 {
            hub.publish(tick("A"));
        }
        let stats = hub.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dropped, 3);
    }
}
