// =============================================================================
// Tick sources
// =============================================================================
//
// A tick source pushes `SourceEvent`s into a bounded channel owned by its
// collector. Two implementations share the trait: `LiveSource` (upstream
// broker session with reconnect) and `SyntheticSource` (random walk).
// =============================================================================

pub mod kite;
pub mod live;
pub mod synthetic;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::types::{CollectorKind, Instrument, Tick};

pub use live::{LiveSource, ReconnectPolicy, UpstreamConnector};
pub use synthetic::SyntheticSource;

/// Lifecycle and data events emitted by a tick source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// (Re)connected; the full subscription set has been re-issued.
    Connected { instruments: usize },
    Tick(Tick),
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { reason: String },
    /// Retry budget spent. The source task has exited.
    ReconnectExhausted { attempts: u32 },
    /// Non-fatal upstream problem.
    Error(String),
}

/// Sending half handed to a source on `start`. Never blocks: when the
/// collector falls behind, events are dropped and counted.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SourceEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SourceEvent>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    /// Returns `false` if the event was not delivered.
    pub fn emit(&self, event: SourceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait TickSource: Send + Sync {
    fn kind(&self) -> CollectorKind;

    /// Spawn the source task. Events flow into `sink` until `stop`.
    fn start(&self, sink: EventSink) -> Result<(), SourceError>;

    /// Stop the source task and wait until it has exited. Once this returns
    /// no further events are emitted and the sink has been dropped.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Add instruments to the subscription set. Takes effect on the live
    /// session immediately when connected, otherwise on the next connect.
    fn subscribe(&self, instruments: &[Instrument]);

    fn unsubscribe(&self, instruments: &[Instrument]);

    /// Current subscription set, ordered by token.
    fn subscriptions(&self) -> Vec<Instrument>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_counts_drops_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = EventSink::new(tx, dropped.clone());

        assert!(sink.emit(SourceEvent::Error("a".into())));
        assert!(!sink.emit(SourceEvent::Error("b".into())));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        assert!(sink.is_closed());
        assert!(!sink.emit(SourceEvent::Error("x".into())));
    }
}
