// Scripted upstream used by source, collector and registry tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::market_data::source::live::{UpstreamConnector, UpstreamEvent, UpstreamSession};
use crate::types::StreamMode;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    SetMode(StreamMode, Vec<u32>),
    Close,
}

/// Test-side handle to one scripted session.
#[derive(Clone)]
pub struct MockHandle {
    calls: Arc<Mutex<Vec<SessionCall>>>,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>>,
}

impl MockHandle {
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    pub fn send(&self, event: UpstreamEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Simulate the remote end dropping the connection.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

struct MockSession {
    calls: Arc<Mutex<Vec<SessionCall>>>,
    rx: mpsc::UnboundedReceiver<UpstreamEvent>,
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn subscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError> {
        self.calls.lock().push(SessionCall::Subscribe(tokens.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError> {
        self.calls.lock().push(SessionCall::Unsubscribe(tokens.to_vec()));
        Ok(())
    }

    async fn set_mode(&mut self, mode: StreamMode, tokens: &[u32]) -> Result<(), SourceError> {
        self.calls.lock().push(SessionCall::SetMode(mode, tokens.to_vec()));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<UpstreamEvent, SourceError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.calls.lock().push(SessionCall::Close);
    }
}

/// Hands out pre-scripted sessions in order; fails to connect once they run
/// out.
#[derive(Default)]
pub struct MockConnector {
    sessions: Mutex<VecDeque<MockSession>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self) -> MockHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        self.sessions.lock().push_back(MockSession {
            calls: calls.clone(),
            rx,
        });
        MockHandle {
            calls,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, SourceError> {
        match self.sessions.lock().pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(SourceError::Connect("no scripted session left".into())),
        }
    }
}
