// =============================================================================
// Streaming wire messages
// =============================================================================
//
// Server -> client: `{type, symbol?, data, timestamp}` JSON text frames.
// Client -> server: `{type: "subscribe"|"unsubscribe"|"get_latest", symbols}`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Bar, CollectorKind, ConnectionState, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connected,
    Subscribed,
    Unsubscribed,
    Tick,
    Bar,
    Status,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// `None` means the message is for every connected client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    pub fn tick(tick: &Tick) -> Self {
        Self {
            kind: MessageKind::Tick,
            symbol: Some(tick.symbol.clone()),
            data: serde_json::to_value(tick).unwrap_or(Value::Null),
            timestamp: tick.timestamp,
        }
    }

    pub fn bar(bar: &Bar, at: DateTime<Utc>) -> Self {
        Self {
            kind: MessageKind::Bar,
            symbol: Some(bar.symbol.clone()),
            data: serde_json::to_value(bar).unwrap_or(Value::Null),
            timestamp: at,
        }
    }

    pub fn status(
        collector: &str,
        kind: CollectorKind,
        state: ConnectionState,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: MessageKind::Status,
            symbol: None,
            data: json!({
                "collector": collector,
                "kind": kind,
                "state": state,
                "detail": detail,
            }),
            timestamp: at,
        }
    }

    pub fn connected(client_id: &str) -> Self {
        Self {
            kind: MessageKind::Connected,
            symbol: None,
            data: json!({
                "message": "Connected to Market Bridge streaming",
                "server": "market-bridge",
                "version": env!("CARGO_PKG_VERSION"),
                "client_id": client_id,
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn subscribed(symbols: &[String]) -> Self {
        Self {
            kind: MessageKind::Subscribed,
            symbol: None,
            data: json!({ "symbols": symbols, "count": symbols.len() }),
            timestamp: Utc::now(),
        }
    }

    pub fn unsubscribed(symbols: &[String]) -> Self {
        Self {
            kind: MessageKind::Unsubscribed,
            symbol: None,
            data: json!({ "symbols": symbols }),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            symbol: None,
            data: json!({ "message": message.into() }),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Client control message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Latest stored bar for each subscribed symbol.
    GetLatest,
}
