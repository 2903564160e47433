// =============================================================================
// Streaming WebSocket handler
// =============================================================================
//
// Clients connect to `/api/v1/stream/ws` and receive:
//   1. A `connected` acknowledgement.
//   2. `tick` / `bar` messages for the symbols they subscribed to, and every
//      `status` broadcast.
//
// Each connection runs a write loop (outbound queue + keepalive pings, each
// send bounded by the write timeout) and a read loop (control frames, bounded
// by the read deadline). Either loop ending tears the session down.
// =============================================================================

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppContext;
use crate::storage::MarketStore;
use crate::stream::{ControlAction, HubConfig, SessionControl, StreamMessage};
use crate::types::Timeframe;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

async fn handle_connection(socket: WebSocket, ctx: AppContext) {
    let (control, outbound) = ctx.hub.connect().into_parts();
    let client = control.id();
    let config = ctx.hub.config().clone();
    info!(client = %client, "stream client connected");

    let (sender, receiver) = socket.split();
    let closed = control.closed();

    let writer = tokio::spawn(write_loop(sender, outbound, config.clone(), closed.clone()));
    read_loop(receiver, &control, ctx.store.as_ref(), &config, &closed).await;

    // Dropping the control half unregisters the session and fires `closed`,
    // which stops the writer.
    drop(control);
    if let Err(e) = writer.await {
        warn!(client = %client, error = %e, "stream writer ended abnormally");
    }
    info!(client = %client, "stream client disconnected");
}

async fn write_loop<S>(
    mut sender: S,
    mut outbound: mpsc::Receiver<Arc<StreamMessage>>,
    config: HubConfig,
    closed: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut keepalive = interval_at(Instant::now() + config.keepalive, config.keepalive);

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => Message::Text(msg.to_json()),
                None => break,
            },
            _ = keepalive.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "stream send failed");
                break;
            }
            Err(_) => {
                warn!("stream write deadline exceeded");
                break;
            }
        }
    }

    let _ = timeout(config.write_timeout, sender.send(Message::Close(None))).await;
    closed.cancel();
}

async fn read_loop<R, E>(
    mut receiver: R,
    control: &SessionControl,
    store: &dyn MarketStore,
    config: &HubConfig,
    closed: &CancellationToken,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        // Any inbound frame, pongs included, extends the deadline.
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = timeout(config.read_deadline, receiver.next()) => next,
        };

        match next {
            Err(_) => {
                info!(client = %control.id(), "stream read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client = %control.id(), error = %e, "stream receive error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if let ControlAction::SendLatest(symbols) = control.handle_control(&text) {
                    send_latest(control, store, &symbols).await;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn send_latest(control: &SessionControl, store: &dyn MarketStore, symbols: &[String]) {
    for symbol in symbols {
        match store.latest_bar(symbol, Timeframe::M1).await {
            Ok(Some(bar)) => {
                control.send(StreamMessage::bar(&bar, chrono::Utc::now()));
            }
            Ok(None) => {}
            Err(e) => {
                control.send(StreamMessage::error(format!("latest bar for {symbol}: {e}")));
            }
        }
    }
}
