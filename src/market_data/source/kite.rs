// =============================================================================
// Kite Connect ticker session
// =============================================================================
//
// Websocket at `wss://ws.kite.trade?api_key=..&access_token=..`.
// Client commands are JSON text frames:
//   {"a":"subscribe","v":[738561]}
//   {"a":"mode","v":["full",[738561]]}
// Market data arrives as binary frames:
//   [u16 packet count] ([u16 length] [packet])*
// All integers are big-endian. A single-byte frame is a heartbeat.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::SourceError;
use crate::market_data::source::live::{RawTick, UpstreamConnector, UpstreamEvent, UpstreamSession};
use crate::types::StreamMode;

pub const DEFAULT_KITE_WS_URL: &str = "wss://ws.kite.trade";

// Packet sizes.
const LTP_PACKET: usize = 8;
const INDEX_QUOTE_PACKET: usize = 28;
const INDEX_FULL_PACKET: usize = 32;
const QUOTE_PACKET: usize = 44;
const FULL_PACKET: usize = 184;

// Exchange segments (low byte of the instrument token).
const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;

#[derive(Debug, Clone)]
pub struct KiteConnector {
    ws_url: String,
    api_key: String,
    access_token: String,
}

impl KiteConnector {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl UpstreamConnector for KiteConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, SourceError> {
        let url = format!(
            "{}?api_key={}&access_token={}",
            self.ws_url, self.api_key, self.access_token
        );
        info!(url = %self.ws_url, "connecting to Kite ticker");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        Ok(Box::new(KiteSession { ws }))
    }
}

pub struct KiteSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl KiteSession {
    async fn send_json(&mut self, value: serde_json::Value) -> Result<(), SourceError> {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .map_err(|e| SourceError::Send(e.to_string()))
    }
}

#[async_trait]
impl UpstreamSession for KiteSession {
    async fn subscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError> {
        self.send_json(json!({ "a": "subscribe", "v": tokens })).await
    }

    async fn unsubscribe(&mut self, tokens: &[u32]) -> Result<(), SourceError> {
        self.send_json(json!({ "a": "unsubscribe", "v": tokens })).await
    }

    async fn set_mode(&mut self, mode: StreamMode, tokens: &[u32]) -> Result<(), SourceError> {
        self.send_json(json!({ "a": "mode", "v": [mode.as_str(), tokens] }))
            .await
    }

    async fn next_event(&mut self) -> Option<Result<UpstreamEvent, SourceError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(SourceError::Connect(e.to_string()))),
            };
            match msg {
                Message::Binary(data) if data.len() <= 1 => {
                    return Some(Ok(UpstreamEvent::Heartbeat));
                }
                Message::Binary(data) => {
                    return Some(decode_frame(&data).map(UpstreamEvent::Ticks));
                }
                Message::Text(text) => return Some(Ok(UpstreamEvent::Notice(text))),
                Message::Close(frame) => {
                    debug!(frame = ?frame, "Kite ticker sent close");
                    return None;
                }
                // Ping/Pong are answered by tungstenite.
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// =============================================================================
// Binary decoding
// =============================================================================

/// Decode one binary market-data frame into raw ticks.
pub fn decode_frame(data: &[u8]) -> Result<Vec<RawTick>, SourceError> {
    let count = read_u16(data, 0)? as usize;
    let mut offset = 2;
    let mut ticks = Vec::with_capacity(count);

    for i in 0..count {
        let len = read_u16(data, offset)? as usize;
        offset += 2;
        let packet = data.get(offset..offset + len).ok_or_else(|| {
            SourceError::Decode(format!("packet {i} truncated: need {len} bytes at {offset}"))
        })?;
        offset += len;

        if let Some(tick) = decode_packet(packet)? {
            ticks.push(tick);
        }
    }
    Ok(ticks)
}

fn decode_packet(p: &[u8]) -> Result<Option<RawTick>, SourceError> {
    if p.len() < LTP_PACKET {
        return Err(SourceError::Decode(format!("packet too short: {} bytes", p.len())));
    }

    let token = read_u32(p, 0)?;
    let divisor = price_divisor(token);
    let price = read_i32(p, 4)? as f64 / divisor;

    let tick = match p.len() {
        LTP_PACKET | INDEX_QUOTE_PACKET => RawTick {
            token,
            price,
            quantity: 0,
            open_interest: None,
            exchange_time: None,
        },
        INDEX_FULL_PACKET => RawTick {
            token,
            price,
            quantity: 0,
            open_interest: None,
            exchange_time: epoch(read_u32(p, 28)?),
        },
        QUOTE_PACKET => RawTick {
            token,
            price,
            quantity: read_u32(p, 8)? as u64,
            open_interest: None,
            exchange_time: None,
        },
        n if n >= FULL_PACKET => RawTick {
            token,
            price,
            quantity: read_u32(p, 8)? as u64,
            open_interest: Some(read_u32(p, 48)? as u64),
            exchange_time: epoch(read_u32(p, 60)?).or(epoch(read_u32(p, 44)?)),
        },
        n => {
            debug!(token, len = n, "skipping packet with unknown layout");
            return Ok(None);
        }
    };
    Ok(Some(tick))
}

fn price_divisor(token: u32) -> f64 {
    match token & 0xff {
        SEGMENT_CDS => 10_000_000.0,
        SEGMENT_BCD => 10_000.0,
        _ => 100.0,
    }
}

fn epoch(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, SourceError> {
    buf.get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or_else(|| SourceError::Decode(format!("u16 out of range at {at}")))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, SourceError> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| SourceError::Decode(format!("u32 out of range at {at}")))
}

fn read_i32(buf: &[u8], at: usize) -> Result<i32, SourceError> {
    read_u32(buf, at).map(|v| v as i32)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut out = (packets.len() as u16).to_be_bytes().to_vec();
        for p in packets {
            out.extend_from_slice(&(p.len() as u16).to_be_bytes());
            out.extend_from_slice(p);
        }
        out
    }

    #[test]
    fn decodes_ltp_and_quote_packets() {
        let mut ltp = vec![0u8; LTP_PACKET];
        put_u32(&mut ltp, 0, 738561);
        put_u32(&mut ltp, 4, 250_075);

        let mut quote = vec![0u8; QUOTE_PACKET];
        put_u32(&mut quote, 0, 2953217);
        put_u32(&mut quote, 4, 350_010);
        put_u32(&mut quote, 8, 25);

        let ticks = decode_frame(&frame(&[ltp, quote])).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].token, 738561);
        assert!((ticks[0].price - 2500.75).abs() < 1e-9);
        assert_eq!(ticks[0].quantity, 0);
        assert_eq!(ticks[1].quantity, 25);
        assert!((ticks[1].price - 3500.10).abs() < 1e-9);
    }

    #[test]
    fn full_packet_carries_oi_and_exchange_time() {
        let mut full = vec![0u8; FULL_PACKET];
        put_u32(&mut full, 0, 12_345_602); // low byte 2 -> NFO, divisor 100
        put_u32(&mut full, 4, 10_050);
        put_u32(&mut full, 8, 75);
        put_u32(&mut full, 48, 1_200_000);
        put_u32(&mut full, 60, 1_700_000_000);

        let ticks = decode_frame(&frame(&[full])).unwrap();
        let t = &ticks[0];
        assert_eq!(t.open_interest, Some(1_200_000));
        assert_eq!(t.exchange_time.unwrap().timestamp(), 1_700_000_000);
        assert!((t.price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn currency_segment_uses_wider_divisor() {
        assert_eq!(price_divisor(0x0000_0103), 10_000_000.0);
        assert_eq!(price_divisor(0x0000_0106), 10_000.0);
        assert_eq!(price_divisor(738561), 100.0);
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let mut data = frame(&[vec![0u8; QUOTE_PACKET]]);
        data.truncate(20);
        assert!(matches!(decode_frame(&data), Err(SourceError::Decode(_))));
    }
}
