// =============================================================================
// Shared types used across the Market Bridge engine
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Instruments
// =============================================================================

/// A tradable symbol on a given exchange, identified by a stable numeric
/// token assigned by the broker.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub symbol: String,
    pub token: u32,
}

impl Instrument {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, token: u32) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            token,
        }
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// Aggressor side of a trade, when the feed reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Default for Side {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A single trade/quote event for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: String,
    pub symbol: String,
    pub instrument_token: u32,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub quantity: u64,
    #[serde(default)]
    pub side: Side,
    /// Only populated by full-mode derivative ticks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<u64>,
}

// =============================================================================
// Timeframes
// =============================================================================

/// Bar window size. Windows are aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl Timeframe {
    pub fn seconds(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M3 => 3 * 60,
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::M30 => 30 * 60,
            Self::H1 => 3600,
            Self::D1 => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds() as u64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    /// Start of the window containing `ts` (floor to the timeframe).
    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = secs.div_euclid(self.seconds()) * self.seconds();
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }

    /// Exclusive end of the window starting at `start`.
    pub fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + chrono::Duration::seconds(self.seconds())
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" | "minute" => Ok(Self::M1),
            "3m" | "3minute" => Ok(Self::M3),
            "5m" | "5minute" => Ok(Self::M5),
            "15m" | "15minute" => Ok(Self::M15),
            "30m" | "30minute" => Ok(Self::M30),
            "1h" | "60minute" => Ok(Self::H1),
            "1d" | "day" => Ok(Self::D1),
            other => Err(format!("unknown timeframe '{other}'")),
        }
    }
}

// =============================================================================
// Bars
// =============================================================================

/// Natural key of a bar. Re-flushing the same key is an upsert.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BarKey {
    pub exchange: String,
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub timeframe: Timeframe,
}

/// An aggregated OHLCV summary over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub exchange: String,
    pub symbol: String,
    pub instrument_token: u32,
    pub timeframe: Timeframe,
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<u64>,
    pub source: String,
}

impl Bar {
    pub fn key(&self) -> BarKey {
        BarKey {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            window_start: self.window_start,
            timeframe: self.timeframe,
        }
    }

    /// OHLC envelope invariant: high bounds open/close from above, low from
    /// below.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.low <= self.high
    }
}

// =============================================================================
// Collector & connection enums
// =============================================================================

/// Which tick source backs a collector.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    Live,
    Synthetic,
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Upstream streaming detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Ltp,
    Quote,
    Full,
}

impl Default for StreamMode {
    fn default() -> Self {
        Self::Full
    }
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

/// Tick source connection state as seen by its collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// =============================================================================
// MarketClock
// =============================================================================

/// Wall clock driven by tokio's monotonic clock.
///
/// Window arithmetic needs wall-clock timestamps, while sleeps and intervals
/// run on `tokio::time`. Anchoring one to the other keeps both consistent,
/// including under a paused test runtime.
#[derive(Debug)]
pub struct MarketClock {
    wall_origin: DateTime<Utc>,
    mono_origin: tokio::time::Instant,
}

impl MarketClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            mono_origin: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono_origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    /// Time left until `at`, zero if already past.
    pub fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for MarketClock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_floors_to_timeframe() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 17, 42).unwrap();
        assert_eq!(
            Timeframe::M1.window_start(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 17, 0).unwrap()
        );
        assert_eq!(
            Timeframe::M5.window_start(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap()
        );
        assert_eq!(
            Timeframe::H1.window_start(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn timeframe_parses_broker_aliases() {
        assert_eq!("minute".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("15m".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_serialises_as_short_label() {
        let json = serde_json::to_string(&Timeframe::M5).unwrap();
        assert_eq!(json, "\"5m\"");
    }

    #[tokio::test(start_paused = true)]
    async fn market_clock_follows_tokio_time() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap();
        let clock = MarketClock::starting_at(origin);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(90));
        assert_eq!(
            clock.until(origin + chrono::Duration::seconds(120)),
            Duration::from_secs(30)
        );
    }
}
