// =============================================================================
// Service Configuration: JSON file with env expansion
// =============================================================================
//
// Every tunable for the bridge lives here: listen address, exchange lookup
// order, collector timing, hub queue sizes, seed instruments and collectors
// to create at startup.
//
// Credentials may reference `${VAR}` environment values.  All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::source::kite::DEFAULT_KITE_WS_URL;
use crate::market_data::source::ReconnectPolicy;
use crate::stream::HubConfig;
use crate::types::{CollectorKind, Instrument, StreamMode, Timeframe};

pub const DEFAULT_CONFIG_PATH: &str = "market_bridge.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:6005".to_string()
}

fn default_exchanges() -> Vec<String> {
    vec!["NSE".to_string(), "BSE".to_string()]
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_event_queue() -> usize {
    4096
}

fn default_persist_queue() -> usize {
    8192
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_reconnect_max_retries() -> u32 {
    10
}

fn default_synthetic_interval_ms() -> u64 {
    1000
}

fn default_kite_ws_url() -> String {
    DEFAULT_KITE_WS_URL.to_string()
}

fn default_client_queue() -> usize {
    256
}

fn default_inbox() -> usize {
    256
}

fn default_keepalive_secs() -> u64 {
    54
}

fn default_read_deadline_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_ticks() -> usize {
    100_000
}

fn default_seed_instruments() -> Vec<Instrument> {
    [
        ("RELIANCE", 738561),
        ("TCS", 2953217),
        ("INFY", 408065),
        ("HDFCBANK", 341249),
        ("ICICIBANK", 1270529),
        ("SBIN", 779521),
    ]
    .into_iter()
    .map(|(sym, token)| Instrument::new("NSE", sym, token))
    .collect()
}

// =============================================================================
// CollectorSettings
// =============================================================================

/// Timing and queue sizes shared by every collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    #[serde(default)]
    pub timeframe: Timeframe,

    /// Period of the flush loop. Its first tick is aligned to the next
    /// timeframe boundary.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Capacity of the source -> collector event channel.
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,

    /// Capacity of the persistence queue.
    #[serde(default = "default_persist_queue")]
    pub persist_queue: usize,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_delay_secs: u64,

    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,

    /// Synthetic source cadence when a collector does not set its own.
    #[serde(default = "default_synthetic_interval_ms")]
    pub synthetic_interval_ms: u64,

    #[serde(default = "default_kite_ws_url")]
    pub kite_ws_url: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M1,
            flush_interval_secs: default_flush_interval_secs(),
            event_queue: default_event_queue(),
            persist_queue: default_persist_queue(),
            reconnect_base_delay_ms: default_reconnect_base_ms(),
            reconnect_max_delay_secs: default_reconnect_max_secs(),
            reconnect_max_retries: default_reconnect_max_retries(),
            synthetic_interval_ms: default_synthetic_interval_ms(),
            kite_ws_url: default_kite_ws_url(),
        }
    }
}

impl CollectorSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn synthetic_interval(&self) -> Duration {
        Duration::from_millis(self.synthetic_interval_ms.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
            max_retries: self.reconnect_max_retries,
        }
    }
}

// =============================================================================
// HubSettings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Per-client outbound queue. A client that fills it is disconnected.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,

    #[serde(default = "default_inbox")]
    pub inbox: usize,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            client_queue: default_client_queue(),
            inbox: default_inbox(),
            keepalive_secs: default_keepalive_secs(),
            read_deadline_secs: default_read_deadline_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl HubSettings {
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            client_queue: self.client_queue,
            inbox: self.inbox,
            keepalive: Duration::from_secs(self.keepalive_secs),
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

// =============================================================================
// Instrument sync & collector definitions
// =============================================================================

/// Optional download of the Kite instrument master at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentSyncSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,
}

/// A collector to create (and optionally start) at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorDefinition {
    pub name: String,
    pub kind: CollectorKind,

    /// `${VAR}` references are expanded from the environment.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub auto_start: bool,

    #[serde(default)]
    pub mode: StreamMode,

    /// Synthetic cadence override.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

// =============================================================================
// ServiceConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Exchange lookup order for symbol resolution.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,

    /// Ticks retained by the in-memory store.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: usize,

    #[serde(default)]
    pub collector: CollectorSettings,

    #[serde(default)]
    pub hub: HubSettings,

    /// Instruments seeded into the lookup table.
    #[serde(default = "default_seed_instruments")]
    pub instruments: Vec<Instrument>,

    #[serde(default)]
    pub instrument_sync: InstrumentSyncSettings,

    #[serde(default)]
    pub collectors: Vec<CollectorDefinition>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            exchanges: default_exchanges(),
            max_ticks: default_max_ticks(),
            collector: CollectorSettings::default(),
            hub: HubSettings::default(),
            instruments: default_seed_instruments(),
            instrument_sync: InstrumentSyncSettings::default(),
            collectors: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;
        config.expand_env();

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            collectors = config.collectors.len(),
            timeframe = %config.collector.timeframe,
            "service config loaded"
        );

        Ok(config)
    }

    /// `PORT` overrides the port part of `bind_addr`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                let host = self
                    .bind_addr
                    .rsplit_once(':')
                    .map_or("0.0.0.0", |(h, _)| h);
                self.bind_addr = format!("{host}:{port}");
            }
        }
    }

    fn expand_env(&mut self) {
        for def in &mut self.collectors {
            def.api_key = expand_env_vars(&def.api_key);
            def.access_token = expand_env_vars(&def.access_token);
        }
        self.instrument_sync.api_key = expand_env_vars(&self.instrument_sync.api_key);
        self.instrument_sync.access_token = expand_env_vars(&self.instrument_sync.access_token);
    }
}

/// Replace `${NAME}` with the value of the environment variable `NAME`
/// (empty if unset). Unterminated references are left as-is.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:6005");
        assert_eq!(cfg.exchanges, vec!["NSE", "BSE"]);
        assert_eq!(cfg.collector.timeframe, Timeframe::M1);
        assert_eq!(cfg.collector.flush_interval(), Duration::from_secs(60));
        assert_eq!(cfg.collector.reconnect_max_retries, 10);
        assert_eq!(cfg.hub.client_queue, 256);
        assert_eq!(cfg.hub.keepalive_secs, 54);
        assert_eq!(cfg.instruments.len(), 6);
        assert_eq!(cfg.instruments[0].token, 738561);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "bind_addr": "127.0.0.1:9000",
            "collector": { "flush_interval_secs": 5 },
            "collectors": [
                { "name": "sim", "kind": "synthetic", "symbols": ["INFY"], "auto_start": true }
            ]
        }"#;
        let cfg: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.collector.flush_interval_secs, 5);
        assert_eq!(cfg.collector.event_queue, 4096);
        assert_eq!(cfg.hub.read_deadline_secs, 60);
        let def = &cfg.collectors[0];
        assert_eq!(def.kind, CollectorKind::Synthetic);
        assert_eq!(def.mode, StreamMode::Full);
        assert!(def.auto_start);
    }

    #[test]
    fn reconnect_policy_from_settings() {
        let policy = CollectorSettings::default().reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_retries, 10);
    }

    #[test]
    fn expands_env_references() {
        std::env::set_var("MB_TEST_API_KEY", "abc123");
        assert_eq!(expand_env_vars("${MB_TEST_API_KEY}"), "abc123");
        assert_eq!(expand_env_vars("key=${MB_TEST_API_KEY}!"), "key=abc123!");
        assert_eq!(expand_env_vars("${MB_TEST_DEFINITELY_UNSET}"), "");
        assert_eq!(expand_env_vars("plain"), "plain");
        assert_eq!(expand_env_vars("broken ${OPEN"), "broken ${OPEN");
    }

    #[test]
    fn load_reads_file_and_expands_credentials() {
        std::env::set_var("MB_TEST_ACCESS_TOKEN", "tok-42");
        let dir = std::env::temp_dir().join(format!("mb-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("market_bridge.json");
        std::fs::write(
            &path,
            r#"{
                "exchanges": ["BSE"],
                "collectors": [
                    { "name": "kite", "kind": "live", "api_key": "k", "access_token": "${MB_TEST_ACCESS_TOKEN}" }
                ]
            }"#,
        )
        .unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.exchanges, vec!["BSE"]);
        assert_eq!(loaded.collectors[0].access_token, "tok-42");
        assert!(ServiceConfig::load(dir.join("missing.json")).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
