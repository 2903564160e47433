// =============================================================================
// Collector registry
// =============================================================================
//
// Owns every named collector, live and synthetic alike. Names are unique
// across both kinds. Lookups try the configured exchanges in order.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::collector::engine::{Collector, CollectorMetrics, CollectorOptions};
use crate::config::CollectorSettings;
use crate::error::RegistryError;
use crate::market_data::source::kite::KiteConnector;
use crate::market_data::source::{LiveSource, SyntheticSource, UpstreamConnector};
use crate::market_data::TickSource;
use crate::storage::{resolve_instrument, MarketStore};
use crate::stream::DistributionHub;
use crate::types::{CollectorKind, Instrument, MarketClock, StreamMode};

// =============================================================================
// Construction parameters
// =============================================================================

/// Builds upstream connectors for live collectors.
pub trait ConnectorFactory: Send + Sync {
    fn live(&self, api_key: &str, access_token: &str, ws_url: &str) -> Arc<dyn UpstreamConnector>;
}

/// Connects to the Kite ticker.
pub struct KiteConnectorFactory;

impl ConnectorFactory for KiteConnectorFactory {
    fn live(&self, api_key: &str, access_token: &str, ws_url: &str) -> Arc<dyn UpstreamConnector> {
        Arc::new(KiteConnector::new(ws_url, api_key, access_token))
    }
}

#[derive(Debug, Clone)]
pub enum CollectorParams {
    Live {
        api_key: String,
        access_token: String,
        ws_url: Option<String>,
        mode: StreamMode,
    },
    Synthetic {
        symbols: Vec<String>,
        interval: Option<Duration>,
    },
}

impl CollectorParams {
    pub fn kind(&self) -> CollectorKind {
        match self {
            Self::Live { .. } => CollectorKind::Live,
            Self::Synthetic { .. } => CollectorKind::Synthetic,
        }
    }
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatus {
    pub name: String,
    pub kind: CollectorKind,
    pub symbols: Vec<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryMetrics {
    pub total_collectors: usize,
    pub running_collectors: usize,
    pub live_collectors: usize,
    pub synthetic_collectors: usize,
    pub ticks_received: u64,
    pub bars_created: u64,
    pub errors: u64,
    pub collectors: Vec<CollectorMetrics>,
}

/// Outcome of a symbol subscription request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub subscribed: Vec<Instrument>,
    pub skipped: Vec<String>,
}

// =============================================================================
// Registry
// =============================================================================

pub struct CollectorRegistry {
    collectors: RwLock<HashMap<String, Arc<Collector>>>,
    store: Arc<dyn MarketStore>,
    hub: Arc<DistributionHub>,
    clock: Arc<MarketClock>,
    settings: CollectorSettings,
    exchanges: Vec<String>,
    connectors: Arc<dyn ConnectorFactory>,
}

impl CollectorRegistry {
    pub fn new(
        store: Arc<dyn MarketStore>,
        hub: Arc<DistributionHub>,
        clock: Arc<MarketClock>,
        settings: CollectorSettings,
        exchanges: Vec<String>,
    ) -> Self {
        Self {
            collectors: RwLock::new(HashMap::new()),
            store,
            hub,
            clock,
            settings,
            exchanges,
            connectors: Arc::new(KiteConnectorFactory),
        }
    }

    pub fn with_connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.connectors = factory;
        self
    }

    /// Create a collector. Synthetic collectors subscribe their initial
    /// symbols right away; unresolved ones are skipped.
    pub async fn create(
        &self,
        name: &str,
        params: CollectorParams,
    ) -> Result<Arc<Collector>, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::Invalid("collector name is required".into()));
        }
        if self.collectors.read().contains_key(name) {
            return Err(RegistryError::NameExists(name.to_string()));
        }

        let kind = params.kind();
        let (source, initial): (Arc<dyn TickSource>, Vec<String>) = match params {
            CollectorParams::Live {
                api_key,
                access_token,
                ws_url,
                mode,
            } => {
                if api_key.is_empty() || access_token.is_empty() {
                    return Err(RegistryError::Invalid(
                        "api_key and access_token are required for live collectors".into(),
                    ));
                }
                let url = ws_url.unwrap_or_else(|| self.settings.kite_ws_url.clone());
                let connector = self.connectors.live(&api_key, &access_token, &url);
                let source = LiveSource::new(
                    name,
                    connector,
                    self.settings.reconnect_policy(),
                    mode,
                    self.clock.clone(),
                );
                (Arc::new(source), Vec::new())
            }
            CollectorParams::Synthetic { symbols, interval } => {
                let cadence = interval.unwrap_or_else(|| self.settings.synthetic_interval());
                let source = SyntheticSource::new(name, cadence, self.clock.clone());
                (Arc::new(source), symbols)
            }
        };

        let resolved = self.resolve_all(&initial).await;
        let collector = Arc::new(Collector::new(
            name,
            CollectorOptions::from(&self.settings),
            source,
            self.store.clone(),
            self.hub.clone(),
            self.clock.clone(),
        ));
        collector.subscribe_instruments(&resolved.subscribed);

        {
            let mut collectors = self.collectors.write();
            // Another create may have won while symbols were resolving.
            if collectors.contains_key(name) {
                return Err(RegistryError::NameExists(name.to_string()));
            }
            collectors.insert(name.to_string(), collector.clone());
        }

        info!(
            collector = %name,
            kind = %kind,
            symbols = resolved.subscribed.len(),
            skipped = resolved.skipped.len(),
            "collector created"
        );
        Ok(collector)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Collector>, RegistryError> {
        self.collectors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Result<CollectorStatus, RegistryError> {
        self.get(name).map(|c| status_of(&c))
    }

    /// Every collector, sorted by name.
    pub fn list(&self) -> Vec<CollectorStatus> {
        let mut list: Vec<CollectorStatus> = self.snapshot().iter().map(|c| status_of(c)).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn start(&self, name: &str) -> Result<(), RegistryError> {
        let collector = self.get(name)?;
        collector.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let collector = self.get(name)?;
        collector.stop().await;
        Ok(())
    }

    /// Remove a stopped collector. A `start` racing with this either wins
    /// (delete fails with `StillRunning`) or finds the collector retired.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let collector = self.get(name)?;
        collector.retire().await?;

        let mut collectors = self.collectors.write();
        if collectors
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &collector))
        {
            collectors.remove(name);
        }
        info!(collector = %name, "collector deleted");
        Ok(())
    }

    /// Resolve each symbol across the configured exchanges and subscribe
    /// the ones that resolve. Fails only when none do.
    pub async fn subscribe_symbols(
        &self,
        name: &str,
        symbols: &[String],
    ) -> Result<SubscribeOutcome, RegistryError> {
        let collector = self.get(name)?;
        let outcome = self.resolve_all(symbols).await;
        if outcome.subscribed.is_empty() {
            return Err(RegistryError::NoValidSymbols);
        }
        collector.subscribe_instruments(&outcome.subscribed);
        Ok(outcome)
    }

    pub async fn unsubscribe_symbols(
        &self,
        name: &str,
        symbols: &[String],
    ) -> Result<Vec<Instrument>, RegistryError> {
        let collector = self.get(name)?;
        Ok(collector.unsubscribe(symbols).await)
    }

    pub fn collector_metrics(&self, name: &str) -> Result<CollectorMetrics, RegistryError> {
        self.get(name).map(|c| c.metrics())
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let mut collectors: Vec<CollectorMetrics> =
            self.snapshot().iter().map(|c| c.metrics()).collect();
        collectors.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryMetrics {
            total_collectors: collectors.len(),
            running_collectors: collectors.iter().filter(|m| m.running).count(),
            live_collectors: collectors.iter().filter(|m| m.kind == CollectorKind::Live).count(),
            synthetic_collectors: collectors
                .iter()
                .filter(|m| m.kind == CollectorKind::Synthetic)
                .count(),
            ticks_received: collectors.iter().map(|m| m.ticks_received).sum(),
            bars_created: collectors.iter().map(|m| m.bars_created).sum(),
            errors: collectors.iter().map(|m| m.errors).sum(),
            collectors,
        }
    }

    /// Stop every running collector. Used at shutdown.
    pub async fn stop_all(&self) {
        for collector in self.snapshot() {
            if collector.is_running() {
                collector.stop().await;
            }
        }
        info!("all collectors stopped");
    }

    fn snapshot(&self) -> Vec<Arc<Collector>> {
        self.collectors.read().values().cloned().collect()
    }

    async fn resolve_all(&self, symbols: &[String]) -> SubscribeOutcome {
        let mut subscribed = Vec::new();
        let mut skipped = Vec::new();
        for raw in symbols {
            let symbol = raw.trim().to_uppercase();
            if symbol.is_empty() {
                continue;
            }
            match resolve_instrument(self.store.as_ref(), &self.exchanges, &symbol).await {
                Some(inst) => subscribed.push(inst),
                None => {
                    warn!(symbol = %symbol, exchanges = ?self.exchanges, "symbol not found on any exchange, skipping");
                    skipped.push(symbol);
                }
            }
        }
        SubscribeOutcome { subscribed, skipped }
    }
}

fn status_of(collector: &Collector) -> CollectorStatus {
    CollectorStatus {
        name: collector.name().to_string(),
        kind: collector.kind(),
        symbols: collector.symbols(),
        running: collector.is_running(),
    }
}

// =============================================================================
// Tests
// =============================================================================
