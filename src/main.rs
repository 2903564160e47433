// =============================================================================
// Market Bridge: Main Entry Point
// =============================================================================
//
// Collects ticks from live or synthetic sources, aggregates them into bars,
// persists both through the store, and fans them out to websocket clients.
// Collectors are managed at runtime through the REST API; definitions in the
// config file are created (and optionally started) at boot.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod collector;
mod config;
mod error;
mod market_data;
mod storage;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppContext;
use crate::collector::{CollectorParams, CollectorRegistry};
use crate::config::{CollectorDefinition, ServiceConfig, DEFAULT_CONFIG_PATH};
use crate::storage::{instruments, MarketStore, MemoryStore};
use crate::stream::DistributionHub;
use crate::types::{CollectorKind, MarketClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Market Bridge starting up");

    let config_path =
        std::env::var("MARKET_BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });
    config.apply_env_overrides();

    // ── 2. Storage & instrument table ────────────────────────────────────
    let store = Arc::new(MemoryStore::new(config.max_ticks));
    store.register_instruments(config.instruments.iter().cloned());
    if config.instrument_sync.enabled {
        sync_instruments(&config, &store).await;
    }
    info!(instruments = store.instrument_count(), "Instrument table ready");

    // ── 3. Distribution hub ──────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let hub = DistributionHub::new(config.hub.to_hub_config());
    let hub_task = tokio::spawn(hub.clone().run(shutdown.clone()));

    // ── 4. Collector registry ────────────────────────────────────────────
    let store_dyn: Arc<dyn MarketStore> = store.clone();
    let registry = Arc::new(CollectorRegistry::new(
        store_dyn.clone(),
        hub.clone(),
        Arc::new(MarketClock::new()),
        config.collector.clone(),
        config.exchanges.clone(),
    ));

    for def in &config.collectors {
        if let Err(e) = create_from_definition(&registry, def).await {
            error!(collector = %def.name, error = %e, "Failed to set up configured collector");
        }
    }

    // ── 5. API server ────────────────────────────────────────────────────
    let app = api::router(AppContext {
        registry: registry.clone(),
        hub: hub.clone(),
        store: store_dyn,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    registry.stop_all().await;
    shutdown.cancel();
    if let Err(e) = hub_task.await {
        error!(error = %e, "Hub dispatch loop ended abnormally");
    }

    info!("Market Bridge shut down complete.");
    Ok(())
}

async fn create_from_definition(
    registry: &CollectorRegistry,
    def: &CollectorDefinition,
) -> anyhow::Result<()> {
    let params = match def.kind {
        CollectorKind::Live => CollectorParams::Live {
            api_key: def.api_key.clone(),
            access_token: def.access_token.clone(),
            ws_url: None,
            mode: def.mode,
        },
        CollectorKind::Synthetic => CollectorParams::Synthetic {
            symbols: def.symbols.clone(),
            interval: def.interval_ms.map(Duration::from_millis),
        },
    };

    registry.create(&def.name, params).await?;
    if def.kind == CollectorKind::Live && !def.symbols.is_empty() {
        let outcome = registry.subscribe_symbols(&def.name, &def.symbols).await?;
        info!(collector = %def.name, subscribed = outcome.subscribed.len(), skipped = ?outcome.skipped, "Configured symbols subscribed");
    }
    if def.auto_start {
        registry.start(&def.name).await?;
    }
    Ok(())
}

async fn sync_instruments(config: &ServiceConfig, store: &MemoryStore) {
    let sync = &config.instrument_sync;
    if sync.api_key.is_empty() || sync.access_token.is_empty() {
        warn!("Instrument sync enabled but credentials are missing, skipping");
        return;
    }

    let client = reqwest::Client::new();
    for exchange in &sync.exchanges {
        match instruments::fetch_kite_instruments(&client, &sync.api_key, &sync.access_token, exchange)
            .await
        {
            Ok(list) => store.register_instruments(list),
            Err(e) => warn!(exchange = %exchange, error = %e, "Instrument sync failed"),
        }
    }
}
