// =============================================================================
// REST API Endpoints (Axum 0.7)
// =============================================================================
//
// All endpoints live under `/api/v1/`:
//
//   GET    /health
//   GET    /collectors                      list
//   POST   /collectors                      create
//   GET    /collectors/metrics              aggregate metrics
//   GET    /collectors/:name                status
//   DELETE /collectors/:name                delete (must be stopped)
//   POST   /collectors/:name/start
//   POST   /collectors/:name/stop
//   POST   /collectors/:name/subscribe      {symbols: [...]}
//   POST   /collectors/:name/unsubscribe    {symbols: [...]}
//   GET    /collectors/:name/metrics
//   GET    /stream/ws                       streaming websocket
//   GET    /stream/stats                    hub counters
// =============================================================================

use std::time::Duration;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::AppContext;
use crate::collector::{CollectorParams, CollectorStatus};
use crate::error::ApiError;
use crate::types::{CollectorKind, StreamMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        // ── Collectors ──────────────────────────────────────────────
        .route("/api/v1/collectors", get(list_collectors).post(create_collector))
        .route("/api/v1/collectors/metrics", get(all_metrics))
        .route(
            "/api/v1/collectors/:name",
            get(get_collector).delete(delete_collector),
        )
        .route("/api/v1/collectors/:name/start", post(start_collector))
        .route("/api/v1/collectors/:name/stop", post(stop_collector))
        .route("/api/v1/collectors/:name/subscribe", post(subscribe))
        .route("/api/v1/collectors/:name/unsubscribe", post(unsubscribe))
        .route("/api/v1/collectors/:name/metrics", get(collector_metrics))
        // ── Streaming ───────────────────────────────────────────────
        .route("/api/v1/stream/ws", get(crate::api::ws::ws_handler))
        .route("/api/v1/stream/stats", get(stream_stats))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    collectors: usize,
    running: usize,
    stream_clients: usize,
    server_time: i64,
}

async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let list = ctx.registry.list();
    Json(HealthResponse {
        status: "ok",
        collectors: list.len(),
        running: list.iter().filter(|c| c.running).count(),
        stream_clients: ctx.hub.client_count(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Collectors
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateCollectorRequest {
    name: String,
    kind: CollectorKind,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    ws_url: Option<String>,
    #[serde(default)]
    mode: StreamMode,
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default)]
    interval_ms: Option<u64>,
}

impl CreateCollectorRequest {
    fn into_params(self) -> (String, CollectorParams) {
        let params = match self.kind {
            CollectorKind::Live => CollectorParams::Live {
                api_key: self.api_key,
                access_token: self.access_token,
                ws_url: self.ws_url,
                mode: self.mode,
            },
            CollectorKind::Synthetic => CollectorParams::Synthetic {
                symbols: self.symbols,
                interval: self.interval_ms.map(Duration::from_millis),
            },
        };
        (self.name, params)
    }
}

#[derive(Debug, Deserialize)]
struct SymbolsRequest {
    #[serde(default)]
    symbols: Vec<String>,
}

impl SymbolsRequest {
    fn validated(self) -> Result<Vec<String>, ApiError> {
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            return Err(ApiError::BadRequest("symbols must not be empty".into()));
        }
        Ok(self.symbols)
    }
}

async fn list_collectors(State(ctx): State<AppContext>) -> Json<Vec<CollectorStatus>> {
    Json(ctx.registry.list())
}

async fn create_collector(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateCollectorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (name, params) = req.into_params();
    let collector = ctx.registry.create(&name, params).await?;
    info!(collector = %collector.name(), kind = %collector.kind(), "collector created via API");
    let status = ctx.registry.status(collector.name())?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn get_collector(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<CollectorStatus>, ApiError> {
    Ok(Json(ctx.registry.status(&name)?))
}

async fn delete_collector(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.registry.delete(&name).await?;
    Ok(Json(json!({ "message": format!("collector '{name}' deleted") })))
}

async fn start_collector(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<CollectorStatus>, ApiError> {
    ctx.registry.start(&name).await?;
    Ok(Json(ctx.registry.status(&name)?))
}

async fn stop_collector(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<CollectorStatus>, ApiError> {
    ctx.registry.stop(&name).await?;
    Ok(Json(ctx.registry.status(&name)?))
}

async fn subscribe(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(req): Json<SymbolsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let symbols = req.validated()?;
    let outcome = ctx.registry.subscribe_symbols(&name, &symbols).await?;
    Ok(Json(outcome))
}

async fn unsubscribe(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(req): Json<SymbolsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let symbols = req.validated()?;
    let removed = ctx.registry.unsubscribe_symbols(&name, &symbols).await?;
    Ok(Json(json!({ "unsubscribed": removed })))
}

async fn collector_metrics(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ctx.registry.collector_metrics(&name)?))
}

async fn all_metrics(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.registry.metrics())
}

// =============================================================================
// Streaming stats
// =============================================================================

async fn stream_stats(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.hub.stats())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::collector::CollectorRegistry;
    use crate::config::CollectorSettings;
    use crate::storage::MemoryStore;
    use crate::stream::{DistributionHub, HubConfig};
    use crate::types::{Instrument, MarketClock};

    fn context() -> AppContext {
        let store = Arc::new(MemoryStore::new(1_000));
        store.register_instruments([
            Instrument::new("NSE", "RELIANCE", 738561),
            Instrument::new("NSE", "INFY", 408065),
        ]);
        let hub = DistributionHub::new(HubConfig::default());
        let registry = Arc::new(CollectorRegistry::new(
            store.clone(),
            hub.clone(),
            Arc::new(MarketClock::new()),
            CollectorSettings::default(),
            vec!["NSE".into(), "BSE".into()],
        ));
        AppContext {
            registry,
            hub,
            store,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(context());
        let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["collectors"], 0);
    }

    #[tokio::test]
    async fn create_list_and_duplicate() {
        let app = router(context());
        let req = json!({ "name": "sim", "kind": "synthetic", "symbols": ["RELIANCE"] });

        let (status, body) = call(&app, "POST", "/api/v1/collectors", Some(req.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "sim");
        assert_eq!(body["kind"], "synthetic");
        assert_eq!(body["symbols"], json!(["RELIANCE"]));
        assert_eq!(body["running"], false);

        let (status, body) = call(&app, "POST", "/api/v1/collectors", Some(req)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "NAME_EXISTS");

        let (status, body) = call(&app, "GET", "/api/v1/collectors", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn unknown_collector_is_404() {
        let app = router(context());
        let (status, body) = call(&app, "GET", "/api/v1/collectors/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");

        let (status, _) = call(&app, "POST", "/api/v1/collectors/ghost/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lifecycle_over_http() {
        let app = router(context());
        let req = json!({ "name": "sim", "kind": "synthetic", "symbols": ["RELIANCE"], "interval_ms": 50 });
        call(&app, "POST", "/api/v1/collectors", Some(req)).await;

        let (status, body) = call(&app, "POST", "/api/v1/collectors/sim/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);

        let (status, body) = call(&app, "DELETE", "/api/v1/collectors/sim", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "RUNNING");

        let (status, body) = call(&app, "GET", "/api/v1/collectors/sim/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "sim");
        assert_eq!(body["running"], true);

        let (status, body) = call(&app, "POST", "/api/v1/collectors/sim/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);

        let (status, _) = call(&app, "DELETE", "/api/v1/collectors/sim", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn subscribe_validates_symbols() {
        let app = router(context());
        call(
            &app,
            "POST",
            "/api/v1/collectors",
            Some(json!({ "name": "sim", "kind": "synthetic" })),
        )
        .await;

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/collectors/sim/subscribe",
            Some(json!({ "symbols": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/collectors/sim/subscribe",
            Some(json!({ "symbols": ["NOPE"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "no valid symbols found");

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/collectors/sim/subscribe",
            Some(json!({ "symbols": ["INFY", "NOPE"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribed"][0]["symbol"], "INFY");
        assert_eq!(body["skipped"], json!(["NOPE"]));

        let (status, body) = call(&app, "GET", "/api/v1/collectors/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_collectors"], 1);
        assert_eq!(body["collectors"][0]["symbols"], json!(["INFY"]));
    }

    #[tokio::test]
    async fn stream_stats_are_exposed() {
        let app = router(context());
        let (status, body) = call(&app, "GET", "/api/v1/stream/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected_clients"], 0);
        assert_eq!(body["inbox_capacity"], 256);
    }
}
