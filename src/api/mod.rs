//! HTTP API for health checks and transaction status

use crate::chain::ChainReader;
use crate::config::ApiConfig;
use crate::error::{L1TxError, L1TxResult};
use crate::state::{TxStateStats, TxStateStore};
use crate::tx::{L1TxManager, TxState, TxStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<L1TxManager>,
}

/// Routes served by [`run_server`]
pub fn router(manager: Arc<L1TxManager>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/txs", get(list_txs))
        .route("/txs/:nonce", get(get_tx))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { manager })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, manager: Arc<L1TxManager>) -> L1TxResult<()> {
    let app = router(manager);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| L1TxError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| L1TxError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - state store and L1 node both reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.manager;
    let database = manager.store().health_check().await.is_ok();
    let l1 = manager.client().block_number().await.is_ok();
    let ready = database && l1;

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready,
            database,
            l1,
            interrupted: manager.is_interrupted(),
        }),
    )
}

/// Every tracked nonce, which are under active monitoring, and the
/// persisted record counts
async fn list_txs(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.manager;
    let txs: Vec<TxSummary> = manager.states().iter().map(TxSummary::from).collect();

    let stored = match manager.store().stats(manager.account()).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Failed to load stored state counts: {}", e);
            None
        }
    };

    Json(TxListResponse {
        account: format!("{:?}", manager.account()),
        monitored: manager.monitored_nonces(),
        stored,
        txs,
    })
}

async fn get_tx(State(state): State<AppState>, Path(nonce): Path<u64>) -> impl IntoResponse {
    match state.manager.tx_state(nonce) {
        Some(tx) => (StatusCode::OK, Json(serde_json::json!(tx))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": L1TxError::StateNotFound { nonce }.to_string()
            })),
        ),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    l1: bool,
    interrupted: bool,
}

#[derive(Serialize)]
struct TxListResponse {
    account: String,
    monitored: Vec<u64>,
    stored: Option<TxStateStats>,
    txs: Vec<TxSummary>,
}

#[derive(Serialize)]
struct TxSummary {
    nonce: u64,
    status: TxStatus,
    tx_hashes: usize,
    cancel_tx_hashes: usize,
    latest_hash: Option<String>,
    last_sent_block: u64,
}

impl From<&TxState> for TxSummary {
    fn from(state: &TxState) -> Self {
        Self {
            nonce: state.nonce,
            status: state.status,
            tx_hashes: state.tx_hashes.len(),
            cancel_tx_hashes: state.cancel_tx_hashes.len(),
            latest_hash: state.all_hashes().next().map(|h| format!("{:?}", h)),
            last_sent_block: state.last_sent_block,
        }
    }
}
