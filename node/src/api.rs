//! HTTP API for the utxodex node

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use utxodex_core::{BlockHeight, IndexerError, OutPoint, Utxo};
use utxodex_mempool::UnresolvedInput;
use utxodex_rpc::parse_txid;
use utxodex_sync::SyncState;

use crate::runtime::IndexerRuntime;

/// API state containing the indexer runtime
pub type ApiState = Arc<IndexerRuntime>;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// Indexer status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub name: String,
    pub state: SyncState,
    pub next_height: BlockHeight,
    pub applied_height: Option<BlockHeight>,
    pub utxo_count: usize,
    pub last_checkpoint: Option<BlockHeight>,
    pub halted_reason: Option<String>,
}

/// Mempool projection response
#[derive(Serialize)]
pub struct MempoolResponse {
    pub address: String,
    /// Signed minor units as a decimal string
    pub change: String,
    pub resolved_inputs: usize,
    pub unresolved_inputs: Vec<UnresolvedInput>,
}

/// Raw transaction submission
#[derive(Deserialize)]
pub struct SendRawTransactionRequest {
    pub tx: String,
}

#[derive(Serialize)]
pub struct SendRawTransactionResponse {
    pub txid: String,
}

/// Create API router
pub fn create_router(state: ApiState, enable_cors: bool) -> Router {
    let router = Router::new()
        // Health
        .route("/health", get(health))
        .route("/status", get(status))
        // Ledger
        .route("/utxos/:address", get(get_utxos))
        .route("/utxo/:txid/:vout", get(get_utxo))
        // Mempool
        .route("/mempool/:address", get(get_mempool_change))
        // Relay
        .route("/sendrawtransaction", post(send_raw_transaction))
        .with_state(state);

    let router = if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    };

    router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Status code for a failed request
fn error_status(error: &IndexerError) -> StatusCode {
    match error {
        IndexerError::InvalidTxid(_) => StatusCode::BAD_REQUEST,
        // The node refused the request itself.
        IndexerError::RpcError { .. } => StatusCode::BAD_REQUEST,
        IndexerError::NetworkError(_) | IndexerError::Timeout(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure<T: Serialize>(error: IndexerError) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = error_status(&error);
    if status.is_server_error() {
        warn!("Request failed: {}", error);
    }
    (status, Json(ApiResponse::err(error)))
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Indexer status
async fn status(State(runtime): State<ApiState>) -> impl IntoResponse {
    let sync = runtime.status();
    let counts = runtime
        .applied_height()
        .and_then(|height| runtime.utxo_count().map(|count| (height, count)));

    match counts {
        Ok((applied_height, utxo_count)) => {
            let response = StatusResponse {
                name: runtime.config().name.clone(),
                state: sync.state,
                next_height: sync.next_height,
                applied_height,
                utxo_count,
                last_checkpoint: runtime.last_checkpoint(),
                halted_reason: sync.halted_reason,
            };
            (StatusCode::OK, Json(ApiResponse::ok(response)))
        }
        Err(e) => failure(e),
    }
}

/// Committed UTXOs of an address
async fn get_utxos(
    State(runtime): State<ApiState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    debug!("GET utxos {}", address);
    match runtime.get_utxos(&address) {
        Ok(utxos) => (StatusCode::OK, Json(ApiResponse::ok(utxos))),
        Err(e) => failure(e),
    }
}

/// Point lookup
async fn get_utxo(
    State(runtime): State<ApiState>,
    Path((txid, vout)): Path<(String, u32)>,
) -> impl IntoResponse {
    let outpoint = match parse_txid(&txid) {
        Ok(txid) => OutPoint::new(txid, vout),
        Err(e) => return failure::<Utxo>(e),
    };

    match runtime.get_utxo(&outpoint) {
        Ok(Some(utxo)) => (StatusCode::OK, Json(ApiResponse::ok(utxo))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err(format!("{} is not unspent", outpoint))),
        ),
        Err(e) => failure(e),
    }
}

/// Pending balance change of an address
async fn get_mempool_change(
    State(runtime): State<ApiState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    debug!("GET mempool {}", address);
    match runtime.project_mempool(&address).await {
        Ok(projection) => {
            let response = MempoolResponse {
                change: projection.delta.to_string(),
                resolved_inputs: projection.resolved_inputs,
                unresolved_inputs: projection.unresolved,
                address: projection.address,
            };
            (StatusCode::OK, Json(ApiResponse::ok(response)))
        }
        Err(e) => failure(e),
    }
}

/// Relay a raw transaction to the full node
async fn send_raw_transaction(
    State(runtime): State<ApiState>,
    Json(req): Json<SendRawTransactionRequest>,
) -> impl IntoResponse {
    match runtime.send_raw_transaction(req.tx.trim()).await {
        Ok(txid) => (
            StatusCode::OK,
            Json(ApiResponse::ok(SendRawTransactionResponse {
                txid: txid.to_hex(),
            })),
        ),
        Err(e) => failure(e),
    }
}

/// Start API server
pub async fn start_api_server(runtime: ApiState, listen_addr: &str, enable_cors: bool) -> anyhow::Result<()> {
    let router = create_router(runtime, enable_cors);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("API server listening on {}", listen_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
