//! HTTP surface of the relayer.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ethers::types::Address;
use serde::{de, Deserialize, Deserializer, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};
use zkpool_tree::TreeError;

use crate::{
    chains::ChainRegistry,
    error::RelayerError,
    health::{HealthReport, HealthReporter},
    ledger::TxHash,
    pipeline::{RequestKind, SubmissionPipeline, SubmitRequest},
    signals::bytes_hex,
};

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub chains: Arc<ChainRegistry>,
    pub pipeline: Arc<SubmissionPipeline>,
    pub health: Arc<HealthReporter>,
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_all))
        .route("/health/:chain_id", get(health_chain))
        .route("/tree/:chain_id", get(tree_snapshot))
        .route("/tree/:chain_id/proof/:index", get(tree_proof))
        .route("/relay/withdraw", post(relay_withdraw))
        .route("/relay/transfer", post(relay_transfer))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after_ms: Option<u64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        let status = match &err {
            RelayerError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayerError::UnknownChain(_) => StatusCode::NOT_FOUND,
            RelayerError::Tree(TreeError::IndexOutOfRange { .. }) => StatusCode::NOT_FOUND,
            RelayerError::Conflict { .. } => StatusCode::CONFLICT,
            RelayerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayerError::StaleRoot | RelayerError::ChainSubmission(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RelayerError::Timeout { .. } | RelayerError::Unconfirmed { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            RelayerError::Ledger(_) | RelayerError::Sync(_) => StatusCode::BAD_GATEWAY,
            RelayerError::Store(_) | RelayerError::Tree(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        } else {
            warn!("Request rejected: {}", err);
        }

        let retry_after_ms = match &err {
            RelayerError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!("Malformed request body: {}", rejection.body_text());
        Self {
            status: rejection.status(),
            code: "INVALID_BODY",
            message: rejection.body_text(),
            retry_after_ms: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
            retry_after_ms: self.retry_after_ms,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(ms) = self.retry_after_ms {
            let secs = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    /// Hex-encoded proof bytes.
    pub proof: String,
    /// Decimal or `0x` strings; plain JSON integers are accepted too.
    #[serde(deserialize_with = "signal_strings")]
    pub public_signals: Vec<String>,
    #[serde(default)]
    pub token_address: Option<Address>,
    pub target_chain_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub tx_hash: TxHash,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TreeResponse {
    chain_id: u64,
    leaf_count: u64,
    root: String,
    last_synced_block: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    chain_id: u64,
    index: u64,
    leaf: String,
    root: String,
    siblings: Vec<String>,
    path_indices: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct HealthSummary {
    ok: bool,
    chains: Vec<HealthReport>,
}

async fn health_all(State(state): State<AppState>) -> impl IntoResponse {
    let chains = state.health.report_all().await;
    let ok = chains.iter().all(|report| report.ok);
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthSummary { ok, chains }))
}

async fn health_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.health.report(chain_id).await?;
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)))
}

async fn tree_snapshot(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> Result<Json<TreeResponse>, ApiError> {
    let chain = state.chains.get(chain_id)?;
    let snapshot = chain.replayer.snapshot().await;
    Ok(Json(TreeResponse {
        chain_id,
        leaf_count: snapshot.leaf_count,
        root: bytes_hex(&snapshot.root),
        last_synced_block: snapshot.last_synced_block,
    }))
}

async fn tree_proof(
    State(state): State<AppState>,
    Path((chain_id, index)): Path<(u64, u64)>,
) -> Result<Json<ProofResponse>, ApiError> {
    let chain = state.chains.get(chain_id)?;
    let (proof, root) = chain.replayer.proof(index).await?;
    Ok(Json(ProofResponse {
        chain_id,
        index,
        leaf: bytes_hex(&proof.leaf),
        root: bytes_hex(&root),
        path_indices: proof.path_indices(),
        siblings: proof.siblings.iter().map(bytes_hex).collect(),
    }))
}

async fn relay_withdraw(
    State(state): State<AppState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Json<RelayResponse>, ApiError> {
    let Json(req) = payload?;
    relay(&state, RequestKind::Withdraw, req).await
}

async fn relay_transfer(
    State(state): State<AppState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Json<RelayResponse>, ApiError> {
    let Json(req) = payload?;
    relay(&state, RequestKind::Transfer, req).await
}

/// Integers wider than `u64` must be sent as strings; JSON numbers lose precision past that.
fn signal_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(text) => Ok(text),
            serde_json::Value::Number(number) => number
                .as_u64()
                .map(|n| n.to_string())
                .ok_or_else(|| de::Error::custom(format!("signal {} is not an unsigned integer", number))),
            other => Err(de::Error::custom(format!(
                "signal must be a string or integer, got {}",
                other
            ))),
        })
        .collect()
}

async fn relay(
    state: &AppState,
    kind: RequestKind,
    req: RelayRequest,
) -> Result<Json<RelayResponse>, ApiError> {
    let raw = req.proof.trim();
    let proof = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|e| RelayerError::Validation(format!("proof is not valid hex: {}", e)))?;

    let outcome = state
        .pipeline
        .submit(SubmitRequest {
            kind,
            proof,
            public_signals: req.public_signals,
            token: req.token_address,
            target_chain_id: req.target_chain_id,
        })
        .await?;

    Ok(Json(RelayResponse {
        tx_hash: outcome.tx_hash,
    }))
}
