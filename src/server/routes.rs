use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{dispatch, AppState, ServiceState};
use crate::{
    error::TickHubError,
    ingest::{DeInitSummary, SymbolStatus},
    models::{DeInitRequest, InitRequest, TickRequest},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/data", get(dispatch::data_ws))
        // One named channel per producer
        .route("/ingest/:symbol/init", post(init))
        .route("/ingest/:symbol/tick", post(tick))
        .route("/ingest/:symbol/deinit", post(deinit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: state.status.state(),
        client_connected: state.status.client_connected(),
        clients: state.status.clients(),
        cached_hours: state.cache.len(),
        pending: state.pipeline.pending_len(),
        flushed_rows: state.pipeline.flushed_rows(),
        live_subscribers: state.pipeline.live_subscribers(),
        ingestion_fault: state.pipeline.fault_reason(),
        symbols: state.pipeline.status(),
    })
}

async fn init(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(req): Json<InitRequest>,
) -> Result<Json<Ack>, ApiError> {
    check_channel(&symbol, &req.symbol)?;
    state.pipeline.init(req).await?;
    Ok(Json(Ack::ok()))
}

async fn tick(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(req): Json<TickRequest>,
) -> Result<Json<Ack>, ApiError> {
    check_channel(&symbol, &req.symbol)?;
    state.pipeline.tick(req)?;
    Ok(Json(Ack::ok()))
}

async fn deinit(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(req): Json<DeInitRequest>,
) -> Result<Json<DeInitSummary>, ApiError> {
    let summary = state.pipeline.deinit(&symbol, req.reason).await?;
    Ok(Json(summary))
}

/// A producer may only speak for the symbol its channel is named after.
fn check_channel(channel: &str, symbol: &str) -> Result<(), ApiError> {
    if channel.eq_ignore_ascii_case(symbol) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "channel {channel} cannot carry {symbol}"
        )))
    }
}

// ===== Request/Response Types =====

#[derive(Debug, Serialize)]
struct Ack {
    result: &'static str,
}

impl Ack {
    fn ok() -> Self {
        Self { result: "ok" }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    service: ServiceState,
    client_connected: bool,
    clients: usize,
    cached_hours: usize,
    pending: usize,
    flushed_rows: usize,
    live_subscribers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingestion_fault: Option<String>,
    symbols: Vec<SymbolStatus>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Ingest(TickHubError),
    BadRequest(String),
}

impl From<TickHubError> for ApiError {
    fn from(err: TickHubError) -> Self {
        ApiError::Ingest(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Ingest(err) => {
                let status = match err {
                    TickHubError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
                    TickHubError::ConnectionConflict(_) | TickHubError::NotConnected(_) => {
                        StatusCode::CONFLICT
                    }
                    TickHubError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    TickHubError::InvalidInput(_) | TickHubError::Range(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => {
                        tracing::error!("Ingestion error: {}", err);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
