use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hyper::Server;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::ingest_use_case::{IngestOutcome, IngestUseCase};
use crate::error::{StoreError, ValidationError};
use crate::metrics::gateway as gateway_metrics;
use crate::storage::run_blocking;

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestUseCase>,
    pub service_name: Arc<str>,
}

impl AppState {
    pub fn new(ingest: Arc<IngestUseCase>, service_name: &str) -> Self {
        Self {
            ingest,
            service_name: Arc::from(service_name),
        }
    }
}

/// Health check endpoint
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": &*state.service_name,
    }))
}

async fn ingest(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();
    let response = outcome_response(state.ingest.ingest(&body).await);
    gateway_metrics::request_duration(started.elapsed().as_secs_f64());
    response
}

async fn staging_stats(State(state): State<AppState>) -> Response {
    let log = state.ingest.staging().clone();
    match run_blocking(move || log.stats()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Accepted { event_id, .. } => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "eventId": event_id})),
        )
            .into_response(),
        IngestOutcome::Duplicate { original_event_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "eventId": original_event_id,
                "duplicate": true,
            })),
        )
            .into_response(),
        IngestOutcome::Invalid(ValidationError::MalformedBody(_)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid JSON body")
        }
        IngestOutcome::Invalid(e @ ValidationError::MissingField(_)) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        IngestOutcome::Unavailable(e @ StoreError::Overloaded { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        IngestOutcome::Unavailable(StoreError::Corrupted(_)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "staging storage is read-only; not accepting events",
        ),
        IngestOutcome::Unavailable(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/events/ingest", post(ingest))
        .route("/v1/staging/stats", get(staging_stats))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn start_server<F>(
    state: AppState,
    addr: SocketAddr,
    max_body_bytes: usize,
    shutdown: F,
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let app = create_router(state, max_body_bytes);

    info!("HTTP server listening on http://{}", addr);
    info!("Health check: http://{}/healthz", addr);
    info!("Ingest:       POST http://{}/v1/events/ingest", addr);

    Server::bind(&addr)
        .http1_header_read_timeout(std::time::Duration::from_secs(5))
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
