//! §3.6/§6: the reference HTTP surface. Route shapes and JSON field
//! names are normative (§6); the transport itself (axum here) is a
//! named collaborator the spec leaves open.
use crate::config::RiskmailConfig;
use crate::webhook::{self, WebhookSink};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use riskmail_engine::{Mode, RiskEngine};
use riskmail_types::{EmailInput, Error as RiskmailError};
use std::sync::Arc;

const REQUEST_ID_HEADER: &str = "x-request-id";
const ADMIN_KEY_HEADER: &str = "x-admin-api-key";

pub struct AppState {
    pub engine: Arc<RiskEngine>,
    pub config: RiskmailConfig,
    pub webhook: Arc<dyn WebhookSink>,
}

pub fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/analyse", post(analyse_full))
        .route("/analyse/fast", post(analyse_fast))
        .route("/results/{job_id}", get(results))
        .route("/healthz", get(healthz))
        .route("/admin/status", get(admin_status))
        .layer(middleware::from_fn(echo_request_id))
        .with_state(state)
}

/// Echoes `X-Request-ID` onto the response so a caller can correlate a
/// request across `riskmaild`'s logs without the server needing to mint
/// one (§6).
async fn echo_request_id(request: Request, next: Next) -> Response {
    let request_id = request.headers().get(REQUEST_ID_HEADER).cloned();
    let mut response = next.run(request).await;
    if let Some(value) = request_id {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn analyse_full(State(state): State<Arc<AppState>>, Json(input): Json<EmailInput>) -> Response {
    analyse(state, input, Mode::Full).await
}

async fn analyse_fast(State(state): State<Arc<AppState>>, Json(input): Json<EmailInput>) -> Response {
    analyse(state, input, Mode::Fast).await
}

async fn analyse(state: Arc<AppState>, input: EmailInput, mode: Mode) -> Response {
    match state.engine.analyse(input, mode).await {
        Ok(envelope) => {
            webhook::maybe_dispatch(state.webhook.clone(), envelope.clone());
            (StatusCode::OK, Json(envelope)).into_response()
        }
        Err(RiskmailError::HardReject(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "HARD_REJECT", "reason": reason.code() })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "unexpected error from analyse");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "INTERNAL" })),
            )
                .into_response()
        }
    }
}

async fn results(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    match riskmail_enrichment::poll_result(state.engine.store().as_ref(), &job_id).await {
        Ok(Some(envelope)) => (StatusCode::OK, Json(envelope)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "NOT_FOUND" })),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(job_id, error = %err, "results lookup failed; store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "STORE_UNAVAILABLE" })),
            )
                .into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// An example admin-gated route; a real deployment would add
/// config-reload / cache-flush endpoints behind the same guard.
async fn admin_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !admin_authorized(&state.config, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "UNAUTHORIZED" })),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "environment": format!("{:?}", state.config.environment),
            "background_enrichment_enabled": state.config.background_enrichment_enabled,
        })),
    )
        .into_response()
}

fn admin_authorized(config: &RiskmailConfig, headers: &HeaderMap) -> bool {
    let supplied = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v: &HeaderValue| v.to_str().ok());
    config.allowed_to_call_admin_routes(supplied)
}
