//! HTTP façade: request parsing, admission, response shaping
//!
//! axum router owning the pool, pipeline, and limiter. Every response to
//! `/v1/render` carries the `X-RateLimit-*` headers; errors come back in
//! the same envelope as successes with the edge status mapped from the
//! first error code.

use crate::api::{self, ApiError, RenderRequestBody, RenderResponse};
use crate::browser_pool::BrowserPool;
use crate::config::Config;
use crate::error::ErrorCode;
use crate::metrics::RenderMetrics;
use crate::pipeline::RenderPipeline;
use crate::rate_limit::{client_key, RateDecision, RateLimiter};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RenderPipeline>,
    pub pool: Arc<BrowserPool>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<RenderMetrics>,
    pub config: Config,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let cors_enabled = state.config.cors_enabled;
    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/v1/pool/status", get(pool_status))
        .route("/v1/render", post(render))
        .with_state(state);

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Bind and serve until the shutdown future resolves, then drain.
pub async fn serve(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), crate::error::RenderError> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::RenderError::Internal(format!("bind {addr}: {e}")))?;
    info!(%addr, "http listener bound");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| crate::error::RenderError::Internal(e.to_string()))
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": "renderd",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "endpoints": {
            "render": "POST /v1/render",
            "health": "GET /health",
            "pool_status": "GET /v1/pool/status",
        },
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let capacity = state.pool.capacity().await;
    state
        .metrics
        .record_pool(capacity.queue_length, capacity.active_leases);
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "pool": capacity,
        "rate_limiter": {
            "enabled": state.limiter.enabled(),
            "active_clients": state.limiter.active_clients().await,
        },
    }))
}

async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    let capacity = state.pool.capacity().await;
    Json(json!({
        "success": true,
        "data": capacity,
    }))
}

async fn render(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let key = client_key(forwarded, &peer);
    let decision = state.limiter.is_allowed(&key).await;

    if !decision.allowed {
        state.metrics.record_rate_limited();
        warn!(client = %key, "request rate limited");
        let response = RenderResponse::failure(
            Uuid::new_v4().to_string(),
            vec![ApiError::new(ErrorCode::RateLimited, "Rate limit exceeded")],
        );
        return respond(StatusCode::TOO_MANY_REQUESTS, &decision, response);
    }

    let raw = match body {
        Ok(Json(value)) => value,
        Err(rejection) => {
            let response = RenderResponse::failure(
                Uuid::new_v4().to_string(),
                vec![ApiError::new(
                    ErrorCode::ValidationError,
                    format!("invalid JSON body: {rejection}"),
                )],
            );
            return respond(StatusCode::BAD_REQUEST, &decision, response);
        }
    };

    let parsed: RenderRequestBody = match serde_json::from_value(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            let response = RenderResponse::failure(
                Uuid::new_v4().to_string(),
                vec![ApiError::new(
                    ErrorCode::ValidationError,
                    format!("invalid request body: {e}"),
                )],
            );
            return respond(StatusCode::BAD_REQUEST, &decision, response);
        }
    };

    let request = match api::validate(parsed) {
        Ok(request) => request,
        Err(field_errors) => {
            let errors = field_errors.into_iter().map(ApiError::from_field).collect();
            let response = RenderResponse::failure(Uuid::new_v4().to_string(), errors);
            return respond(StatusCode::BAD_REQUEST, &decision, response);
        }
    };

    let response = state.pipeline.execute(request).await;
    let status = edge_status(&response);
    respond(status, &decision, response)
}

/// Edge status: 200 on success, otherwise mapped from the first error code.
fn edge_status(response: &RenderResponse) -> StatusCode {
    if response.success {
        return StatusCode::OK;
    }
    let code = response
        .errors
        .as_ref()
        .and_then(|errors| errors.first())
        .map(|e| e.code)
        .unwrap_or(ErrorCode::InternalError);
    StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn respond(status: StatusCode, decision: &RateDecision, body: RenderResponse) -> Response {
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_epoch_secs));
    response
}
