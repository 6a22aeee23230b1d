//! HTTP API over the shared limiters and credentials
//!
//! Endpoints:
//! - GET    /health                         - liveness and inventory
//! - GET    /metrics                        - Prometheus exposition
//! - GET    /v1/limiters                    - metrics for every open limiter
//! - GET    /v1/limiters/{name}             - metrics for one limiter
//! - POST   /v1/limiters/{name}/acquire     - take one admission or get 429
//! - POST   /v1/limiters/{name}/wait        - block until admitted (`?timeout_ms=`)
//! - GET    /v1/accounts/{account}/token    - a valid access token for the account
//! - DELETE /v1/accounts/{account}/token    - drop the stored credential
//!
//! Errors are JSON: `{"error": {"type": ..., "message": ...}}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use credentials::CredentialManager;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use throttle::RateLimiter;
use tracing::{info, warn};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiters: Arc<HashMap<String, Arc<RateLimiter>>>,
    pub credentials: Option<Arc<CredentialManager>>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/limiters", get(list_limiters))
        .route("/v1/limiters/{name}", get(limiter_status))
        .route("/v1/limiters/{name}/acquire", post(acquire))
        .route("/v1/limiters/{name}/wait", post(wait))
        .route(
            "/v1/accounts/{account}/token",
            get(get_token).delete(revoke_token),
        )
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": { "type": kind, "message": message.into() }
        }),
    )
}

/// Map a limiter failure to a response. Denials carry `Retry-After` in
/// whole seconds, rounded up.
fn limiter_error(name: &str, err: throttle::Error) -> Response {
    match err {
        throttle::Error::AdmissionDenied { retry_after } => {
            let retry_after_ms = retry_after.as_millis();
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            let body = serde_json::json!({
                "error": {
                    "type": "admission_denied",
                    "message": format!("limiter {name} is at capacity"),
                    "retry_after_ms": retry_after_ms as u64,
                }
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    (CONTENT_TYPE, "application/json".to_string()),
                    (RETRY_AFTER, seconds.to_string()),
                ],
                body.to_string(),
            )
                .into_response()
        }
        throttle::Error::Closed(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "limiter_closed",
            format!("limiter {name} is closed"),
        ),
        other => {
            warn!(limiter = name, error = %other, "limiter error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "limiter_error",
                other.to_string(),
            )
        }
    }
}

fn unknown_limiter(name: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("unknown limiter: {name}"),
    )
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let accounts = match &state.credentials {
        Some(manager) => manager.account_keys().await.len(),
        None => 0,
    };
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "limiters": state.limiters.len(),
            "accounts": accounts,
        }),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// GET /v1/limiters - closed limiters are left out.
async fn list_limiters(State(state): State<AppState>) -> impl IntoResponse {
    let mut names: Vec<&String> = state.limiters.keys().collect();
    names.sort();

    let mut limiters = Vec::with_capacity(names.len());
    for name in names {
        if let Ok(metrics) = state.limiters[name].metrics().await {
            limiters.push(serde_json::json!({ "name": name, "metrics": metrics }));
        }
    }
    json_response(StatusCode::OK, serde_json::json!({ "limiters": limiters }))
}

async fn limiter_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let Some(limiter) = state.limiters.get(&name) else {
        return unknown_limiter(&name);
    };
    match limiter.metrics().await {
        Ok(metrics) => json_response(StatusCode::OK, serde_json::json!(metrics)),
        Err(e) => limiter_error(&name, e),
    }
}

async fn acquire(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(limiter) = state.limiters.get(&name) else {
        return unknown_limiter(&name);
    };
    match limiter.acquire().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => limiter_error(&name, e),
    }
}

#[derive(Deserialize)]
struct WaitParams {
    timeout_ms: Option<u64>,
}

/// POST /v1/limiters/{name}/wait - 204 once admitted, 408 if `timeout_ms`
/// passes first. Without `timeout_ms` the request waits indefinitely.
async fn wait(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
) -> Response {
    let Some(limiter) = state.limiters.get(&name) else {
        return unknown_limiter(&name);
    };

    let start = Instant::now();
    let result = limiter
        .wait_for_token(params.timeout_ms.map(Duration::from_millis))
        .await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(true) => {
            crate::metrics::record_wait(&name, true, elapsed);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => {
            crate::metrics::record_wait(&name, false, elapsed);
            error_response(
                StatusCode::REQUEST_TIMEOUT,
                "timeout",
                format!("no admission from limiter {name} within the timeout"),
            )
        }
        Err(e) => limiter_error(&name, e),
    }
}

/// GET /v1/accounts/{account}/token - never includes the refresh token.
async fn get_token(State(state): State<AppState>, Path(account): Path<String>) -> Response {
    let Some(manager) = &state.credentials else {
        crate::metrics::record_token_request("unknown_account");
        return unknown_account(&account);
    };

    match manager.get_valid_token(&account).await {
        Ok(credential) => {
            crate::metrics::record_token_request("ok");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "account_key": credential.account_key,
                    "access_token": credential.access_token,
                    "token_type": credential.token_type,
                    "expires_at": credential.expires_at.map(|at| at.to_rfc3339()),
                    "authorization": credential.authorization(),
                }),
            )
        }
        Err(credentials::Error::UnknownAccount(_)) => {
            crate::metrics::record_token_request("unknown_account");
            unknown_account(&account)
        }
        Err(e) => {
            crate::metrics::record_token_request("error");
            warn!(account_key = account, error = %e, "failed to obtain credential");
            error_response(StatusCode::BAD_GATEWAY, "credential_error", e.to_string())
        }
    }
}

async fn revoke_token(State(state): State<AppState>, Path(account): Path<String>) -> Response {
    let Some(manager) = &state.credentials else {
        return unknown_account(&account);
    };
    if !manager.is_registered(&account).await {
        return unknown_account(&account);
    }

    match manager.revoke(&account).await {
        Ok(removed) => {
            info!(account_key = account, removed = removed.is_some(), "credential revoked via API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "credential_error",
            e.to_string(),
        ),
    }
}

fn unknown_account(account: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("unknown account: {account}"),
    )
}
