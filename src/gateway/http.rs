//! HTTP surface
//!
//! Single-shot endpoints plus the WebSocket upgrade. Render work always
//! runs on detached tasks: a client that disconnects mid-request cancels
//! only calls that have not begun acquisition, while acquired instances
//! finish their render and release back to their shard.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::RenderError;
use crate::router::Router;

use super::pipeline::{build_dispatch, collect_batch};
use super::session::{CancelOnDrop, ConnectionType, SessionManager};
use super::types::{
    BatchRequest, BatchResponse, ErrorBody, RenderCall, RenderOneRequest, RenderOneResponse,
    StatsResponse,
};
use super::validation::{BatchLimits, prepare_batch};
use super::ws;

/// Tenant identity header; populated by the authenticating proxy upstream
pub const TENANT_HEADER: &str = "x-platen-tenant";

/// Shared state for every gateway handler
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ServiceConfig>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionManager>,
}

impl GatewayState {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_document_bytes: self.config.max_document_bytes(),
            max_batch_calls: self.config.max_batch_calls(),
        }
    }
}

/// Build the gateway router
pub fn app(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/stats", get(stats))
        .route("/v1/render", post(render_one))
        .route("/v1/render/batch", post(render_batch))
        .route("/v1/session", get(ws::session_upgrade))
        .with_state(state)
}

/// Identity arrives pre-authenticated; absent means the default tenant
pub(crate) fn tenant_identity(headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("default")
        .to_string()
}

async fn ping() -> &'static str {
    "pong"
}

async fn stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    let shard_stats = state.router.registry().stats().await;
    let mut response = StatsResponse {
        total_instances: 0,
        idle_instances: 0,
        busy_instances: 0,
        starting_instances: 0,
        queued_waiters: 0,
        total_rendered: 0,
        fallback_renders: state.router.fallback_renders(),
        active_sessions: state.sessions.active_count(),
        current_load: 0.0,
    };
    for shard in &shard_stats {
        response.total_instances += shard.total_instances;
        response.idle_instances += shard.idle_instances;
        response.busy_instances += shard.busy_instances;
        response.starting_instances += shard.starting_instances;
        response.queued_waiters += shard.queued_waiters;
        response.total_rendered += shard.total_rendered;
    }
    let capacity = state.config.shards() * state.config.pool().max_instances();
    if capacity > 0 {
        response.current_load = response.busy_instances as f64 / capacity as f64;
    }
    Json(response)
}

async fn render_one(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<RenderOneRequest>,
) -> Result<Json<RenderOneResponse>, RenderError> {
    let identity = tenant_identity(&headers);
    let call = RenderCall {
        id: Some("render".to_string()),
        document: request.document,
        options: request.options,
        depends_on: Vec::new(),
    };
    let mut prepared = prepare_batch(vec![call], &state.batch_limits())?;
    let Some(prepared_call) = prepared.pop() else {
        return Err(RenderError::Validation("no call to dispatch".to_string()));
    };

    let (guard, cancel) = CancelOnDrop::new();
    let mut handles = build_dispatch(&state.router, &identity, vec![prepared_call], &cancel);
    let Some(handle) = handles.pop() else {
        return Err(RenderError::Validation("no call to dispatch".to_string()));
    };
    let task = tokio::spawn(async move { handle.future.await });
    let output = task
        .await
        .map_err(|_| RenderError::PoolUnavailable("render task failed".to_string()))??;
    drop(guard);
    Ok(Json(RenderOneResponse {
        data: BASE64.encode(&output.data),
        timing_ms: output.timing_ms,
    }))
}

async fn render_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, RenderError> {
    let identity = tenant_identity(&headers);
    let prepared = prepare_batch(request.calls, &state.batch_limits())?;
    let session = state
        .sessions
        .open(identity.clone(), ConnectionType::Batch);
    state.sessions.add_pending(session, prepared.len());

    let (guard, cancel) = CancelOnDrop::new();
    let handles = build_dispatch(&state.router, &identity, prepared, &cancel);
    let task = tokio::spawn(collect_batch(handles));
    let result = task
        .await
        .map_err(|_| RenderError::PoolUnavailable("batch task failed".to_string()));
    state.sessions.close(session);
    drop(guard);
    Ok(Json(result?))
}

impl IntoResponse for RenderError {
    fn into_response(self) -> Response {
        let status = match &self {
            RenderError::Validation(_) => StatusCode::BAD_REQUEST,
            RenderError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RenderError::DependencyFailed { .. } => StatusCode::FAILED_DEPENDENCY,
            RenderError::InstanceCrash(_) | RenderError::RenderFailed(_) => StatusCode::BAD_GATEWAY,
            RenderError::CreationFailure(_) | RenderError::PoolUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RenderError::ConnectionLost => StatusCode::REQUEST_TIMEOUT,
        };
        let retry_after = self.retry_after();
        let mut response =
            (status, Json(json!({ "error": ErrorBody::from(&self) }))).into_response();
        if let Some(retry) = retry_after {
            let secs = retry.as_secs().max(1);
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_falls_back_to_default() {
        let headers = HeaderMap::new();
        assert_eq!(tenant_identity(&headers), "default");
    }

    #[test]
    fn tenant_header_is_honored() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, "acme".parse().expect("header value"));
        assert_eq!(tenant_identity(&headers), "acme");
    }

    #[test]
    fn capacity_response_carries_retry_after() {
        let error = RenderError::CapacityExceeded {
            retry_after: std::time::Duration::from_millis(1500),
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
