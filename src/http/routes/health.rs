use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::http::HttpServerState;

/// GET /health
pub async fn health_handler(State(state): State<HttpServerState>) -> Response {
    let status = if state.hub.is_closed() { "stopping" } else { "ok" };
    Json(json!({ "status": status })).into_response()
}

/// GET /ready：调度引擎运行且待投递存储可达
pub async fn ready_handler(State(state): State<HttpServerState>) -> Response {
    if state.hub.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "reason": "hub stopped" })),
        )
            .into_response();
    }
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => {
            warn!("就绪检查失败: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "reason": e.to_string() })),
            )
                .into_response()
        }
    }
}
