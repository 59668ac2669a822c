//! GET /metrics - Prometheus 抓取端点

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::HttpServerState;

/// GET /metrics：返回 Prometheus 文本格式指标。
/// 指标上下文没有导出器（noop）时返回 503。
pub async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    match state.metrics.render() {
        Some(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not enabled").into_response(),
    }
}
