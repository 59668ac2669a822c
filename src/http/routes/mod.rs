//! HTTP 路由模块
//!
//! - `/ws`      - WebSocket 升级（路径可配置）
//! - `/health`  - 存活检查
//! - `/ready`   - 就绪检查（待投递存储可达）
//! - `/metrics` - Prometheus 抓取端点

pub mod health;
pub mod metrics;

use axum::{routing::get, Router};

use crate::http::HttpServerState;
use crate::ws::handler;

/// 创建所有路由
pub fn create_routes(ws_path: &str) -> Router<HttpServerState> {
    Router::new()
        .route(ws_path, get(handler::ws_upgrade))
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::ready_handler))
        .route("/metrics", get(metrics::metrics_handler))
}
