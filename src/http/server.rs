//! HTTP 服务器 - WebSocket 接入与运维端点

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::RelayPublisher;
use crate::hub::HubHandle;
use crate::http::routes;
use crate::infra::{Directory, HubMetrics, PendingStore};
use crate::ws::ConnectionSettings;

/// HTTP 服务器共享状态
#[derive(Clone)]
pub struct HttpServerState {
    pub hub: HubHandle,
    pub store: Arc<dyn PendingStore>,
    pub directory: Arc<dyn Directory>,
    pub metrics: HubMetrics,
    pub relay: Option<Arc<dyn RelayPublisher>>,
    pub connection: Arc<ConnectionSettings>,
    /// 上游认证管线写入身份的请求头
    pub identity_header: String,
}

/// HTTP 服务器
pub struct HttpServer {
    state: HttpServerState,
    ws_path: String,
}

impl HttpServer {
    pub fn new(state: HttpServerState, ws_path: impl Into<String>) -> Self {
        Self {
            state,
            ws_path: ws_path.into(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .merge(routes::create_routes(&self.ws_path))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// 在已绑定的监听器上服务，直到 `shutdown` 完成
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("🌐 HTTP 服务器启动在 {} (ws: {})", addr, self.ws_path);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}
