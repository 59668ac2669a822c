use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::http::HttpServerState;
use crate::ws::actor::{self, Inbound};

/// 读取上游认证管线写入的身份头
pub fn identity_from_headers(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// GET /ws
///
/// 缺少身份时在升级前返回 401；订阅群组来自目录服务，查询失败时以空订阅接入。
pub async fn ws_upgrade(
    State(state): State<HttpServerState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user_id) = identity_from_headers(&headers, &state.identity_header) else {
        warn!("WebSocket 升级请求缺少身份头: {}", state.identity_header);
        return (StatusCode::UNAUTHORIZED, "missing identity").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let groups = match state.directory.user_groups(&user_id).await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "查询用户群组失败，以空订阅接入");
            Vec::new()
        }
    };
    info!(user_id = %user_id, groups = groups.len(), "WebSocket 连接已认证");

    let settings = state.connection.as_ref().clone();
    let inbound = Inbound {
        hub: state.hub.clone(),
        relay: state.relay.clone(),
        relay_inbound: settings.relay_inbound,
    };
    ws.max_message_size(settings.max_frame_bytes)
        .on_upgrade(move |socket| actor::run_connection(socket, user_id, groups, inbound, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identity_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(identity_from_headers(&headers, "x-user-id"), None);

        headers.insert("x-user-id", HeaderValue::from_static("  "));
        assert_eq!(identity_from_headers(&headers, "x-user-id"), None);

        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        assert_eq!(
            identity_from_headers(&headers, "x-user-id").as_deref(),
            Some("alice")
        );
    }
}
