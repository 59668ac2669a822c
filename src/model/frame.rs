//! Hub → 客户端的出站帧编码
//!
//! 帧在调度引擎里编码一次，以 `Arc<str>` 共享给所有目标会话。

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;

/// 已序列化的出站文本帧
pub type Frame = Arc<str>;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a T,
}

/// 原样序列化（聊天消息、输入状态）
pub fn encode<T: Serialize>(value: &T) -> Result<Frame> {
    Ok(Arc::from(serde_json::to_string(value)?))
}

/// 类型信封 `{"type": "<event>", "data": <payload>}`
pub fn encode_envelope<T: Serialize>(event_type: &str, data: &T) -> Result<Frame> {
    encode(&Envelope { event_type, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let frame = encode_envelope("PostCreated", &json!({"id": "p1"})).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed, json!({"type": "PostCreated", "data": {"id": "p1"}}));
    }
}
