use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// 推送给客户端的通知事件类型
pub const NOTIFICATION_CREATED: &str = "NOTIFICATION_CREATED";

/// 事件日志中的领域事件信封 `{"type": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// 领域事件的路由策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// 推送给所有在线会话
    BroadcastAll,
    /// 推送给帖子作者
    PostAuthor { post_id: String },
    /// 推送给评论作者
    CommentAuthor { comment_id: String },
    /// 未知类型，丢弃
    Unknown,
}

#[derive(Deserialize)]
struct CommentRef {
    post_id: String,
}

#[derive(Deserialize)]
struct ReplyRef {
    comment_id: String,
}

impl DomainEvent {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }

    /// 根据类型标签选择路由策略；载荷缺少所需字段时返回解码错误
    pub fn route(&self) -> Result<EventRoute> {
        let route = match self.event_type.as_str() {
            "PostCreated" | "ReactionCreated" | "ReactionDeleted" => EventRoute::BroadcastAll,
            "CommentCreated" => {
                let comment: CommentRef = serde_json::from_value(self.data.clone())?;
                EventRoute::PostAuthor {
                    post_id: comment.post_id,
                }
            }
            "ReplyCreated" => {
                let reply: ReplyRef = serde_json::from_value(self.data.clone())?;
                EventRoute::CommentAuthor {
                    comment_id: reply.comment_id,
                }
            }
            _ => EventRoute::Unknown,
        };
        Ok(route)
    }
}

/// 通知（已由生产方持久化，Hub 只做实时推送）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(rename = "type", default)]
    pub notification_type: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub target_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comment_routes_to_post_author() {
        let event = DomainEvent::new(
            "CommentCreated",
            json!({"id": "c1", "post_id": "p1", "user_id": "u2", "content": "nice"}),
        );
        assert_eq!(
            event.route().unwrap(),
            EventRoute::PostAuthor {
                post_id: "p1".to_string()
            }
        );
    }

    #[test]
    fn test_reply_without_comment_id_is_decode_error() {
        let event = DomainEvent::new("ReplyCreated", json!({"id": "r1"}));
        assert!(event.route().is_err());
    }

    #[test]
    fn test_unknown_type() {
        let event: DomainEvent =
            serde_json::from_str(r#"{"type":"UnknownThing","data":{}}"#).unwrap();
        assert_eq!(event.route().unwrap(), EventRoute::Unknown);
    }

    #[test]
    fn test_notification_type_field() {
        let n: Notification = serde_json::from_str(
            r#"{"id":"n1","recipient_id":"bob","sender_id":"alice","type":"LIKE","target_id":"p1","target_type":"post","content":"liked","read":false,"created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(n.notification_type, "LIKE");
        assert_eq!(n.recipient_id, "bob");
    }
}
