use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{HubError, Result};

/// 文档库的空 ObjectID，上游服务用它表示“未设置”
const NIL_OBJECT_ID: &str = "000000000000000000000000";

/// 聊天消息（私聊或群聊）
///
/// `receiver_id` 与 `group_id` 必须恰好设置一个。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "unset_id_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub receiver_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "unset_id_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_content_type() -> String {
    "text".to_string()
}

fn unset_id_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|id| !id.is_empty() && id != NIL_OBJECT_ID))
}

/// 消息的路由目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Direct(&'a str),
    Group(&'a str),
}

impl ChatMessage {
    pub fn direct(sender_id: &str, receiver_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            receiver_id: Some(receiver_id.to_string()),
            group_id: None,
            group_name: None,
            content: content.to_string(),
            content_type: default_content_type(),
            media_urls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn group(sender_id: &str, group_id: &str, content: &str) -> Self {
        Self {
            receiver_id: None,
            group_id: Some(group_id.to_string()),
            ..Self::direct(sender_id, "", content)
        }
    }

    /// 解析路由目标；两者皆有或皆无都是调用方违约
    pub fn target(&self) -> Result<Target<'_>> {
        match (self.receiver_id.as_deref(), self.group_id.as_deref()) {
            (Some(receiver), None) => Ok(Target::Direct(receiver)),
            (None, Some(group)) => Ok(Target::Group(group)),
            (Some(_), Some(_)) => Err(HubError::InvalidMessage(format!(
                "message {} sets both receiver_id and group_id",
                self.id
            ))),
            (None, None) => Err(HubError::InvalidMessage(format!(
                "message {} has neither receiver_id nor group_id",
                self.id
            ))),
        }
    }

    /// 补全缺失的 id 并校验路由目标，进入调度引擎前调用
    pub fn prepare(&mut self) -> Result<()> {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.sender_id.is_empty() {
            return Err(HubError::InvalidMessage(format!(
                "message {} has no sender",
                self.id
            )));
        }
        self.target().map(|_| ())
    }
}

/// 正在输入事件，从不持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// 群组 id 或对端用户 id
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
    /// 毫秒时间戳，由 Hub 写入
    pub timestamp: i64,
}

impl TypingEvent {
    pub fn new(conversation_id: &str, user_id: &str, is_typing: bool) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            is_typing,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_targets_rejected() {
        let mut msg = ChatMessage::direct("alice", "bob", "hi");
        msg.group_id = Some("g1".to_string());
        assert!(matches!(msg.prepare(), Err(HubError::InvalidMessage(_))));
    }

    #[test]
    fn test_nil_object_id_is_unset() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{
                "id": "m1",
                "sender_id": "alice",
                "receiver_id": "000000000000000000000000",
                "group_id": "g1",
                "content": "hello"
            }"#,
        )
        .unwrap();
        assert_eq!(msg.receiver_id, None);
        assert_eq!(msg.target().unwrap(), Target::Group("g1"));
        assert_eq!(msg.content_type, "text");
    }

    #[test]
    fn test_prepare_assigns_id() {
        let mut msg = ChatMessage::group("alice", "g1", "hi");
        msg.id.clear();
        msg.prepare().unwrap();
        assert!(!msg.id.is_empty());
    }
}
