//! 客户端上行帧：`{"type": ..., "payload": ...}`

use serde::Deserialize;
use serde_json::Value;

use crate::error::{HubError, Result};
use crate::model::ChatMessage;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    conversation_id: String,
    #[serde(default)]
    is_typing: bool,
}

/// 解析后的客户端帧
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Message(ChatMessage),
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    /// 仅刷新活跃时间
    Presence,
    /// 未识别的类型，记录后忽略
    Unknown(String),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let frame = match envelope.kind.as_str() {
            "message" => ClientFrame::Message(serde_json::from_value(envelope.payload)?),
            "typing" => {
                let typing: TypingPayload = serde_json::from_value(envelope.payload)?;
                ClientFrame::Typing {
                    conversation_id: typing.conversation_id,
                    is_typing: typing.is_typing,
                }
            }
            "presence" => ClientFrame::Presence,
            _ => ClientFrame::Unknown(envelope.kind),
        };
        Ok(frame)
    }
}

/// 校验客户端发来的聊天消息：发送者必须是会话身份，内容非空，目标唯一
///
/// 消息 ID 一律由服务端签发，客户端携带的 `id` 被丢弃。
pub fn accept_message(mut msg: ChatMessage, identity: &str) -> Result<ChatMessage> {
    if msg.sender_id != identity {
        return Err(HubError::InvalidMessage(format!(
            "sender {} does not match session identity",
            msg.sender_id
        )));
    }
    if msg.content.trim().is_empty() {
        return Err(HubError::InvalidMessage("empty content".to_string()));
    }
    msg.id = uuid::Uuid::new_v4().to_string();
    msg.prepare()?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_frame() {
        let frame = ClientFrame::parse(
            r#"{"type":"message","payload":{"sender_id":"alice","receiver_id":"bob","content":"hi"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Message(msg) => {
                assert_eq!(msg.sender_id, "alice");
                assert_eq!(msg.receiver_id.as_deref(), Some("bob"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_typing_and_presence() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"typing","payload":{"conversation_id":"g1","is_typing":true}}"#)
                .unwrap(),
            ClientFrame::Typing {
                conversation_id: "g1".to_string(),
                is_typing: true
            }
        );
        assert_eq!(
            ClientFrame::parse(r#"{"type":"presence"}"#).unwrap(),
            ClientFrame::Presence
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"wave","payload":{}}"#).unwrap(),
            ClientFrame::Unknown("wave".to_string())
        );
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn test_accept_message_checks_identity_and_content() {
        let msg = ChatMessage::direct("alice", "bob", "hi");
        assert!(accept_message(msg.clone(), "mallory").is_err());
        assert!(accept_message(ChatMessage::direct("alice", "bob", "  "), "alice").is_err());

        let accepted = accept_message(msg, "alice").unwrap();
        assert!(!accepted.id.is_empty());
    }

    #[test]
    fn test_client_chosen_id_is_replaced() {
        let mut msg = ChatMessage::direct("mallory", "bob", "clobbered");
        msg.id = "known-id".to_string();

        let accepted = accept_message(msg, "mallory").unwrap();
        assert_ne!(accepted.id, "known-id");
        assert!(!accepted.id.is_empty());
    }

    #[test]
    fn test_accept_message_rejects_two_targets() {
        let mut msg = ChatMessage::direct("alice", "bob", "hi");
        msg.group_id = Some("g1".to_string());
        assert!(matches!(
            accept_message(msg, "alice"),
            Err(HubError::InvalidMessage(_))
        ));
    }
}
