//! 待投递存储：消息体（带 TTL）、按接收者 / 群组的待投递 ID 集合、群成员缓存
//!
//! 只有 TTL 过期一种淘汰方式，没有容量上限。

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::infra::redis::RedisClient;
use crate::model::{ChatMessage, Target};

/// 消息体默认 TTL：24 小时
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(24 * 3600);

/// 远端存储的键命名空间
pub mod keys {
    pub const MESSAGE_PREFIX: &str = "msg:";
    pub const PENDING_DIRECT_PREFIX: &str = "pending:direct:";
    pub const PENDING_GROUP_PREFIX: &str = "pending:group:";
    pub const GROUP_MEMBERS_PREFIX: &str = "group:members:";
    pub const DELIVERED_PREFIX: &str = "delivered:";

    pub fn message(id: &str) -> String {
        format!("{MESSAGE_PREFIX}{id}")
    }

    pub fn pending_direct(user_id: &str) -> String {
        format!("{PENDING_DIRECT_PREFIX}{user_id}")
    }

    pub fn pending_group(group_id: &str) -> String {
        format!("{PENDING_GROUP_PREFIX}{group_id}")
    }

    pub fn group_members(group_id: &str) -> String {
        format!("{GROUP_MEMBERS_PREFIX}{group_id}")
    }

    /// 用户已从群组集合补发过的消息 ID
    pub fn delivered(user_id: &str) -> String {
        format!("{DELIVERED_PREFIX}{user_id}")
    }
}

/// 待投递集合的归属
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingScope<'a> {
    User(&'a str),
    Group(&'a str),
}

impl PendingScope<'_> {
    pub fn key(&self) -> String {
        match self {
            PendingScope::User(id) => keys::pending_direct(id),
            PendingScope::Group(id) => keys::pending_group(id),
        }
    }
}

/// 待投递存储接口
///
/// 调度引擎只依赖这个 trait；Redis 实现用于多实例部署，内存实现用于单实例与测试。
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// 写入消息体（TTL）并把 ID 加入接收者或群组的待投递集合；必须先于实时投递调用
    ///
    /// 同一 ID 已有消息体时保留原消息体：同一发送者视为重复写入（跨实例转发），
    /// 不同发送者返回 `HubError::Conflict`，不修改任何集合。
    async fn store_message(&self, msg: &ChatMessage) -> Result<()>;

    /// 接收者的待投递 ID（无序）
    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<String>>;

    /// 群组的待投递 ID（无序）
    async fn pending_for_group(&self, group_id: &str) -> Result<Vec<String>>;

    /// 读取消息体；过期或从未写入时返回 `HubError::NotFound`
    async fn fetch(&self, message_id: &str) -> Result<ChatMessage>;

    /// 成功写入会话缓冲之后，把 ID 从待投递集合移除
    async fn ack_delivered(&self, scope: PendingScope<'_>, message_id: &str) -> Result<()>;

    /// 为离线群成员登记待投递
    async fn add_pending_for_user(&self, user_id: &str, message_id: &str) -> Result<()>;

    /// 记录用户已收到某条群组集合中的消息，群组集合本身保留给其他成员
    async fn mark_delivered(&self, user_id: &str, message_id: &str) -> Result<()>;

    /// 用户已收到的群组集合消息 ID
    async fn delivered_for_user(&self, user_id: &str) -> Result<Vec<String>>;

    /// 缓存的群成员；未缓存时返回 None
    async fn group_members(&self, group_id: &str) -> Result<Option<Vec<String>>>;

    async fn cache_group_members(&self, group_id: &str, members: &[String]) -> Result<()>;

    /// 可达性检查（/ready）
    async fn ping(&self) -> Result<()>;
}

/// 基于 Redis 的待投递存储
pub struct RedisPendingStore {
    client: RedisClient,
    ttl: Duration,
    members_ttl: Duration,
}

impl RedisPendingStore {
    pub fn new(client: RedisClient, ttl: Duration, members_ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            members_ttl,
        }
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }
}

/// 计算消息应进入的待投递集合
pub(crate) fn index_key(msg: &ChatMessage) -> Result<String> {
    Ok(match msg.target()? {
        Target::Direct(receiver) => keys::pending_direct(receiver),
        Target::Group(group) => keys::pending_group(group),
    })
}

/// 已存在的消息体只接受同一发送者的重复写入
pub(crate) fn ensure_same_sender(existing: &ChatMessage, msg: &ChatMessage) -> Result<()> {
    if existing.sender_id != msg.sender_id {
        return Err(HubError::Conflict(format!(
            "message {} already stored for sender {}",
            msg.id, existing.sender_id
        )));
    }
    Ok(())
}

#[async_trait]
impl PendingStore for RedisPendingStore {
    async fn store_message(&self, msg: &ChatMessage) -> Result<()> {
        let index = index_key(msg)?;
        let body = serde_json::to_string(msg)?;
        let key = keys::message(&msg.id);

        // SET NX：先写消息体，再登记索引，集合里的 ID 总有消息体
        if !self.client.set_nx_ex(&key, &body, self.ttl).await? {
            match self.fetch(&msg.id).await {
                Ok(existing) => ensure_same_sender(&existing, msg)?,
                // 两次读写之间恰好过期
                Err(e) if e.is_not_found() => {
                    if !self.client.set_nx_ex(&key, &body, self.ttl).await? {
                        return Err(HubError::Conflict(format!(
                            "message {} written concurrently",
                            msg.id
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.client.sadd_with_ttl(&index, &msg.id, self.ttl).await?;
        debug!(message_id = %msg.id, index = %index, "消息已写入待投递存储");
        Ok(())
    }

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.client.smembers(&keys::pending_direct(user_id)).await
    }

    async fn pending_for_group(&self, group_id: &str) -> Result<Vec<String>> {
        self.client.smembers(&keys::pending_group(group_id)).await
    }

    async fn fetch(&self, message_id: &str) -> Result<ChatMessage> {
        let body = self
            .client
            .get(&keys::message(message_id))
            .await?
            .ok_or_else(|| HubError::NotFound(format!("message {}", message_id)))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn ack_delivered(&self, scope: PendingScope<'_>, message_id: &str) -> Result<()> {
        self.client.srem(&scope.key(), message_id).await
    }

    async fn add_pending_for_user(&self, user_id: &str, message_id: &str) -> Result<()> {
        self.client
            .sadd_with_ttl(&keys::pending_direct(user_id), message_id, self.ttl)
            .await
    }

    async fn mark_delivered(&self, user_id: &str, message_id: &str) -> Result<()> {
        self.client
            .sadd_with_ttl(&keys::delivered(user_id), message_id, self.ttl)
            .await
    }

    async fn delivered_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.client.smembers(&keys::delivered(user_id)).await
    }

    async fn group_members(&self, group_id: &str) -> Result<Option<Vec<String>>> {
        let members = self.client.smembers(&keys::group_members(group_id)).await?;
        Ok(if members.is_empty() { None } else { Some(members) })
    }

    async fn cache_group_members(&self, group_id: &str, members: &[String]) -> Result<()> {
        self.client
            .replace_set(&keys::group_members(group_id), members, self.members_ttl)
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }
}
