use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::pending_store::{
    ensure_same_sender, index_key, keys, PendingScope, PendingStore, DEFAULT_PENDING_TTL,
};
use crate::error::{HubError, Result};
use crate::model::ChatMessage;

/// 进程内待投递存储
///
/// 未配置 Redis 时使用（单实例模式），语义与 Redis 实现一致：消息体与待投递集合中的
/// 每个 ID 都按 TTL 过期，集合按键独立原子更新。
pub struct MemoryPendingStore {
    ttl: Duration,
    bodies: DashMap<String, (String, Instant)>,
    /// 集合键 -> (消息 ID -> 过期时间)
    sets: DashMap<String, HashMap<String, Instant>>,
    members: DashMap<String, HashSet<String>>,
    /// 故障注入：为 true 时所有写操作返回 Redis 错误
    fail_writes: AtomicBool,
}

impl Default for MemoryPendingStore {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}

impl MemoryPendingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bodies: DashMap::new(),
            sets: DashMap::new(),
            members: DashMap::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 清理已过期的消息体与集合成员，返回清理的消息体数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.bodies.len();
        self.bodies.retain(|_, (_, expires_at)| *expires_at > now);
        self.sets.retain(|_, ids| {
            ids.retain(|_, expires_at| *expires_at > now);
            !ids.is_empty()
        });
        before - self.bodies.len()
    }

    /// 当前保存的集合数量
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HubError::Redis("store unavailable".to_string()));
        }
        Ok(())
    }

    fn add_to_set(&self, key: String, message_id: &str) {
        self.sets
            .entry(key)
            .or_default()
            .insert(message_id.to_string(), Instant::now() + self.ttl);
    }

    fn live_members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        self.sets
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn store_message(&self, msg: &ChatMessage) -> Result<()> {
        self.check_writable()?;
        let index = index_key(msg)?;
        let body = serde_json::to_string(msg)?;
        let now = Instant::now();

        match self.bodies.entry(keys::message(&msg.id)) {
            Entry::Occupied(mut entry) => {
                if entry.get().1 > now {
                    let existing: ChatMessage = serde_json::from_str(&entry.get().0)?;
                    ensure_same_sender(&existing, msg)?;
                } else {
                    entry.insert((body, now + self.ttl));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert((body, now + self.ttl));
            }
        }
        self.add_to_set(index, &msg.id);
        Ok(())
    }

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.live_members(&keys::pending_direct(user_id)))
    }

    async fn pending_for_group(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self.live_members(&keys::pending_group(group_id)))
    }

    async fn fetch(&self, message_id: &str) -> Result<ChatMessage> {
        let key = keys::message(message_id);
        let body = match self.bodies.get(&key) {
            Some(entry) if entry.1 > Instant::now() => entry.0.clone(),
            _ => return Err(HubError::NotFound(format!("message {}", message_id))),
        };
        Ok(serde_json::from_str(&body)?)
    }

    async fn ack_delivered(&self, scope: PendingScope<'_>, message_id: &str) -> Result<()> {
        self.check_writable()?;
        let key = scope.key();
        let now_empty = match self.sets.get_mut(&key) {
            Some(mut ids) => {
                ids.remove(message_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.sets.remove_if(&key, |_, ids| ids.is_empty());
        }
        Ok(())
    }

    async fn add_pending_for_user(&self, user_id: &str, message_id: &str) -> Result<()> {
        self.check_writable()?;
        self.add_to_set(keys::pending_direct(user_id), message_id);
        Ok(())
    }

    async fn mark_delivered(&self, user_id: &str, message_id: &str) -> Result<()> {
        self.check_writable()?;
        self.add_to_set(keys::delivered(user_id), message_id);
        Ok(())
    }

    async fn delivered_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.live_members(&keys::delivered(user_id)))
    }

    async fn group_members(&self, group_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .members
            .get(group_id)
            .map(|members| members.iter().cloned().collect()))
    }

    async fn cache_group_members(&self, group_id: &str, members: &[String]) -> Result<()> {
        self.check_writable()?;
        if members.is_empty() {
            self.members.remove(group_id);
        } else {
            self.members
                .insert(group_id.to_string(), members.iter().cloned().collect());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
