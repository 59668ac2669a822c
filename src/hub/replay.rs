//! 上线补发：把会话离线期间积压的消息推给新会话
//!
//! 来源为用户自己的待投递集合与其订阅群组的待投递集合。集合无序，
//! 补发前按消息自身的 `created_at` 排序；只有写入会话缓冲成功之后才确认。
//! 群组集合不按成员清空，用户收到其中的消息后记入自己的已投递集合，之后的补发跳过。

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::infra::{HubMetrics, PendingScope, PendingStore};
use crate::model::{frame, ChatMessage};
use crate::session::{SendOutcome, Session};

/// 待补发 ID 的来源集合
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    /// `pending:direct:{user}`
    User,
    /// `pending:group:{group}`
    Group(String),
}

/// 一次补发的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub delivered: usize,
    pub expired: usize,
    pub skipped: usize,
    /// 会话缓冲持续满或已关闭，剩余消息留待下次上线
    pub interrupted: bool,
}

/// 补发 `session` 的待投递消息
pub async fn replay_pending(
    store: &dyn PendingStore,
    session: &Session,
    metrics: &HubMetrics,
    wait: Duration,
) -> ReplayOutcome {
    let user_id = session.user_id();
    let mut outcome = ReplayOutcome::default();

    // message_id -> 来源集合（同一 ID 可能同时在用户与群组集合中）
    let mut sources: BTreeMap<String, Vec<Source>> = BTreeMap::new();
    match store.pending_for_user(user_id).await {
        Ok(ids) => {
            for id in ids {
                sources.entry(id).or_default().push(Source::User);
            }
        }
        Err(e) => warn!(user_id = %user_id, error = %e, "读取用户待投递集合失败"),
    }
    for group in session.subscriptions() {
        match store.pending_for_group(group).await {
            Ok(ids) => {
                for id in ids {
                    sources.entry(id).or_default().push(Source::Group(group.clone()));
                }
            }
            Err(e) => warn!(group_id = %group, error = %e, "读取群组待投递集合失败"),
        }
    }

    if sources
        .values()
        .any(|from| from.iter().any(|source| matches!(source, Source::Group(_))))
    {
        match store.delivered_for_user(user_id).await {
            Ok(seen) => {
                for id in seen {
                    if let Some(from) = sources.get_mut(&id) {
                        from.retain(|source| *source == Source::User);
                    }
                }
                sources.retain(|_, from| !from.is_empty());
            }
            Err(e) => warn!(user_id = %user_id, error = %e, "读取已投递集合失败"),
        }
    }

    if sources.is_empty() {
        return outcome;
    }

    let mut batch: Vec<(ChatMessage, Vec<Source>)> = Vec::with_capacity(sources.len());
    for (id, from) in sources {
        match store.fetch(&id).await {
            Ok(msg) => {
                let valid: Vec<Source> = from
                    .into_iter()
                    .filter(|source| belongs_to(&msg, user_id, source))
                    .collect();
                if valid.is_empty() {
                    debug!(message_id = %id, user_id = %user_id, "待投递消息与会话不匹配，跳过");
                    outcome.skipped += 1;
                } else {
                    batch.push((msg, valid));
                }
            }
            Err(e) if e.is_not_found() => {
                // 消息体已过期：从所有来源集合中清理
                outcome.expired += 1;
                for source in &from {
                    forget(store, user_id, source, &id).await;
                }
            }
            Err(e) => {
                warn!(message_id = %id, error = %e, "读取待投递消息失败，跳过");
                outcome.skipped += 1;
            }
        }
    }

    batch.sort_by(|(a, _), (b, _)| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    for (msg, from) in batch {
        let frame = match frame::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(message_id = %msg.id, error = %e, "补发消息序列化失败");
                outcome.skipped += 1;
                continue;
            }
        };

        match session.send_within(frame, wait).await {
            SendOutcome::Sent => {
                outcome.delivered += 1;
                metrics.record_message_sent("replay");
                for source in &from {
                    ack(store, user_id, source, &msg.id).await;
                }
            }
            SendOutcome::Full | SendOutcome::Closed => {
                outcome.interrupted = true;
                break;
            }
        }
    }

    info!(
        user_id = %user_id,
        session_id = %session.id(),
        delivered = outcome.delivered,
        expired = outcome.expired,
        skipped = outcome.skipped,
        interrupted = outcome.interrupted,
        "📬 离线消息补发完成"
    );
    outcome
}

/// 该来源集合中的消息是否确实属于这个会话
fn belongs_to(msg: &ChatMessage, user_id: &str, source: &Source) -> bool {
    match source {
        // 用户集合既有私聊，也有离线时登记的群消息
        Source::User => msg.receiver_id.as_deref() == Some(user_id) || msg.group_id.is_some(),
        Source::Group(group) => msg.group_id.as_deref() == Some(group.as_str()),
    }
}

/// 用户集合直接移除；群组集合只由引擎在按成员分发之后确认，
/// 这里只为当前用户记一笔已投递，以免吞掉其他离线成员的消息
async fn ack(store: &dyn PendingStore, user_id: &str, source: &Source, message_id: &str) {
    let acked = match source {
        Source::User => {
            store
                .ack_delivered(PendingScope::User(user_id), message_id)
                .await
        }
        Source::Group(_) => store.mark_delivered(user_id, message_id).await,
    };
    if let Err(e) = acked {
        warn!(message_id = %message_id, user_id = %user_id, error = %e, "待投递确认失败");
    }
}

/// 消息体过期后移除集合中的残留 ID
async fn forget(store: &dyn PendingStore, user_id: &str, source: &Source, message_id: &str) {
    let scope = match source {
        Source::User => PendingScope::User(user_id),
        Source::Group(group) => PendingScope::Group(group),
    };
    if let Err(e) = store.ack_delivered(scope, message_id).await {
        debug!(message_id = %message_id, error = %e, "清理过期待投递 ID 失败");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::MemoryPendingStore;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn test_replay_sorted_by_created_at_and_acked() {
        let store = MemoryPendingStore::default();
        let mut later = ChatMessage::direct("alice", "bob", "second");
        let mut earlier = ChatMessage::direct("alice", "bob", "first");
        earlier.created_at = Utc::now() - ChronoDuration::minutes(5);
        later.created_at = Utc::now();
        store.store_message(&later).await.unwrap();
        store.store_message(&earlier).await.unwrap();

        let (session, mut rx) = Session::new("bob", Vec::<String>::new(), 8);
        let outcome =
            replay_pending(&store, &session, &HubMetrics::noop(), Duration::from_millis(50)).await;

        assert_eq!(outcome.delivered, 2);
        let first: ChatMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: ChatMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
        assert!(store.pending_for_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_buffer_stops_without_ack() {
        let store = MemoryPendingStore::default();
        for i in 0..3 {
            let msg = ChatMessage::direct("alice", "bob", &format!("m{i}"));
            store.store_message(&msg).await.unwrap();
        }

        let (session, _rx) = Session::new("bob", Vec::<String>::new(), 1);
        let outcome =
            replay_pending(&store, &session, &HubMetrics::noop(), Duration::from_millis(10)).await;

        assert_eq!(outcome.delivered, 1);
        assert!(outcome.interrupted);
        assert_eq!(store.pending_for_user("bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_ids_are_cleaned() {
        let store = MemoryPendingStore::default();
        store.add_pending_for_user("bob", "gone").await.unwrap();

        let (session, _rx) = Session::new("bob", Vec::<String>::new(), 4);
        let outcome =
            replay_pending(&store, &session, &HubMetrics::noop(), Duration::from_millis(10)).await;

        assert_eq!(outcome.expired, 1);
        assert!(store.pending_for_user("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_set_is_replayed_but_left_for_other_members() {
        let store = MemoryPendingStore::default();
        let msg = ChatMessage::group("alice", "g2", "hi");
        store.store_message(&msg).await.unwrap();

        let (session, mut rx) = Session::new("bob", ["g2"], 4);
        let outcome =
            replay_pending(&store, &session, &HubMetrics::noop(), Duration::from_millis(10)).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(store.pending_for_group("g2").await.unwrap(), vec![msg.id.clone()]);
        assert_eq!(store.delivered_for_user("bob").await.unwrap(), vec![msg.id.clone()]);

        // 同一用户再次上线不会重复收到
        let (again, mut again_rx) = Session::new("bob", ["g2"], 4);
        let outcome =
            replay_pending(&store, &again, &HubMetrics::noop(), Duration::from_millis(10)).await;
        assert_eq!(outcome, ReplayOutcome::default());
        assert!(again_rx.try_recv().is_err());

        // 未订阅 g2 的会话拿不到
        let (other, mut other_rx) = Session::new("carol", ["g1"], 4);
        let outcome =
            replay_pending(&store, &other, &HubMetrics::noop(), Duration::from_millis(10)).await;
        assert_eq!(outcome, ReplayOutcome::default());
        assert!(other_rx.try_recv().is_err());
    }
}
