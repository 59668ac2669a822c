use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{replay, Hub, HubEvent};
use crate::error::{HubError, Result};
use crate::infra::PendingScope;
use crate::model::{
    frame, ChatMessage, DomainEvent, EventRoute, Frame, Notification, Target, TypingEvent,
    NOTIFICATION_CREATED,
};
use crate::session::{SendOutcome, Session};

impl Hub {
    pub(super) async fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => self.on_register(session),
            HubEvent::Unregister(session) => {
                self.registry.remove(&session);
            }
            HubEvent::Broadcast(msg) => self.on_broadcast(msg).await,
            HubEvent::Typing(typing) => self.on_typing(typing),
            HubEvent::Feed(event) => self.on_domain_event(event),
            HubEvent::Notification(notification) => self.on_notification(notification),
            HubEvent::Sweep { cutoff, reply } => {
                let reaped = self.on_sweep(cutoff);
                if let Some(reply) = reply {
                    let _ = reply.send(reaped);
                }
            }
            HubEvent::RouteToUser {
                user_id,
                frame,
                kind,
            } => {
                let sessions = self.registry.sessions_for_user(&user_id);
                if sessions.is_empty() {
                    debug!(user_id = %user_id, kind, "归属者不在线，丢弃实时事件");
                }
                self.fan_out(sessions, &frame, kind);
            }
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_register(&mut self, session: Arc<Session>) {
        if !self.registry.add(session.clone()) {
            debug!(session_id = %session.id(), "会话已注册，忽略重复注册");
            return;
        }
        info!(
            user_id = %session.user_id(),
            session_id = %session.id(),
            connections = self.registry.len(),
            "🔌 会话上线"
        );

        // 补发在独立任务中进行，不阻塞引擎
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let wait = self.replay_send_timeout;
        tokio::spawn(async move {
            replay::replay_pending(store.as_ref(), &session, &metrics, wait).await;
        });
    }

    /// 先持久化，再实时扇出
    async fn on_broadcast(&mut self, msg: ChatMessage) {
        let started = Instant::now();

        // 写入失败只记录日志，实时投递照常进行；ID 冲突的消息直接丢弃
        match self.store.store_message(&msg).await {
            Ok(()) => {}
            Err(e @ HubError::Conflict(_)) => {
                warn!(message_id = %msg.id, sender_id = %msg.sender_id, error = %e, "消息 ID 冲突，丢弃");
                return;
            }
            Err(e) => {
                error!(message_id = %msg.id, error = %e, "❌ 消息持久化失败，仍尝试实时投递");
            }
        }

        let frame = match frame::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!(message_id = %msg.id, error = %e, "消息序列化失败");
                return;
            }
        };

        match msg.target() {
            Ok(Target::Direct(receiver)) => self.deliver_direct(&msg, receiver, &frame).await,
            Ok(Target::Group(group)) => self.deliver_group(&msg, group, &frame).await,
            Err(e) => warn!(message_id = %msg.id, error = %e, "消息路由目标非法，丢弃"),
        }

        self.metrics
            .record_broadcast_latency(started.elapsed().as_secs_f64());
    }

    async fn deliver_direct(&mut self, msg: &ChatMessage, receiver: &str, frame: &Frame) {
        let recipients = self.registry.sessions_for_user(receiver);
        let delivered = self.fan_out(recipients, frame, "direct");

        // 发送者的其他设备同步一份
        if msg.sender_id != receiver {
            let echoes = self.registry.sessions_for_user(&msg.sender_id);
            self.fan_out(echoes, frame, "direct");
        }

        if delivered.is_empty() {
            debug!(message_id = %msg.id, receiver = %receiver, "接收者不在线，保留待投递");
            self.metrics.record_pending_direct(1);
            return;
        }

        if let Err(e) = self
            .store
            .ack_delivered(PendingScope::User(receiver), &msg.id)
            .await
        {
            warn!(message_id = %msg.id, error = %e, "待投递确认失败，下次上线会重复补发");
        }
    }

    async fn deliver_group(&mut self, msg: &ChatMessage, group: &str, frame: &Frame) {
        let online = self.registry.sessions_for_group(group);
        let delivered = self.fan_out(online, frame, "group");

        let members = match self.group_members(group).await {
            Ok(members) => members,
            Err(e) => {
                // 成员未知时保留群组待投递集合，由订阅者上线时补发；
                // 已实时收到的用户与发送者记为已投递，上线时不再重复补发
                warn!(message_id = %msg.id, group_id = %group, error = %e, "群成员查询失败");
                self.metrics.record_pending_group();
                let received = delivered
                    .iter()
                    .map(String::as_str)
                    .chain(std::iter::once(msg.sender_id.as_str()));
                for user_id in received.collect::<HashSet<_>>() {
                    if let Err(e) = self.store.mark_delivered(user_id, &msg.id).await {
                        warn!(message_id = %msg.id, user_id = %user_id, error = %e, "已投递标记失败");
                    }
                }
                return;
            }
        };

        let mut queued = 0u64;
        for member in members.iter() {
            if member == &msg.sender_id || delivered.contains(member.as_str()) {
                continue;
            }
            match self.store.add_pending_for_user(member, &msg.id).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(message_id = %msg.id, user_id = %member, error = %e, "离线成员待投递登记失败");
                }
            }
        }
        if queued > 0 {
            self.metrics.record_pending_direct(queued);
        }

        if let Err(e) = self
            .store
            .ack_delivered(PendingScope::Group(group), &msg.id)
            .await
        {
            warn!(message_id = %msg.id, group_id = %group, error = %e, "群组待投递确认失败");
        }
        debug!(
            message_id = %msg.id,
            group_id = %group,
            delivered = delivered.len(),
            queued,
            "群消息已扇出"
        );
    }

    /// 输入状态：群组订阅者与会话对端，排除发送者本人的所有会话
    fn on_typing(&mut self, typing: TypingEvent) {
        let frame = match frame::encode(&typing) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "输入状态序列化失败");
                return;
            }
        };

        let mut seen = HashSet::new();
        let recipients: Vec<Arc<Session>> = self
            .registry
            .sessions_for_group(&typing.conversation_id)
            .into_iter()
            .chain(self.registry.sessions_for_user(&typing.conversation_id))
            .filter(|s| s.user_id() != typing.user_id)
            .filter(|s| seen.insert(s.id()))
            .collect();

        self.fan_out(recipients, &frame, "typing");
    }

    fn on_domain_event(&mut self, event: DomainEvent) {
        let route = match event.route() {
            Ok(route) => route,
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "领域事件载荷解码失败，丢弃");
                return;
            }
        };

        if route == EventRoute::Unknown {
            warn!(event_type = %event.event_type, "未知领域事件类型，丢弃");
            return;
        }

        let frame = match frame::encode_envelope(&event.event_type, &event.data) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "领域事件序列化失败");
                return;
            }
        };

        match route {
            EventRoute::BroadcastAll => {
                let everyone: Vec<Arc<Session>> = self.registry.all_sessions().cloned().collect();
                let delivered = self.fan_out(everyone, &frame, "event");
                debug!(event_type = %event.event_type, users = delivered.len(), "领域事件已广播");
            }
            EventRoute::PostAuthor { post_id } => {
                self.route_to_owner(event.event_type, frame, OwnerLookup::Post(post_id));
            }
            EventRoute::CommentAuthor { comment_id } => {
                self.route_to_owner(event.event_type, frame, OwnerLookup::Comment(comment_id));
            }
            EventRoute::Unknown => {}
        }
    }

    /// 归属者查询放到独立任务，结果经回投通道重新进入引擎
    fn route_to_owner(&self, event_type: String, frame: Frame, lookup: OwnerLookup) {
        let Some(loopback) = self.loopback.upgrade() else {
            return;
        };
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let owner: Result<String> = match &lookup {
                OwnerLookup::Post(id) => directory.post_author(id).await,
                OwnerLookup::Comment(id) => directory.comment_author(id).await,
            };
            match owner {
                Ok(user_id) => {
                    let _ = loopback
                        .send(HubEvent::RouteToUser {
                            user_id,
                            frame,
                            kind: "event",
                        })
                        .await;
                }
                Err(e) => {
                    warn!(event_type = %event_type, lookup = ?lookup, error = %e, "归属者查询失败，丢弃事件");
                }
            }
        });
    }

    /// 通知只推给在线会话，不做持久化
    fn on_notification(&mut self, notification: Notification) {
        let sessions = self.registry.sessions_for_user(&notification.recipient_id);
        if sessions.is_empty() {
            debug!(
                user_id = %notification.recipient_id,
                notification_id = %notification.id,
                "接收者不在线，丢弃实时通知"
            );
            return;
        }

        match frame::encode_envelope(NOTIFICATION_CREATED, &notification) {
            Ok(frame) => {
                self.fan_out(sessions, &frame, "notification");
            }
            Err(e) => error!(notification_id = %notification.id, error = %e, "通知序列化失败"),
        }
    }

    fn on_sweep(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale = self.registry.stale_sessions(cutoff);
        for session in &stale {
            debug!(
                user_id = %session.user_id(),
                session_id = %session.id(),
                last_seen = %session.last_seen(),
                "移除过期会话"
            );
            self.registry.remove(session);
        }
        if !stale.is_empty() {
            self.metrics.record_sessions_reaped(stale.len() as u64);
        }

        let stats = self.registry.stats();
        info!(
            reaped = stale.len(),
            connections = stats.connections,
            users = stats.users,
            groups = stats.groups,
            "🧹 过期会话扫描完成"
        );
        stale.len()
    }

    /// 非阻塞写入每个会话的缓冲；缓冲满的会话被移除（丢会话，不丢消息）。
    /// 返回至少成功写入一个会话的用户集合。
    fn fan_out(
        &mut self,
        sessions: Vec<Arc<Session>>,
        frame: &Frame,
        kind: &'static str,
    ) -> HashSet<String> {
        let mut delivered = HashSet::new();
        for session in sessions {
            match session.try_send(frame.clone()) {
                SendOutcome::Sent => {
                    self.metrics.record_message_sent(kind);
                    delivered.insert(session.user_id().to_string());
                }
                SendOutcome::Full => {
                    warn!(
                        user_id = %session.user_id(),
                        session_id = %session.id(),
                        "⚠️ 会话出站缓冲已满，移除会话"
                    );
                    self.metrics.record_session_shed();
                    self.registry.remove(&session);
                }
                SendOutcome::Closed => {
                    self.registry.remove(&session);
                }
            }
        }
        delivered
    }

    /// 群成员：本地缓存 → 存储中的成员集合 → 目录服务（回填两级缓存）
    async fn group_members(&self, group_id: &str) -> Result<Arc<Vec<String>>> {
        if let Some(cache) = &self.members_cache {
            if let Some(members) = cache.get(group_id).await {
                return Ok(members);
            }
        }

        let cached = match self.store.group_members(group_id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "读取群成员缓存失败，回源目录服务");
                None
            }
        };

        let members = match cached {
            Some(members) => members,
            None => {
                let members = self.directory.group_members(group_id).await?;
                if let Err(e) = self.store.cache_group_members(group_id, &members).await {
                    warn!(group_id = %group_id, error = %e, "写入群成员缓存失败");
                }
                members
            }
        };

        let members = Arc::new(members);
        if let Some(cache) = &self.members_cache {
            cache.insert(group_id.to_string(), members.clone()).await;
        }
        Ok(members)
    }
}

#[derive(Debug)]
enum OwnerLookup {
    Post(String),
    Comment(String),
}
