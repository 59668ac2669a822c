//! 路由与调度引擎
//!
//! 所有输入（注册、注销、消息广播、输入状态、领域事件、通知、过期扫描）
//! 经同一个有界通道进入单个引擎任务，按到达顺序逐条处理。
//! 注册表只在引擎任务内修改；会话的读写 I/O 在各自的任务中并发进行。

mod dispatcher;
pub mod reaper;
pub mod replay;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::HubSection;
use crate::error::{HubError, Result};
use crate::infra::{Directory, HubMetrics, PendingStore};
use crate::model::{ChatMessage, DomainEvent, Frame, Notification, TypingEvent};
use crate::session::{Registry, RegistryStats, Session};

pub use reaper::spawn_reaper;

/// 引擎输入事件
#[derive(Debug)]
pub enum HubEvent {
    Register(Arc<Session>),
    Unregister(Arc<Session>),
    /// 已校验的私聊或群聊消息
    Broadcast(ChatMessage),
    Typing(TypingEvent),
    /// 事件日志中的领域事件
    Feed(DomainEvent),
    Notification(Notification),
    /// 移除活跃时间早于 `cutoff` 的会话，回复移除数量
    Sweep {
        cutoff: DateTime<Utc>,
        reply: Option<oneshot::Sender<usize>>,
    },
    /// 归属者查询完成后的回投（内部使用）
    RouteToUser {
        user_id: String,
        frame: Frame,
        kind: &'static str,
    },
    Snapshot(oneshot::Sender<HubSnapshot>),
}

/// 引擎状态快照
#[derive(Debug, Clone, Default)]
pub struct HubSnapshot {
    pub stats: RegistryStats,
    /// user_id -> 在线会话数
    pub sessions_by_user: HashMap<String, usize>,
    /// group_id -> 在线会话数
    pub sessions_by_group: HashMap<String, usize>,
}

impl HubSnapshot {
    pub fn user_sessions(&self, user_id: &str) -> usize {
        self.sessions_by_user.get(user_id).copied().unwrap_or(0)
    }

    pub fn group_sessions(&self, group_id: &str) -> usize {
        self.sessions_by_group.get(group_id).copied().unwrap_or(0)
    }
}

/// 引擎参数
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub inbox_capacity: usize,
    /// 引擎本地群成员缓存 TTL；None 关闭本地缓存
    pub members_cache_ttl: Option<Duration>,
    /// 离线补发时等待会话缓冲空位的上限
    pub replay_send_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            inbox_capacity: 10_000,
            members_cache_ttl: Some(Duration::from_secs(30)),
            replay_send_timeout: Duration::from_secs(10),
        }
    }
}

impl HubOptions {
    pub fn from_config(hub: &HubSection, write_timeout: Duration) -> Self {
        Self {
            inbox_capacity: hub.inbox_capacity,
            members_cache_ttl: (hub.local_members_cache_secs > 0)
                .then(|| Duration::from_secs(hub.local_members_cache_secs)),
            replay_send_timeout: write_timeout,
        }
    }
}

/// 引擎输入端句柄，可任意克隆
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    async fn send(&self, event: HubEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| HubError::Closed("hub inbox closed".to_string()))
    }

    pub async fn register(&self, session: Arc<Session>) -> Result<()> {
        self.send(HubEvent::Register(session)).await
    }

    pub async fn unregister(&self, session: Arc<Session>) -> Result<()> {
        self.send(HubEvent::Unregister(session)).await
    }

    /// 校验路由目标后入队；同时设置接收者与群组的消息在持久化之前被拒绝
    pub async fn broadcast(&self, mut msg: ChatMessage) -> Result<()> {
        msg.prepare()?;
        self.send(HubEvent::Broadcast(msg)).await
    }

    pub async fn typing(&self, event: TypingEvent) -> Result<()> {
        self.send(HubEvent::Typing(event)).await
    }

    pub async fn domain_event(&self, event: DomainEvent) -> Result<()> {
        self.send(HubEvent::Feed(event)).await
    }

    pub async fn notification(&self, notification: Notification) -> Result<()> {
        self.send(HubEvent::Notification(notification)).await
    }

    /// 非阻塞投递通知；输入队列满时返回错误，由调用方丢弃实时副本
    pub fn try_notification(&self, notification: Notification) -> Result<()> {
        self.tx
            .try_send(HubEvent::Notification(notification))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    HubError::Internal("hub inbox full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    HubError::Closed("hub inbox closed".to_string())
                }
            })
    }

    /// 执行一次过期扫描，返回被移除的会话数
    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Sweep {
            cutoff,
            reply: Some(reply),
        })
        .await?;
        rx.await
            .map_err(|_| HubError::Closed("hub stopped during sweep".to_string()))
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Snapshot(reply)).await?;
        rx.await
            .map_err(|_| HubError::Closed("hub stopped during snapshot".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 不启动引擎的句柄，测试直接读取输入通道
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// 调度引擎（单任务持有全部路由状态）
pub struct Hub {
    registry: Registry,
    store: Arc<dyn PendingStore>,
    directory: Arc<dyn Directory>,
    metrics: HubMetrics,
    members_cache: Option<Cache<String, Arc<Vec<String>>>>,
    replay_send_timeout: Duration,
    inbox: mpsc::Receiver<HubEvent>,
    /// 回投通道；弱引用，不阻止外部句柄全部释放后通道关闭
    loopback: mpsc::WeakSender<HubEvent>,
}

impl Hub {
    /// 启动引擎任务，返回输入句柄
    pub fn spawn(
        options: HubOptions,
        store: Arc<dyn PendingStore>,
        directory: Arc<dyn Directory>,
        metrics: HubMetrics,
        shutdown: watch::Receiver<bool>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, inbox) = mpsc::channel(options.inbox_capacity.max(1));
        let members_cache = options.members_cache_ttl.map(|ttl| {
            Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build()
        });

        let hub = Hub {
            registry: Registry::new(metrics.connections_gauge()),
            store,
            directory,
            metrics,
            members_cache,
            replay_send_timeout: options.replay_send_timeout,
            inbox,
            loopback: tx.downgrade(),
        };

        let task = tokio::spawn(hub.run(shutdown));
        (HubHandle { tx }, task)
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 调度引擎已启动");
        // 关闭信号的发送端被丢弃时不再监听，引擎随所有输入句柄释放而退出
        let mut watching = true;
        loop {
            tokio::select! {
                changed = shutdown.changed(), if watching => match changed {
                    Ok(()) if *shutdown.borrow() => break,
                    Ok(()) => {}
                    Err(_) => watching = false,
                },
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        let stats = self.registry.stats();
        // 关闭出站缓冲，写任务发送 Close 后退出
        for session in self.registry.all_sessions() {
            session.close();
        }
        info!(
            connections = stats.connections,
            users = stats.users,
            "🛑 调度引擎已停止"
        );
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            stats: self.registry.stats(),
            sessions_by_user: self
                .registry
                .user_counts()
                .map(|(user, n)| (user.to_string(), n))
                .collect(),
            sessions_by_group: self
                .registry
                .group_counts()
                .map(|(group, n)| (group.to_string(), n))
                .collect(),
        }
    }
}
