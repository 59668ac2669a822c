use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use uuid::Uuid;

use crate::model::Frame;

pub type SessionId = Uuid;

/// 非阻塞投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// 出站缓冲已满，调用方应把会话视为已死
    Full,
    /// 会话已关闭
    Closed,
}

/// 一条在线连接
///
/// 出站缓冲由调度引擎写入、由写任务消费；`close` 丢弃发送端，
/// 写任务随之读到 `None` 并退出。
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user_id: String,
    /// 连接时从群组成员关系计算，生命周期内不变
    subscriptions: HashSet<String>,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl Session {
    /// 创建会话，返回会话与出站缓冲的接收端
    pub fn new<I, S>(
        user_id: &str,
        subscriptions: I,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let now = Utc::now();
        let session = Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            subscriptions: subscriptions.into_iter().map(Into::into).collect(),
            connected_at: now,
            last_seen: Mutex::new(now),
            outbound: Mutex::new(Some(tx)),
        };
        (Arc::new(session), rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscriptions(&self) -> &HashSet<String> {
        &self.subscriptions
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// 刷新活跃时间（pong、入站帧、成功投递）
    pub fn touch(&self) {
        self.set_last_seen(Utc::now());
    }

    pub fn set_last_seen(&self, at: DateTime<Utc>) {
        *self.last_seen.lock() = at;
    }

    /// 活跃时间早于 `cutoff` 即视为过期
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen() < cutoff
    }

    /// 非阻塞写入出站缓冲
    pub fn try_send(&self, frame: Frame) -> SendOutcome {
        let outcome = {
            let guard = self.outbound.lock();
            match guard.as_ref() {
                None => SendOutcome::Closed,
                Some(tx) => match tx.try_send(frame) {
                    Ok(()) => SendOutcome::Sent,
                    Err(TrySendError::Full(_)) => SendOutcome::Full,
                    Err(TrySendError::Closed(_)) => SendOutcome::Closed,
                },
            }
        };
        if outcome == SendOutcome::Sent {
            self.touch();
        }
        outcome
    }

    /// 在 `wait` 内等待缓冲空位后写入；仅用于离线补发任务，调度引擎只用 `try_send`
    pub async fn send_within(&self, frame: Frame, wait: Duration) -> SendOutcome {
        let tx = match self.outbound.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return SendOutcome::Closed,
        };
        match tx.send_timeout(frame, wait).await {
            Ok(()) => {
                self.touch();
                SendOutcome::Sent
            }
            Err(SendTimeoutError::Timeout(_)) => SendOutcome::Full,
            Err(SendTimeoutError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// 关闭出站缓冲；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }
}
