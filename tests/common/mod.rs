#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use messaging_hub::error::{HubError, Result};
use messaging_hub::infra::{Directory, HubMetrics, MemoryPendingStore, PendingStore};
use messaging_hub::model::Frame;
use messaging_hub::{Hub, HubHandle, HubOptions, Session};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

/// 测试用目录服务
#[derive(Default)]
pub struct StubDirectory {
    pub members: Mutex<HashMap<String, Vec<String>>>,
    pub post_authors: Mutex<HashMap<String, String>>,
    pub comment_authors: Mutex<HashMap<String, String>>,
}

impl StubDirectory {
    pub fn with_group(self, group_id: &str, members: &[&str]) -> Self {
        self.members.lock().insert(
            group_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn with_post(self, post_id: &str, author: &str) -> Self {
        self.post_authors
            .lock()
            .insert(post_id.to_string(), author.to_string());
        self
    }
}

#[async_trait]
impl Directory for StubDirectory {
    async fn user_groups(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .members
            .lock()
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == user_id))
            .map(|(group, _)| group.clone())
            .collect())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.members
            .lock()
            .get(group_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("group {}", group_id)))
    }

    async fn post_author(&self, post_id: &str) -> Result<String> {
        self.post_authors
            .lock()
            .get(post_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("post {}", post_id)))
    }

    async fn comment_author(&self, comment_id: &str) -> Result<String> {
        self.comment_authors
            .lock()
            .get(comment_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("comment {}", comment_id)))
    }
}

/// 运行中的引擎；丢弃时发送关闭信号
pub struct TestHub {
    pub handle: HubHandle,
    pub store: Arc<MemoryPendingStore>,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn start_hub(directory: StubDirectory) -> TestHub {
    let store = Arc::new(MemoryPendingStore::default());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let options = HubOptions {
        replay_send_timeout: Duration::from_millis(100),
        ..HubOptions::default()
    };
    let (handle, _task) = Hub::spawn(
        options,
        store.clone(),
        Arc::new(directory),
        HubMetrics::noop(),
        shutdown_rx,
    );
    TestHub {
        handle,
        store,
        shutdown,
    }
}

/// 等待下一帧并解析为 JSON
pub async fn next_json(rx: &mut mpsc::Receiver<Frame>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("session buffer closed");
    serde_json::from_str(&frame).expect("frame is not json")
}

/// 短时间内没有新帧
pub async fn assert_silent(rx: &mut mpsc::Receiver<Frame>) {
    let waited = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(waited.is_err(), "unexpected frame: {:?}", waited);
}

/// 等待用户的待投递集合被清空（补发在独立任务中确认）
pub async fn wait_until_no_pending(store: &MemoryPendingStore, user_id: &str) {
    for _ in 0..100 {
        if store.pending_for_user(user_id).await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pending set of {} was never drained", user_id);
}

/// 等待补发任务把群组消息记入用户的已投递集合
pub async fn wait_until_delivered(store: &MemoryPendingStore, user_id: &str, message_id: &str) {
    for _ in 0..100 {
        let seen = store.delivered_for_user(user_id).await.unwrap();
        if seen.iter().any(|id| id == message_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("message {} was never marked delivered for {}", message_id, user_id);
}

/// 等待会话出站缓冲被引擎关闭
pub async fn wait_until_closed(session: &Session) {
    for _ in 0..100 {
        if session.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {} was never closed", session.id());
}
