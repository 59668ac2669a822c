//! 跨实例转发：Redis pub/sub 频道
//!
//! 任何实例（包括自己）发布到频道的聊天消息都会被解码后注入本地引擎的广播输入，
//! 连接在其他实例上的订阅者因此也能收到。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{HubError, Result};
use crate::hub::HubHandle;
use crate::infra::{HubMetrics, RedisClient};
use crate::model::ChatMessage;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 重连退避：每次失败翻倍，订阅成功后回到初始值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff(Duration);

impl Backoff {
    fn new() -> Self {
        Self(INITIAL_BACKOFF)
    }

    fn delay(&self) -> Duration {
        self.0
    }

    fn fail(&mut self) {
        self.0 = (self.0 * 2).min(MAX_BACKOFF);
    }

    fn reset(&mut self) {
        self.0 = INITIAL_BACKOFF;
    }
}

/// 向跨实例频道发布消息
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn publish(&self, msg: &ChatMessage) -> Result<()>;
}

/// Redis PUBLISH 实现
pub struct RedisRelay {
    client: RedisClient,
    channel: String,
}

impl RedisRelay {
    pub fn new(client: RedisClient, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl RelayPublisher for RedisRelay {
    async fn publish(&self, msg: &ChatMessage) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        self.client.publish(&self.channel, &payload).await
    }
}

/// 解码频道载荷并校验路由目标
pub fn decode_relay(payload: &str) -> Result<ChatMessage> {
    let mut msg: ChatMessage = serde_json::from_str(payload)?;
    msg.prepare()?;
    Ok(msg)
}

/// 订阅频道并把消息注入引擎；断线后指数退避重连
pub fn spawn_relay_subscriber(
    redis_url: String,
    channel: String,
    hub: HubHandle,
    metrics: HubMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        loop {
            match subscribe_once(&redis_url, &channel, &hub, &metrics, &mut shutdown, &mut backoff)
                .await
            {
                Ok(()) => break,
                Err(HubError::Closed(_)) => {
                    info!("调度引擎已关闭，停止频道订阅");
                    break;
                }
                Err(e) => {
                    error!(
                        "❌ 频道订阅中断: channel={}, error={}，{}s 后重连",
                        channel,
                        e,
                        backoff.delay().as_secs()
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.delay()) => {}
                _ = shutdown.changed() => break,
            }
            backoff.fail();
        }
        info!("频道订阅任务已停止: {}", channel);
    })
}

/// 订阅直到关闭信号（Ok）或连接出错（Err）
async fn subscribe_once(
    redis_url: &str,
    channel: &str,
    hub: &HubHandle,
    metrics: &HubMetrics,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    backoff.reset();
    info!("📡 已订阅跨实例频道: {}", channel);

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            next = messages.next() => {
                let Some(message) = next else {
                    return Err(HubError::Redis("pub/sub stream ended".to_string()));
                };
                metrics.record_bridge_record(channel);
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        metrics.record_bridge_decode_failure(channel);
                        warn!("频道消息载荷不是字符串: {}", e);
                        continue;
                    }
                };
                match decode_relay(&payload) {
                    Ok(msg) => {
                        debug!(message_id = %msg.id, "收到跨实例消息");
                        hub.broadcast(msg).await?;
                    }
                    Err(e) => {
                        metrics.record_bridge_decode_failure(channel);
                        warn!("⚠️ 跨实例消息解码失败，丢弃: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_resets_after_subscribe() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.fail();
        }
        assert_eq!(backoff.delay(), MAX_BACKOFF);

        backoff.reset();
        assert_eq!(backoff.delay(), INITIAL_BACKOFF);
        backoff.fail();
        assert_eq!(backoff.delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_decode_relay_payload() {
        let msg = decode_relay(r#"{"id":"m1","sender_id":"a","group_id":"g1","content":"hi","created_at":"2024-01-01T00:00:00Z"}"#)
            .unwrap();
        assert_eq!(msg.group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn test_decode_relay_rejects_both_targets() {
        let err = decode_relay(
            r#"{"id":"m1","sender_id":"a","receiver_id":"b","group_id":"g1","content":"hi"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, HubError::InvalidMessage(_)));
    }

    #[test]
    fn test_decode_relay_rejects_garbage() {
        assert!(matches!(
            decode_relay("not json"),
            Err(HubError::Serialization(_))
        ));
    }
}
