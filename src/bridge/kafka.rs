//! 持久事件日志桥接：Kafka 消费者组
//!
//! 偏移量只在记录成功交给引擎之后提交（至少一次）。单条记录解码失败时记录日志并照常提交，
//! 跳过毒消息而不是重试，避免阻塞后续记录。

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{HubError, Result};
use crate::hub::HubHandle;
use crate::infra::HubMetrics;
use crate::model::{DomainEvent, Notification};

/// topic 承载的记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// `{"type": ..., "data": ...}` 领域事件
    DomainEvents,
    /// 通知记录
    Notifications,
}

/// 单条记录的交接结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// 已交给引擎，提交偏移量
    Delivered,
    /// 解码失败，提交偏移量跳过
    Skipped,
    /// 引擎输入队列满，实时副本丢弃（通知已由生产方持久化），提交偏移量
    Dropped,
    /// 引擎已关闭，不提交，停止消费
    Stop,
}

impl Handoff {
    pub fn should_commit(self) -> bool {
        !matches!(self, Handoff::Stop)
    }
}

/// 解码一条记录并交给引擎
pub async fn hand_off(
    kind: FeedKind,
    topic: &str,
    payload: Option<&[u8]>,
    hub: &HubHandle,
    metrics: &HubMetrics,
) -> Handoff {
    metrics.record_bridge_record(topic);
    let Some(payload) = payload else {
        metrics.record_bridge_decode_failure(topic);
        warn!(topic = %topic, "空记录，跳过");
        return Handoff::Skipped;
    };

    match kind {
        FeedKind::DomainEvents => match serde_json::from_slice::<DomainEvent>(payload) {
            Ok(event) => {
                debug!(topic = %topic, event_type = %event.event_type, "收到领域事件");
                match hub.domain_event(event).await {
                    Ok(()) => Handoff::Delivered,
                    Err(_) => Handoff::Stop,
                }
            }
            Err(e) => {
                metrics.record_bridge_decode_failure(topic);
                warn!(topic = %topic, error = %e, "⚠️ 领域事件解码失败，跳过");
                Handoff::Skipped
            }
        },
        FeedKind::Notifications => match serde_json::from_slice::<Notification>(payload) {
            Ok(notification) => {
                let id = notification.id.clone();
                match hub.try_notification(notification) {
                    Ok(()) => Handoff::Delivered,
                    Err(HubError::Closed(_)) => Handoff::Stop,
                    Err(e) => {
                        warn!(topic = %topic, notification_id = %id, error = %e, "引擎繁忙，丢弃实时通知");
                        Handoff::Dropped
                    }
                }
            }
            Err(e) => {
                metrics.record_bridge_decode_failure(topic);
                warn!(topic = %topic, error = %e, "⚠️ 通知解码失败，跳过");
                Handoff::Skipped
            }
        },
    }
}

/// 按配置启动领域事件与通知两个消费者
pub fn spawn_consumers(
    config: &KafkaConfig,
    hub: &HubHandle,
    metrics: &HubMetrics,
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    let brokers = config.brokers.join(",");
    let feeds = [
        (FeedKind::DomainEvents, &config.feed_topic, &config.feed_group),
        (
            FeedKind::Notifications,
            &config.notification_topic,
            &config.notification_group,
        ),
    ];

    let mut tasks = Vec::with_capacity(feeds.len());
    for (kind, topic, group) in feeds {
        let consumer = create_consumer(&brokers, group)?;
        consumer.subscribe(&[topic.as_str()])?;
        info!("📥 已订阅 Kafka topic: {} (group={})", topic, group);
        tasks.push(tokio::spawn(consume(
            consumer,
            kind,
            topic.clone(),
            hub.clone(),
            metrics.clone(),
            shutdown.clone(),
        )));
    }
    Ok(tasks)
}

fn create_consumer(brokers: &str, group: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "10000")
        .create()?;
    Ok(consumer)
}

async fn consume(
    consumer: StreamConsumer,
    kind: FeedKind,
    topic: String,
    hub: HubHandle,
    metrics: HubMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = consumer.recv() => match received {
                Ok(record) => {
                    let outcome = hand_off(kind, &topic, record.payload(), &hub, &metrics).await;
                    if !outcome.should_commit() {
                        info!(topic = %topic, "调度引擎已关闭，停止消费");
                        break;
                    }
                    if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                        warn!(topic = %topic, offset = record.offset(), error = %e, "偏移量提交失败");
                    }
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "❌ Kafka 消费失败");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Kafka 消费者已停止: {}", topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubEvent;

    const NOTIFICATION: &[u8] = br#"{"id":"n1","recipient_id":"bob","type":"like"}"#;

    #[tokio::test]
    async fn test_domain_event_is_handed_to_hub() {
        let (hub, mut inbox) = HubHandle::detached(4);
        let payload = br#"{"type":"PostCreated","data":{"id":"p1"}}"#;

        let outcome = hand_off(
            FeedKind::DomainEvents,
            "messages",
            Some(payload),
            &hub,
            &HubMetrics::noop(),
        )
        .await;

        assert_eq!(outcome, Handoff::Delivered);
        match inbox.recv().await {
            Some(HubEvent::Feed(event)) => assert_eq!(event.event_type, "PostCreated"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped_and_committed() {
        let (hub, mut inbox) = HubHandle::detached(4);
        let metrics = HubMetrics::noop();

        let garbage = hand_off(FeedKind::DomainEvents, "messages", Some(b"{oops"), &hub, &metrics).await;
        let empty = hand_off(FeedKind::Notifications, "notifications_events", None, &hub, &metrics).await;

        assert_eq!(garbage, Handoff::Skipped);
        assert_eq!(empty, Handoff::Skipped);
        assert!(garbage.should_commit());
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notification_dropped_when_inbox_full() {
        let (hub, _inbox) = HubHandle::detached(1);
        let metrics = HubMetrics::noop();

        let first = hand_off(FeedKind::Notifications, "notifications_events", Some(NOTIFICATION), &hub, &metrics).await;
        let second = hand_off(FeedKind::Notifications, "notifications_events", Some(NOTIFICATION), &hub, &metrics).await;

        assert_eq!(first, Handoff::Delivered);
        assert_eq!(second, Handoff::Dropped);
        assert!(second.should_commit());
    }

    #[tokio::test]
    async fn test_closed_hub_stops_without_commit() {
        let (hub, inbox) = HubHandle::detached(1);
        drop(inbox);

        let outcome = hand_off(
            FeedKind::Notifications,
            "notifications_events",
            Some(NOTIFICATION),
            &hub,
            &HubMetrics::noop(),
        )
        .await;

        assert_eq!(outcome, Handoff::Stop);
        assert!(!outcome.should_commit());
    }
}
