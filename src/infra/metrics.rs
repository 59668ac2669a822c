//! Prometheus 指标：连接数、消息投递量、待投递积压、扇出延迟、会话淘汰、桥接记录
//!
//! 指标上下文显式构造并传给各组件，不安装全局 Recorder，
//! 因此同一进程（例如测试）里可以并存多个 Hub。

use std::sync::Arc;

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, Label, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// 指标名称
const GAUGE_CONNECTIONS: &str = "hub_connections_current";
const COUNTER_MESSAGES_SENT: &str = "hub_messages_sent_total";
const COUNTER_PENDING_DIRECT: &str = "hub_pending_direct_messages";
const COUNTER_PENDING_GROUP: &str = "hub_pending_group_messages";
const HISTOGRAM_BROADCAST_LATENCY: &str = "hub_broadcast_latency_seconds";
const COUNTER_SESSIONS_SHED: &str = "hub_sessions_shed_total";
const COUNTER_SESSIONS_REAPED: &str = "hub_sessions_reaped_total";
const COUNTER_BRIDGE_RECORDS: &str = "hub_bridge_records_total";
const COUNTER_BRIDGE_DECODE_FAILURES: &str = "hub_bridge_decode_failures_total";

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()));

/// Hub 指标上下文
#[derive(Clone)]
pub struct HubMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    recorder: Option<PrometheusRecorder>,
    handle: Option<PrometheusHandle>,
    connections: Gauge,
    pending_direct: Counter,
    pending_group: Counter,
    broadcast_latency: Histogram,
    sessions_shed: Counter,
    sessions_reaped: Counter,
    /// 带标签的计数器按需创建： (指标名, 标签值) -> Counter
    labeled: DashMap<(&'static str, String), Counter>,
}

impl HubMetrics {
    /// 使用私有 Prometheus Recorder 创建指标上下文
    pub fn prometheus() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let inner = Inner {
            connections: recorder.register_gauge(&Key::from_static_name(GAUGE_CONNECTIONS), &METADATA),
            pending_direct: recorder
                .register_counter(&Key::from_static_name(COUNTER_PENDING_DIRECT), &METADATA),
            pending_group: recorder
                .register_counter(&Key::from_static_name(COUNTER_PENDING_GROUP), &METADATA),
            broadcast_latency: recorder
                .register_histogram(&Key::from_static_name(HISTOGRAM_BROADCAST_LATENCY), &METADATA),
            sessions_shed: recorder
                .register_counter(&Key::from_static_name(COUNTER_SESSIONS_SHED), &METADATA),
            sessions_reaped: recorder
                .register_counter(&Key::from_static_name(COUNTER_SESSIONS_REAPED), &METADATA),
            labeled: DashMap::new(),
            handle: Some(handle),
            recorder: Some(recorder),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 不记录任何数据（测试用）
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Inner {
                recorder: None,
                handle: None,
                connections: Gauge::noop(),
                pending_direct: Counter::noop(),
                pending_group: Counter::noop(),
                broadcast_latency: Histogram::noop(),
                sessions_shed: Counter::noop(),
                sessions_reaped: Counter::noop(),
                labeled: DashMap::new(),
            }),
        }
    }

    /// 渲染为 Prometheus 文本格式，供 GET /metrics 使用；noop 上下文返回 None
    pub fn render(&self) -> Option<String> {
        self.inner.handle.as_ref().map(|h| h.render())
    }

    /// 当前连接数 Gauge，交给注册表维护
    pub fn connections_gauge(&self) -> Gauge {
        self.inner.connections.clone()
    }

    /// 记录一次投递，按类型（direct / group / typing / event / notification）分标签
    pub fn record_message_sent(&self, kind: &'static str) {
        self.labeled_counter(COUNTER_MESSAGES_SENT, "type", kind).increment(1);
    }

    pub fn record_pending_direct(&self, count: u64) {
        self.inner.pending_direct.increment(count);
    }

    pub fn record_pending_group(&self) {
        self.inner.pending_group.increment(1);
    }

    pub fn record_broadcast_latency(&self, secs: f64) {
        self.inner.broadcast_latency.record(secs);
    }

    pub fn record_session_shed(&self) {
        self.inner.sessions_shed.increment(1);
    }

    pub fn record_sessions_reaped(&self, count: u64) {
        self.inner.sessions_reaped.increment(count);
    }

    pub fn record_bridge_record(&self, topic: &str) {
        self.labeled_counter(COUNTER_BRIDGE_RECORDS, "topic", topic).increment(1);
    }

    pub fn record_bridge_decode_failure(&self, topic: &str) {
        self.labeled_counter(COUNTER_BRIDGE_DECODE_FAILURES, "topic", topic)
            .increment(1);
    }

    fn labeled_counter(&self, name: &'static str, label: &'static str, value: &str) -> Counter {
        let Some(recorder) = self.inner.recorder.as_ref() else {
            return Counter::noop();
        };
        self.inner
            .labeled
            .entry((name, value.to_string()))
            .or_insert_with(|| {
                let key = Key::from_parts(name, vec![Label::new(label, value.to_string())]);
                recorder.register_counter(&key, &METADATA)
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_metrics() {
        let metrics = HubMetrics::prometheus();
        metrics.connections_gauge().set(3.0);
        metrics.record_message_sent("direct");
        metrics.record_message_sent("direct");
        metrics.record_bridge_decode_failure("messages");

        let text = metrics.render().unwrap();
        assert!(text.contains("hub_connections_current 3"));
        assert!(text.contains(r#"hub_messages_sent_total{type="direct"} 2"#));
        assert!(text.contains(r#"hub_bridge_decode_failures_total{topic="messages"} 1"#));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let a = HubMetrics::prometheus();
        let b = HubMetrics::prometheus();
        a.record_session_shed();
        let text = b.render().unwrap();
        assert!(!text.contains("hub_sessions_shed_total 1"));
    }

    #[test]
    fn test_noop_renders_nothing() {
        let metrics = HubMetrics::noop();
        metrics.record_message_sent("group");
        assert!(metrics.render().is_none());
    }
}
