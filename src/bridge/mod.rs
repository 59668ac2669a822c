//! 跨进程桥接：Redis pub/sub 转发与 Kafka 事件日志消费

pub mod kafka;
pub mod pubsub;

pub use kafka::{hand_off, spawn_consumers, FeedKind, Handoff};
pub use pubsub::{decode_relay, spawn_relay_subscriber, RedisRelay, RelayPublisher};
