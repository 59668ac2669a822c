// Infrastructure layer - 基础设施层
// 负责外部协作方的客户端：Redis 连接池、待投递存储、目录服务、指标

pub mod directory;
pub mod memory_store;
pub mod metrics;
pub mod pending_store;
pub mod redis;

// 重新导出主要类型
pub use directory::{Directory, HttpDirectory, NoDirectory};
pub use memory_store::MemoryPendingStore;
pub use metrics::HubMetrics;
pub use pending_store::{keys, PendingScope, PendingStore, RedisPendingStore};
pub use redis::RedisClient;
