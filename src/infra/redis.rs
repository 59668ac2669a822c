// RedisClient - Redis客户端实现
// 基于 bb8-redis 连接池

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{HubError, Result};

/// Redis 客户端（基于连接池）
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
    /// 原始 URL，pub/sub 订阅需要独立连接
    url: String,
}

impl RedisClient {
    /// 创建新的 Redis 客户端（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone())?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await?;

        let client = Self {
            pool: Arc::new(pool),
            command_timeout: config.command_timeout(),
            url: config.url.clone(),
        };

        // 测试连接
        client.ping().await?;

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 从连接池获取连接
    async fn get_conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| HubError::Redis(format!("Failed to get Redis connection: {}", e)))
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                HubError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }

    /// PING
    pub async fn ping(&self) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // String 操作
    // ============================================================

    /// GET key
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Option<String> = conn.get(key).await?;
            Ok(result)
        })
        .await
    }

    /// SET key value NX EX ttl；键已存在时返回 false
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let written: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut *conn)
                .await?;
            Ok(written.is_some())
        })
        .await
    }

    // ============================================================
    // Set 操作
    // ============================================================

    /// SADD key member，并刷新集合 TTL
    pub async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            redis::pipe()
                .atomic()
                .sadd(key, member)
                .ignore()
                .expire(key, ttl.as_secs().max(1) as i64)
                .ignore()
                .query_async::<()>(&mut *conn)
                .await?;
            Ok(())
        })
        .await
    }

    /// 用新成员替换整个集合（DEL + SADD + EXPIRE）
    pub async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic().del(key).ignore();
            if !members.is_empty() {
                pipe.sadd(key, members)
                    .ignore()
                    .expire(key, ttl.as_secs().max(1) as i64)
                    .ignore();
            }
            pipe.query_async::<()>(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    /// SREM key member
    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.srem::<_, _, ()>(key, member).await?;
            Ok(())
        })
        .await
    }

    /// SMEMBERS key
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Vec<String> = conn.smembers(key).await?;
            Ok(result)
        })
        .await
    }

    // ============================================================
    // Pub/Sub 操作
    // ============================================================

    /// PUBLISH channel message
    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.publish::<_, _, ()>(channel, message).await?;
            Ok(())
        })
        .await
    }
}
