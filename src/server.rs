use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::bridge::{self, RedisRelay, RelayPublisher};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::http::{HttpServer, HttpServerState};
use crate::hub::{spawn_reaper, Hub, HubOptions};
use crate::infra::{
    Directory, HttpDirectory, HubMetrics, MemoryPendingStore, NoDirectory, PendingStore,
    RedisClient, RedisPendingStore,
};
use crate::ws::ConnectionSettings;

/// 消息扇出服务：组装待投递存储、目录服务、调度引擎、桥接与 HTTP 接入
pub struct HubServer {
    config: HubConfig,
    store: Arc<dyn PendingStore>,
    directory: Arc<dyn Directory>,
    metrics: HubMetrics,
    redis: Option<RedisClient>,
    /// 单实例模式下的进程内存储，需要定期清理过期消息体
    memory_store: Option<Arc<MemoryPendingStore>>,
}

impl HubServer {
    pub async fn new(config: HubConfig) -> Result<Self> {
        let metrics = HubMetrics::prometheus();
        let pending_ttl = config.hub.pending_ttl();

        let mut redis = None;
        let mut memory_store = None;
        let store: Arc<dyn PendingStore> = match &config.redis {
            Some(redis_config) => {
                let client = RedisClient::new(redis_config).await?;
                redis = Some(client.clone());
                Arc::new(RedisPendingStore::new(
                    client,
                    pending_ttl,
                    Duration::from_secs(config.hub.group_members_ttl_secs),
                ))
            }
            None => {
                warn!("⚠️ 未配置 Redis，使用进程内待投递存储（单实例模式，无跨实例转发）");
                let store = Arc::new(MemoryPendingStore::new(pending_ttl));
                memory_store = Some(store.clone());
                store
            }
        };

        let directory: Arc<dyn Directory> = match &config.directory.base_url {
            Some(base_url) => {
                info!("📇 目录服务: {}", base_url);
                Arc::new(HttpDirectory::new(&config.directory, base_url)?)
            }
            None => {
                warn!("⚠️ 未配置目录服务，会话将不订阅任何群组");
                Arc::new(NoDirectory)
            }
        };

        Ok(Self {
            config,
            store,
            directory,
            metrics,
            redis,
            memory_store,
        })
    }

    /// 运行直到 `shutdown` 置为 true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.config;
        self.show_config_info();

        let (hub, engine) = Hub::spawn(
            HubOptions::from_config(&config.hub, config.server.write_timeout()),
            self.store.clone(),
            self.directory.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        );

        let mut tasks: Vec<JoinHandle<()>> = vec![spawn_reaper(
            hub.clone(),
            config.hub.reaper_interval(),
            config.hub.stale_after(),
            shutdown.clone(),
        )];

        if let Some(store) = &self.memory_store {
            tasks.push(spawn_purger(
                store.clone(),
                config.hub.reaper_interval(),
                shutdown.clone(),
            ));
        }

        let relay: Option<Arc<dyn RelayPublisher>> = match &self.redis {
            Some(client) => {
                tasks.push(bridge::spawn_relay_subscriber(
                    client.url().to_string(),
                    config.hub.relay_channel.clone(),
                    hub.clone(),
                    self.metrics.clone(),
                    shutdown.clone(),
                ));
                Some(Arc::new(RedisRelay::new(
                    client.clone(),
                    config.hub.relay_channel.clone(),
                )))
            }
            None => None,
        };

        if config.kafka.enabled {
            tasks.extend(bridge::spawn_consumers(
                &config.kafka,
                &hub,
                &self.metrics,
                &shutdown,
            )?);
        }

        let state = HttpServerState {
            hub: hub.clone(),
            store: self.store.clone(),
            directory: self.directory.clone(),
            metrics: self.metrics.clone(),
            relay,
            connection: Arc::new(ConnectionSettings::from_config(&config.server, &config.hub)),
            identity_header: config.server.identity_header.clone(),
        };

        let bind_address = config.server.bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| HubError::Configuration(format!("无法监听 {}: {}", bind_address, e)))?;

        HttpServer::new(state, config.server.ws_path.clone())
            .serve(listener, wait_for_shutdown(shutdown.clone()))
            .await
            .map_err(|e| HubError::Internal(format!("HTTP 服务异常退出: {}", e)))?;

        info!("🛑 HTTP 服务已停止，等待后台任务退出...");
        drop(hub);
        for task in tasks {
            let _ = task.await;
        }
        let _ = engine.await;
        info!("✅ Messaging Hub 已停止");
        Ok(())
    }

    fn show_config_info(&self) {
        let config = &self.config;
        info!("📊 Hub Configuration:");
        info!("  - Listen: {}{}", config.server.bind_address(), config.server.ws_path);
        info!("  - Identity Header: {}", config.server.identity_header);
        info!("  - Session Buffer: {}", config.server.session_buffer);
        info!("  - Pending TTL: {}s", config.hub.pending_ttl_secs);
        info!(
            "  - Reaper: every {}s, stale after {}s",
            config.hub.reaper_interval_secs, config.hub.stale_after_secs
        );
        info!("  - Redis: {}", self.redis.is_some());
        info!("  - Relay Channel: {}", config.hub.relay_channel);
        info!("  - Kafka: {}", config.kafka.enabled);
    }
}

/// 关闭信号置为 true（或发送端被丢弃）时完成
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_purger(
    store: Arc<MemoryPendingStore>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        let stopped = wait_for_shutdown(shutdown);
        tokio::pin!(stopped);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!("清理过期待投递消息: {}", purged);
                    }
                }
                _ = &mut stopped => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_on_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .unwrap();
    }
}
