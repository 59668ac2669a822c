use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Hub 配置
///
/// 加载优先级：命令行 > 环境变量 > 配置文件 > 默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// HTTP / WebSocket 接入
    pub server: ServerSection,
    /// 调度引擎与待投递参数
    pub hub: HubSection,
    /// Redis 配置（可选；未配置时使用进程内存储，且不做跨进程转发）
    pub redis: Option<RedisConfig>,
    /// Kafka 事件日志配置
    pub kafka: KafkaConfig,
    /// 目录服务配置
    pub directory: DirectoryConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 接入层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// WebSocket 路径
    pub ws_path: String,
    /// 上游认证管道写入的身份头
    pub identity_header: String,
    /// 单帧最大字节数
    pub max_frame_bytes: usize,
    /// 等待 pong（或任意入站帧）的时间（秒）
    pub pong_wait_secs: u64,
    /// 单次写超时（秒）
    pub write_timeout_secs: u64,
    /// 每个会话的出站缓冲容量
    pub session_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            ws_path: "/ws".to_string(),
            identity_header: "x-user-id".to_string(),
            max_frame_bytes: 512,
            pong_wait_secs: 60,
            write_timeout_secs: 10,
            session_buffer: 256,
        }
    }
}

impl ServerSection {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// ping 周期取 pong 等待时间的 9/10，保证超时前至少发出一次 ping
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// 调度引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// 引擎输入队列容量
    pub inbox_capacity: usize,
    /// 待投递消息体 TTL（秒）
    pub pending_ttl_secs: u64,
    /// 过期会话扫描间隔（秒）
    pub reaper_interval_secs: u64,
    /// 会话判定为过期的静默时间（秒）
    pub stale_after_secs: u64,
    /// 跨实例转发的 pub/sub 频道
    pub relay_channel: String,
    /// 客户端消息是否经 pub/sub 转发（由订阅回注本地引擎）
    pub relay_inbound: bool,
    /// 群成员在 Redis 中的缓存 TTL（秒）
    pub group_members_ttl_secs: u64,
    /// 引擎本地群成员缓存 TTL（秒），0 表示关闭
    pub local_members_cache_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            inbox_capacity: 10_000,
            pending_ttl_secs: 24 * 3600,
            reaper_interval_secs: 300,
            stale_after_secs: 600,
            relay_channel: "messages".to_string(),
            relay_inbound: false,
            group_members_ttl_secs: 3600,
            local_members_cache_secs: 30,
        }
    }
}

impl HubSection {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 200,
            min_idle: 20,
            connection_timeout_secs: 5,
            command_timeout_ms: 3000,
            idle_timeout_secs: 300,
        }
    }
}

impl RedisConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// 获取连接超时时间
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Kafka 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub brokers: Vec<String>,
    /// 领域事件 topic（帖子、评论、回复、表态）
    pub feed_topic: String,
    pub feed_group: String,
    /// 通知 topic
    pub notification_topic: String,
    pub notification_group: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: vec!["localhost:9092".to_string()],
            feed_topic: "messages".to_string(),
            feed_group: "message-group".to_string(),
            notification_topic: "notifications_events".to_string(),
            notification_group: "notification-group".to_string(),
        }
    }
}

/// 目录服务（REST API）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub base_url: Option<String>,
    /// 服务间调用令牌（Bearer）
    pub service_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            service_token: None,
            timeout_ms: 3000,
        }
    }
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl HubConfig {
    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        Ok(config)
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// 从环境变量合并（HUB_ 前缀，以及沿用的 REDIS_URL / KAFKA_* 变量）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("HUB_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("HUB_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("HUB_PORT 不是合法端口: {}", port))?;
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            self.set_redis_url(redis_url);
        }
        if let Ok(brokers) = env::var("KAFKA_BROKERS") {
            self.kafka.brokers = split_list(&brokers);
            self.kafka.enabled = true;
        }
        if let Ok(topic) = env::var("KAFKA_TOPIC") {
            self.kafka.feed_topic = topic;
        }
        if let Ok(url) = env::var("HUB_DIRECTORY_URL") {
            self.directory.base_url = Some(url);
        }
        if let Ok(token) = env::var("HUB_DIRECTORY_TOKEN") {
            self.directory.service_token = Some(token);
        }
        if let Ok(relay) = env::var("HUB_RELAY_INBOUND") {
            self.hub.relay_inbound = matches!(relay.as_str(), "1" | "true" | "yes");
        }
        if let Ok(level) = env::var("HUB_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        if let Ok(format) = env::var("HUB_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(redis_url) = &cli.redis_url {
            self.set_redis_url(redis_url.clone());
        }
        if let Some(brokers) = &cli.kafka_brokers {
            self.kafka.brokers = split_list(brokers);
            self.kafka.enabled = true;
        }
        if let Some(url) = &cli.directory_url {
            self.directory.base_url = Some(url.clone());
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(config_file) if Path::new(config_file).exists() => {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            }
            Some(config_file) => {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::default()
            }
            None if Path::new("hub.toml").exists() => {
                info!("📄 从默认配置文件加载: hub.toml");
                Self::from_toml_file("hub.toml")?
            }
            None => Self::default(),
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<()> {
        if self.server.session_buffer == 0 {
            anyhow::bail!("server.session_buffer 必须大于 0");
        }
        if self.hub.inbox_capacity == 0 {
            anyhow::bail!("hub.inbox_capacity 必须大于 0");
        }
        if self.hub.pending_ttl_secs == 0 {
            anyhow::bail!("hub.pending_ttl_secs 必须大于 0");
        }
        if self.hub.reaper_interval_secs == 0 || self.hub.stale_after_secs == 0 {
            anyhow::bail!("hub.reaper_interval_secs / hub.stale_after_secs 必须大于 0");
        }
        if self.server.pong_wait_secs < 2 {
            anyhow::bail!("server.pong_wait_secs 至少为 2 秒");
        }
        if self.kafka.enabled && self.kafka.brokers.is_empty() {
            anyhow::bail!("kafka.enabled 时必须配置 kafka.brokers");
        }
        if let Some(base_url) = &self.directory.base_url {
            url::Url::parse(base_url)
                .with_context(|| format!("directory.base_url 不是合法 URL: {}", base_url))?;
        }
        Ok(())
    }

    fn set_redis_url(&mut self, url: String) {
        match self.redis.as_mut() {
            Some(redis) => redis.url = url,
            None => self.redis = Some(RedisConfig::from_url(url)),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 快速读取配置文件中的 [logging] 段（日志初始化早于完整配置加载）
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    #[derive(Deserialize, Default)]
    struct LoggingOnly {
        #[serde(default)]
        logging: LoggingConfig,
    }

    let path = config_file.unwrap_or("hub.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<LoggingOnly>(&content).ok())
        .map(|l| l.logging)
        .unwrap_or_default()
}

/// 默认配置文件内容（generate-config 子命令使用）
pub const DEFAULT_CONFIG_TOML: &str = r#"# Messaging Hub 配置文件
# 此文件由 messaging-hub generate-config 生成

[server]
host = "0.0.0.0"
port = 8081
ws_path = "/ws"
identity_header = "x-user-id"
max_frame_bytes = 512
pong_wait_secs = 60
write_timeout_secs = 10
session_buffer = 256

[hub]
inbox_capacity = 10000
pending_ttl_secs = 86400
reaper_interval_secs = 300
stale_after_secs = 600
relay_channel = "messages"
relay_inbound = false
group_members_ttl_secs = 3600
local_members_cache_secs = 30

# [redis]
# url = "redis://127.0.0.1:6379"
# pool_size = 200
# min_idle = 20

[kafka]
enabled = false
brokers = ["localhost:9092"]
feed_topic = "messages"
feed_group = "message-group"
notification_topic = "notifications_events"
notification_group = "notification-group"

[directory]
# base_url = "http://localhost:8080/api/v1"
timeout_ms = 3000

[logging]
level = "info"
format = "compact"
# file = "./logs/hub.log"
"#;
