use thiserror::Error;

/// Hub 错误类型
///
/// 调度引擎内部的错误只写日志、不回传给客户端；这里的分类用于日志与指标。
#[derive(Debug, Error)]
pub enum HubError {
    /// Redis 不可达或命令失败（瞬时 I/O 错误）
    #[error("Redis error: {0}")]
    Redis(String),
    /// JSON 编解码失败
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 消息体已过期或从未写入
    #[error("Not found: {0}")]
    NotFound(String),
    /// 消息违反路由约束（例如同时设置了接收者与群组）
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    /// 消息 ID 已被其他发送者的消息体占用
    #[error("Conflict: {0}")]
    Conflict(String),
    /// 目录服务（群组成员、帖子作者等）查询失败
    #[error("Directory error: {0}")]
    Directory(String),
    /// Kafka 消费失败
    #[error("Kafka error: {0}")]
    Kafka(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 超时
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// Hub 已关闭（输入通道不可用）
    #[error("Hub closed: {0}")]
    Closed(String),
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// 是否为“未找到”（TTL 过期），调用方应跳过而不是传播
    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::NotFound(_))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for HubError {
    fn from(err: redis::RedisError) -> Self {
        HubError::Redis(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for HubError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        HubError::Kafka(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Directory(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HubError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HubError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_skippable() {
        assert!(HubError::NotFound("msg:1".into()).is_not_found());
        assert!(!HubError::Redis("down".into()).is_not_found());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: HubError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, HubError::Serialization(_)));
    }
}
