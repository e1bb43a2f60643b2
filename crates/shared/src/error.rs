//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 业务层（投递管道）的错误分类由各服务自行定义，并通过 `#[from]` 包装本类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    /// 无法加入消费组、所有 broker 不可达等致命错误，消费者必须停止
    #[error("Kafka 致命错误: {0}")]
    KafkaFatal(String),

    // ==================== 配置错误 ====================
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    // ==================== 通用错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::KafkaFatal(_) => "KAFKA_FATAL",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有瞬时的外部依赖故障可以重试；配置、序列化问题重试也不会好转。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_))
    }

    /// 是否为必须终止消费者的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::KafkaFatal(_))
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = NotifyError::Kafka("broker 超时".to_string());
        assert_eq!(err.code(), "KAFKA_ERROR");
        assert_eq!(err.to_string(), "Kafka 错误: broker 超时");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = NotifyError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let config_err = NotifyError::InvalidConfig("workers 不能为 0".to_string());
        assert!(!config_err.is_retryable());

        let fatal = NotifyError::KafkaFatal("AllBrokersDown".to_string());
        assert!(!fatal.is_retryable());
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: NotifyError = parse.unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
