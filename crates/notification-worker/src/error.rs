//! 投递管道错误类型
//!
//! 按处理策略对错误分类：瞬时故障在单条消息内有界重试，
//! 配置缺陷与格式错误直接丢弃，任何单条消息的错误都不会中止工作池。

use notify_shared::error::NotifyError;
use notify_shared::events::ChannelType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("通知反序列化失败: {0}")]
    Deserialize(String),

    /// 等待令牌期间上下文被取消，或所需等待超出截止时间
    #[error("触发限流: key={key}")]
    RateLimitExceeded { key: String },

    #[error("出站连接不可用: {0}")]
    TransportUnavailable(String),

    #[error("通知发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: ChannelType, reason: String },

    #[error("幂等存储错误: {0}")]
    Store(#[source] NotifyError),

    #[error("渠道未注册发送器: {0}")]
    UnsupportedChannel(ChannelType),

    #[error("投递队列已关闭")]
    QueueClosed,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

impl DispatchError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Deserialize(_) => "DESERIALIZE_ERROR",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Self::SendFailed { .. } => "SEND_FAILED",
            Self::Store(_) => "STORE_ERROR",
            Self::UnsupportedChannel(_) => "UNSUPPORTED_CHANNEL",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 是否可在单条消息内重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. }
            | Self::TransportUnavailable(_)
            | Self::SendFailed { .. } => true,
            Self::Store(e) | Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}
