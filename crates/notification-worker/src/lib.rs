//! 通知投递工作者
//!
//! 从 Kafka 消费通知指令，经幂等检查后交给对应渠道的发送器，
//! 发送失败时在单条消息内有界重试，处理完成后才确认位点。

pub mod consumer;
pub mod context;
pub mod error;
pub mod idempotency;
pub mod offsets;
pub mod rate_limiter;
pub mod registry;
pub mod sender;
pub mod transport;
pub mod worker;
