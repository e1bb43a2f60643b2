//! 重试策略与执行器
//!
//! 提供有界重试机制，用于瞬时故障（SMTP 连接中断、限流等待超时、存储不可达等）的自动恢复。
//! 配置类错误（如渠道未注册）不应被重试，由调用方通过 `is_retryable` 闭包控制。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// RetryPolicy: 重试策略配置
// ---------------------------------------------------------------------------

/// 退避曲线
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// 第 n 次失败后等待 base × n
    Linear,
    /// 第 n 次失败后等待 base × multiplier^(n-1)
    Exponential { multiplier: f64 },
}

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大执行次数（含首次执行）
    pub max_attempts: u32,
    /// 退避基准时长
    pub base_delay: Duration,
    /// 退避时间上限，防止等待过长
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 默认策略：最多执行 3 次，线性退避 1 秒 × 次数，即 1s、2s
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// 线性退避策略
    pub fn linear(max_attempts: u32, unit: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: unit,
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Linear,
        }
    }

    /// 指数退避策略（倍数 2.0）
    pub fn exponential(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: initial,
            max_delay,
            backoff: Backoff::Exponential { multiplier: 2.0 },
        }
    }

    /// 计算第 N 次执行失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = match self.backoff {
            Backoff::Linear => base_ms * attempt as f64,
            Backoff::Exponential { multiplier } => base_ms * multiplier.powi(attempt as i32 - 1),
        };
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 第 attempt 次执行失败后是否还有剩余次数
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// retry_with_policy: 带重试的异步执行器
// ---------------------------------------------------------------------------

/// 带重试的异步执行器
///
/// 对任意异步操作应用重试策略。仅在操作返回可重试错误时才重试，
/// 不可重试的错误直接向上传播。operation 收到当前执行序号（从 1 开始）。
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return Err(err);
                }

                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "已达最大执行次数，放弃重试"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
