//! 按收件人限流
//!
//! 每个 key（收件人地址）一个令牌桶，桶参数进程内全局一致。
//! 令牌不足时调用方协作等待，而不是被直接拒绝；上下文取消或截止时间不足时放弃等待。
//! 桶一经创建不再回收，key 基数随收件人数量增长。

use std::time::Duration;

use dashmap::DashMap;
use notify_shared::config::RateLimitConfig;
use notify_shared::observability::metrics;
use tokio::time::Instant;
use tracing::debug;

use crate::context::SendContext;
use crate::error::DispatchError;

/// 单个 key 的令牌桶
///
/// `tokens` 可以为负：负值表示已被预约、尚未补充的令牌数。
#[derive(Debug)]
struct RateBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// 预约一个令牌，返回令牌可用前需要等待的时长
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_sec)
        }
    }

    /// 归还未使用的预约
    fn cancel_reservation(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

/// 按 key 分桶的令牌桶限流器
pub struct RateLimiter {
    buckets: DashMap<String, RateBucket>,
    per_second: f64,
    burst: u32,
}

impl RateLimiter {
    pub fn new(per_second: f64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            per_second,
            burst,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.per_second, config.burst)
    }

    /// 已创建令牌桶的 key 数量
    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// 为 key 获取一个令牌，必要时等待
    ///
    /// 上下文在令牌可用前结束，或所需等待超出截止时间时，
    /// 归还预约并返回 `RateLimitExceeded`。
    pub async fn allow(&self, key: &str, ctx: &SendContext) -> Result<(), DispatchError> {
        if ctx.is_done() {
            return Err(self.exceeded(key));
        }

        // 分片锁只在预约期间持有，不跨越 await
        let wait = {
            let now = Instant::now();
            let mut bucket = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| RateBucket::new(self.burst, self.per_second, now));
            bucket.reserve(now)
        };

        if wait.is_zero() {
            return Ok(());
        }

        if let Some(remaining) = ctx.remaining()
            && wait > remaining
        {
            self.give_back(key);
            debug!(
                key,
                wait_ms = wait.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "限流等待超出截止时间"
            );
            return Err(self.exceeded(key));
        }

        debug!(key, wait_ms = wait.as_millis() as u64, "等待限流令牌");

        tokio::select! {
            biased;
            _ = tokio::time::sleep(wait) => {
                metrics::record_rate_limit_wait(wait);
                Ok(())
            }
            _ = ctx.done() => {
                self.give_back(key);
                Err(self.exceeded(key))
            }
        }
    }

    fn give_back(&self, key: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.cancel_reservation(Instant::now());
        }
    }

    fn exceeded(&self, key: &str) -> DispatchError {
        DispatchError::RateLimitExceeded {
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_blocks_for_one_interval() {
        let limiter = RateLimiter::new(10.0, 2);
        let ctx = SendContext::default();
        let started = Instant::now();

        limiter.allow("a@b.com", &ctx).await.unwrap();
        limiter.allow("a@b.com", &ctx).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        // 第 burst+1 个请求需要等待一个补充间隔（100ms）
        limiter.allow("a@b.com", &ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(99));
        assert!(started.elapsed() <= Duration::from_millis(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        let ctx = SendContext::default();
        let started = Instant::now();

        limiter.allow("a@b.com", &ctx).await.unwrap();
        limiter.allow("c@d.com", &ctx).await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_aborts_wait() {
        let limiter = RateLimiter::new(1.0, 1);
        let token = CancellationToken::new();
        let ctx = SendContext::new(token.clone());

        limiter.allow("a@b.com", &ctx).await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let result = limiter.allow("a@b.com", &ctx).await;
        canceller.await.unwrap();

        match result {
            Err(DispatchError::RateLimitExceeded { key }) => assert_eq!(key, "a@b.com"),
            other => panic!("期望 RateLimitExceeded，实际为 {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_beyond_deadline_fails_immediately() {
        let limiter = RateLimiter::new(10.0, 1);
        let unbounded = SendContext::default();
        limiter.allow("a@b.com", &unbounded).await.unwrap();

        // 需要等待 100ms，但截止时间只剩 50ms
        let ctx = SendContext::with_timeout(CancellationToken::new(), Duration::from_millis(50));
        let started = Instant::now();
        let result = limiter.allow("a@b.com", &ctx).await;

        assert!(result.is_err());
        assert_eq!(started.elapsed(), Duration::ZERO);

        // 预约已归还，下一个补充间隔后即可获得令牌
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        limiter.allow("a@b.com", &unbounded).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_done_context_rejected_upfront() {
        let limiter = RateLimiter::new(10.0, 20);
        let token = CancellationToken::new();
        token.cancel();

        let result = limiter.allow("a@b.com", &SendContext::new(token)).await;
        assert!(result.is_err());
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
