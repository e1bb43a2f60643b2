//! 发送上下文
//!
//! 为单次发送尝试携带取消信号与截止时间，供限流等待等挂起点感知。

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 单次发送尝试的上下文
///
/// 取消或到达截止时间后即视为结束。
#[derive(Debug, Clone)]
pub struct SendContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl SendContext {
    /// 无截止时间的上下文
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// 带超时的上下文，截止时间从当前时刻起算
    pub fn with_timeout(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// 距离截止时间的剩余时长，无截止时间时返回 None
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 等待上下文结束
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

impl Default for SendContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = SendContext::with_timeout(CancellationToken::new(), Duration::from_secs(2));
        assert!(!ctx.is_done());

        ctx.done().await;
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates_to_child() {
        let parent = CancellationToken::new();
        let ctx = SendContext::new(parent.child_token());

        parent.cancel();
        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[test]
    fn test_default_context_never_done() {
        let ctx = SendContext::default();
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_none());
    }
}
