//! 渠道发送器
//!
//! 通过 `ChannelSender` trait 抽象单一渠道的发送行为。邮件发送器组合限流器与连接池，
//! 站内信目前没有独立的传输通道，仅记录投递日志。

use std::sync::Arc;

use async_trait::async_trait;
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use notify_shared::events::NotificationCommand;
use tracing::{debug, info};

use crate::context::SendContext;
use crate::error::DispatchError;
use crate::rate_limiter::RateLimiter;
use crate::transport::{ConnectionPool, Connector, MailConnection};

/// 渠道发送器 trait，每个实现只负责一个渠道
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// 发送单条通知
    async fn send(
        &self,
        ctx: &SendContext,
        command: &NotificationCommand,
    ) -> Result<(), DispatchError>;
}

// ---------------------------------------------------------------------------
// 邮件发送器
// ---------------------------------------------------------------------------

/// 邮件发送器
///
/// 步骤依次为：按收件人限流 → 构造邮件 → 取出连接 → 投递事务 → 归还连接。
/// 任一步骤失败即中止，已取出的连接在所有路径上都会归还。
pub struct EmailSender<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    limiter: Arc<RateLimiter>,
    from: Mailbox,
}

impl<C: Connector> EmailSender<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        limiter: Arc<RateLimiter>,
        from_address: &str,
    ) -> Result<Self, DispatchError> {
        let from = from_address.parse::<Mailbox>().map_err(|e| {
            DispatchError::Configuration(format!("发件人地址无效 {from_address}: {e}"))
        })?;
        Ok(Self {
            pool,
            limiter,
            from,
        })
    }

    /// 每次发送构造新的邮件对象，发送之间不共享可变状态
    fn build_message(&self, command: &NotificationCommand) -> Result<Message, DispatchError> {
        let send_failed = |reason: String| DispatchError::SendFailed {
            channel: command.channel_type,
            reason,
        };

        let to = command
            .recipient
            .parse::<Mailbox>()
            .map_err(|e| send_failed(format!("收件人地址无效: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(command.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(command.body.clone())
            .map_err(|e| send_failed(format!("构造邮件失败: {e}")))
    }
}

#[async_trait]
impl<C: Connector> ChannelSender for EmailSender<C> {
    async fn send(
        &self,
        ctx: &SendContext,
        command: &NotificationCommand,
    ) -> Result<(), DispatchError> {
        self.limiter.allow(&command.recipient, ctx).await?;

        let message = self.build_message(command)?;
        let payload = message.formatted();

        let mut conn = self.pool.acquire().await?;
        let result = conn.transact(message.envelope(), &payload).await;
        self.pool.release(conn).await;
        result?;

        info!(
            notification_id = %command.id,
            channel = %command.channel_type,
            recipient = %command.recipient,
            "邮件已发送"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 站内信发送器
// ---------------------------------------------------------------------------

/// 站内信发送器
///
/// 站内信记录由 API 层写入存储，用户拉取时即可见，这里只记录投递事件。
pub struct InAppSender;

#[async_trait]
impl ChannelSender for InAppSender {
    async fn send(
        &self,
        _ctx: &SendContext,
        command: &NotificationCommand,
    ) -> Result<(), DispatchError> {
        debug!(body_len = command.body.len(), "站内信正文");
        info!(
            notification_id = %command.id,
            user_id = %command.user_id,
            subject = %command.subject,
            "站内信已投递"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use notify_shared::events::ChannelType;
    use notify_shared::test_utils::{command_with_channel, email_command};
    use tokio_util::sync::CancellationToken;

    use crate::transport::tests::{Counters, FakeConnector};

    async fn email_sender(
        connector: FakeConnector,
        limiter: RateLimiter,
    ) -> (EmailSender<FakeConnector>, Arc<ConnectionPool<FakeConnector>>) {
        let pool = Arc::new(ConnectionPool::new(connector, 2).await.unwrap());
        let sender =
            EmailSender::new(pool.clone(), Arc::new(limiter), "noreply@example.com").unwrap();
        (sender, pool)
    }

    #[tokio::test]
    async fn test_email_send_releases_connection() {
        let counters = Arc::new(Counters::default());
        let (sender, pool) =
            email_sender(FakeConnector::new(counters.clone()), RateLimiter::new(10.0, 20)).await;

        sender
            .send(&SendContext::default(), &email_command("n1", "a@b.com"))
            .await
            .unwrap();

        assert_eq!(counters.transactions.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_email_send_failure_releases_and_discards_connection() {
        let counters = Arc::new(Counters::default());
        let mut connector = FakeConnector::new(counters.clone());
        connector.fail_transact = true;
        let (sender, pool) = email_sender(connector, RateLimiter::new(10.0, 20)).await;

        let err = sender
            .send(&SendContext::default(), &email_command("n1", "a@b.com"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "SEND_FAILED");
        // 损坏的连接被关闭，池中只剩一个
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_recipient_never_acquires() {
        let counters = Arc::new(Counters::default());
        let (sender, pool) =
            email_sender(FakeConnector::new(counters.clone()), RateLimiter::new(10.0, 20)).await;

        let result = sender
            .send(&SendContext::default(), &email_command("n1", "not-an-address"))
            .await;

        assert!(matches!(result, Err(DispatchError::SendFailed { .. })));
        assert_eq!(counters.transactions.load(Ordering::SeqCst), 0);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_send_respects_deadline() {
        let counters = Arc::new(Counters::default());
        let (sender, _pool) =
            email_sender(FakeConnector::new(counters.clone()), RateLimiter::new(1.0, 1)).await;
        let command = email_command("n1", "a@b.com");

        sender.send(&SendContext::default(), &command).await.unwrap();

        let ctx = SendContext::with_timeout(CancellationToken::new(), Duration::from_millis(200));
        let result = sender.send(&ctx, &command).await;

        assert!(matches!(result, Err(DispatchError::RateLimitExceeded { .. })));
        assert_eq!(counters.transactions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_from_address_is_configuration_error() {
        let pool = ConnectionPool::new(FakeConnector::new(Arc::new(Counters::default())), 1)
            .await
            .unwrap();

        let result = EmailSender::new(
            Arc::new(pool),
            Arc::new(RateLimiter::new(10.0, 20)),
            "not an address",
        );
        assert!(matches!(result, Err(DispatchError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_in_app_sender_always_succeeds() {
        let sender = InAppSender;
        let command = command_with_channel("n2", ChannelType::InApp, "user-002");

        assert!(sender.send(&SendContext::default(), &command).await.is_ok());
    }
}
