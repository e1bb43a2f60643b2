//! 通知投递服务
//!
//! 启动顺序：配置 → 日志与指标 → 数据库与迁移 → SMTP 连接池、限流器、发送器 → 消费者。
//! 收到 SIGINT/SIGTERM 后停止拉取，等待在途消息处理完成再退出。

use std::sync::Arc;

use notification_worker::consumer::NotificationConsumer;
use notification_worker::idempotency::{IdempotencyGuard, PgIdempotencyStore};
use notification_worker::rate_limiter::RateLimiter;
use notification_worker::registry::SenderRegistry;
use notification_worker::sender::{ChannelSender, EmailSender, InAppSender};
use notification_worker::transport::{ConnectionPool, SmtpConnector};
use notification_worker::worker::Dispatcher;
use notify_shared::config::AppConfig;
use notify_shared::database::Database;
use notify_shared::events::ChannelType;
use notify_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let observability_guard =
        observability::init(&config.observability, &config.service_name).await?;

    info!(
        environment = %config.environment,
        metrics_enabled = observability_guard.metrics_enabled(),
        workers = config.dispatch.workers,
        topics = ?config.kafka.topics,
        "正在启动通知投递服务"
    );

    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    let store = Arc::new(PgIdempotencyStore::new(db.pool().clone()));

    let smtp_pool = Arc::new(
        ConnectionPool::new(SmtpConnector::from_config(&config.smtp), config.smtp.pool_size).await?,
    );
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let email: Arc<dyn ChannelSender> = Arc::new(EmailSender::new(
        smtp_pool.clone(),
        limiter,
        config.smtp.sender_address(),
    )?);

    // OTP 验证码以邮件形式投递
    let registry = SenderRegistry::builder()
        .register(ChannelType::Email, email.clone())
        .register(ChannelType::Otp, email)
        .register(ChannelType::InApp, Arc::new(InAppSender))
        .build();

    let guard = Arc::new(IdempotencyGuard::new(store));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), guard, &config.dispatch));
    let consumer = NotificationConsumer::new(&config, dispatcher)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = consumer.run(shutdown_rx).await;

    smtp_pool.close().await;
    db.close().await;

    if let Err(e) = &result {
        error!(error = %e, code = e.code(), "消费者异常退出");
    }
    result?;

    info!("通知投递服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "安装 CTRL+C 信号处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "安装 SIGTERM 信号处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("收到关闭信号，正在停止服务...");
}
