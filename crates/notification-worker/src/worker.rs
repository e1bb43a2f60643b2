//! 投递工作池
//!
//! 固定数量的工作协程共享一个有界队列。每条消息依次经过：反序列化 → 在途认领 →
//! 幂等检查 → 有界重试发送 → 写入幂等标记 → 确认位点。
//! 单条消息的任何错误都只影响这条消息，确认总在处理结束之后发生。
//! 停机超时后被强制中断的消息不确认，位点停在它之前，由下一个分区持有者重新消费。

use std::sync::Arc;
use std::time::Duration;

use notify_shared::config::DispatchConfig;
use notify_shared::events::NotificationCommand;
use notify_shared::kafka::{ConsumerMessage, MessagePosition};
use notify_shared::observability::metrics;
use notify_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::SendContext;
use crate::error::DispatchError;
use crate::idempotency::IdempotencyGuard;
use crate::registry::SenderRegistry;

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

/// 单条消息的最终处理结果，除 `Cancelled` 外都会推进位点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
    /// 发送成功且已写入幂等标记
    Delivered,
    /// 发送成功但幂等标记写入失败，重投时可能重复发送
    DeliveredUnmarked,
    AlreadyProcessed,
    /// 同一 id 正由本进程内另一个工作协程处理
    DuplicateInFlight,
    Malformed,
    /// 重试耗尽仍未发送成功
    Exhausted,
    Unsupported,
    /// 幂等检查在重试后仍无法访问存储
    StoreUnavailable,
    /// 停机超时，发送被强制中断
    Cancelled,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::DeliveredUnmarked => "delivered_unmarked",
            Self::AlreadyProcessed => "already_processed",
            Self::DuplicateInFlight => "duplicate_in_flight",
            Self::Malformed => "malformed",
            Self::Exhausted => "exhausted",
            Self::Unsupported => "unsupported",
            Self::StoreUnavailable => "store_unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 消息处理完成后的位点确认
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, position: &MessagePosition, outcome: DispatchOutcome);
}

// ---------------------------------------------------------------------------
// Dispatcher: 单条消息的处理流程
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    registry: Arc<SenderRegistry>,
    guard: Arc<IdempotencyGuard>,
    send_policy: RetryPolicy,
    store_policy: RetryPolicy,
    send_timeout: Duration,
    /// 优雅停机超时后取消所有在途发送
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SenderRegistry>,
        guard: Arc<IdempotencyGuard>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            send_policy: RetryPolicy::linear(config.max_attempts, config.backoff_unit()),
            store_policy: RetryPolicy::exponential(
                3,
                Duration::from_millis(200),
                Duration::from_secs(2),
            ),
            send_timeout: config.send_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_store_policy(mut self, policy: RetryPolicy) -> Self {
        self.store_policy = policy;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 处理一条消息，返回最终结果
    pub async fn process(&self, message: &ConsumerMessage) -> DispatchOutcome {
        let started = Instant::now();

        let decoded: Result<NotificationCommand, DispatchError> = message
            .deserialize_payload()
            .map_err(|e| DispatchError::Deserialize(e.to_string()));

        let command = match decoded {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    code = e.code(),
                    error = %e,
                    "消息格式错误，丢弃"
                );
                metrics::record_dispatch(
                    "unknown",
                    DispatchOutcome::Malformed.as_str(),
                    started.elapsed(),
                );
                return DispatchOutcome::Malformed;
            }
        };

        let outcome = self.dispatch(&command).await;

        info!(
            notification_id = %command.id,
            channel = %command.channel_type,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            outcome = outcome.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "消息处理完成"
        );
        metrics::record_dispatch(
            command.channel_type.as_str(),
            outcome.as_str(),
            started.elapsed(),
        );

        outcome
    }

    async fn dispatch(&self, command: &NotificationCommand) -> DispatchOutcome {
        let id = command.id.as_str();

        let Some(_claim) = self.guard.claim(id) else {
            info!(notification_id = id, "同一通知正在处理中，跳过重复消息");
            return DispatchOutcome::DuplicateInFlight;
        };

        let processed = retry_with_policy(
            &self.store_policy,
            "idempotency_check",
            DispatchError::is_retryable,
            |_| self.guard.is_processed(id),
        )
        .await;

        match processed {
            Ok(true) => {
                info!(notification_id = id, "通知已处理过，跳过发送");
                return DispatchOutcome::AlreadyProcessed;
            }
            Ok(false) => {}
            Err(e) => {
                error!(notification_id = id, error = %e, "幂等存储不可用，放弃本条消息");
                return DispatchOutcome::StoreUnavailable;
            }
        }

        if let Err(e) = self.send_with_retry(command).await {
            if self.shutdown.is_cancelled() {
                warn!(
                    notification_id = id,
                    error = %e,
                    "停机中断了发送，位点保留等待重新消费"
                );
                return DispatchOutcome::Cancelled;
            }

            return match e {
                DispatchError::UnsupportedChannel(channel) => {
                    error!(
                        notification_id = id,
                        channel = %channel,
                        "渠道未注册发送器，丢弃消息"
                    );
                    DispatchOutcome::Unsupported
                }
                e => {
                    error!(
                        notification_id = id,
                        channel = %command.channel_type,
                        max_attempts = self.send_policy.max_attempts,
                        error = %e,
                        "发送重试耗尽，放弃投递"
                    );
                    DispatchOutcome::Exhausted
                }
            };
        }

        let marked = retry_with_policy(
            &self.store_policy,
            "idempotency_mark",
            DispatchError::is_retryable,
            |_| self.guard.mark_processed(id),
        )
        .await;

        match marked {
            Ok(()) => DispatchOutcome::Delivered,
            Err(e) => {
                error!(
                    notification_id = id,
                    error = %e,
                    "通知已发送但幂等标记写入失败，重投时可能重复发送"
                );
                DispatchOutcome::DeliveredUnmarked
            }
        }
    }

    /// 按线性退避重试发送，每次尝试使用独立的截止时间
    async fn send_with_retry(&self, command: &NotificationCommand) -> Result<(), DispatchError> {
        let channel = command.channel_type;
        let shutdown = &self.shutdown;

        retry_with_policy(
            &self.send_policy,
            "channel_send",
            |e: &DispatchError| e.is_retryable() && !shutdown.is_cancelled(),
            |attempt| async move {
                let ctx = SendContext::with_timeout(self.shutdown.child_token(), self.send_timeout);
                let result = self.registry.send(&ctx, command).await;

                match &result {
                    Ok(()) => {
                        metrics::record_send_attempt(channel.as_str(), "success");
                        debug!(notification_id = %command.id, attempt, "发送成功");
                    }
                    Err(e) => {
                        metrics::record_send_attempt(channel.as_str(), "failure");
                        warn!(
                            notification_id = %command.id,
                            channel = %channel,
                            attempt,
                            error = %e,
                            "发送失败"
                        );
                    }
                }
                result
            },
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// DispatchWorkerPool
// ---------------------------------------------------------------------------

/// 固定大小的工作池
///
/// 队列满时 `submit` 挂起，这是管道唯一的背压来源。
pub struct DispatchWorkerPool {
    sender: Option<mpsc::Sender<ConsumerMessage>>,
    workers: JoinSet<()>,
    abort: CancellationToken,
}

impl DispatchWorkerPool {
    pub fn start(
        config: &DispatchConfig,
        dispatcher: Arc<Dispatcher>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let abort = dispatcher.shutdown_token();

        let mut workers = JoinSet::new();
        for worker_id in 0..config.workers {
            workers.spawn(worker_loop(
                worker_id,
                rx.clone(),
                dispatcher.clone(),
                acknowledger.clone(),
            ));
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "投递工作池已启动"
        );

        Self {
            sender: Some(tx),
            workers,
            abort,
        }
    }

    /// 将消息放入队列，队列满时等待
    pub async fn submit(&self, message: ConsumerMessage) -> Result<(), DispatchError> {
        let sender = self.sender.as_ref().ok_or(DispatchError::QueueClosed)?;
        sender
            .send(message)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    /// 关闭队列并等待工作协程处理完已入队的消息
    ///
    /// 超过 `drain_timeout` 后取消在途发送，队列中剩余的消息不再取出，
    /// 再等待工作协程退出。
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        self.sender.take();
        info!("投递队列已关闭，等待工作协程处理剩余消息");

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(drain_timeout, join_all_workers(workers)).await;

        if drained.is_err() {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "等待超时，取消在途发送"
            );
            self.abort.cancel();
            join_all_workers(&mut self.workers).await;
        }

        info!("投递工作池已停止");
    }
}

async fn join_all_workers(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "工作协程异常退出");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<ConsumerMessage>>>,
    dispatcher: Arc<Dispatcher>,
    acknowledger: Arc<dyn Acknowledger>,
) {
    let abort = dispatcher.shutdown_token();

    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            message = async { queue.lock().await.recv().await } => message,
        };
        let Some(message) = next else {
            break;
        };

        let outcome = dispatcher.process(&message).await;
        acknowledger.acknowledge(&message.position(), outcome);
    }

    debug!(worker_id, "工作协程退出");
}
