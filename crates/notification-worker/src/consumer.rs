//! 通知消费者
//!
//! 从 Kafka 消费通知指令，逐条送入工作池的有界队列。队列满时送入操作挂起，
//! 进而阻塞拉取循环。位点只在工作协程处理完成后存储，由周期性自动提交、
//! 分区回收时的同步提交以及停机时的最终提交写回 broker。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::AppConfig;
use notify_shared::error::NotifyError;
use notify_shared::kafka::{ConsumerMessage, KafkaConsumer, MessagePosition};
use notify_shared::observability::metrics;
use rdkafka::ClientContext;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::offsets::{OffsetTracker, PartitionKey};
use crate::worker::{Acknowledger, DispatchOutcome, DispatchWorkerPool, Dispatcher};

// ---------------------------------------------------------------------------
// 消费者上下文：再均衡与提交回调
// ---------------------------------------------------------------------------

/// 自定义消费者上下文
///
/// 分区被回收前等待其在途消息处理完成（有上限），同步提交后再放手。
pub struct ConsumerCallbacks {
    tracker: Arc<OffsetTracker>,
    drain_timeout: Duration,
}

impl ConsumerCallbacks {
    pub fn new(tracker: Arc<OffsetTracker>, drain_timeout: Duration) -> Self {
        Self {
            tracker,
            drain_timeout,
        }
    }

    /// 等待被回收分区的在途消息，返回是否在时限内完成
    fn drain(&self, partitions: &[PartitionKey]) -> bool {
        let wait = || self.tracker.wait_drained(partitions, self.drain_timeout);

        // 回调运行在拉取消息的协程里，多线程运行时下让出工作线程再阻塞
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(wait)
            }
            _ => wait(),
        }
    }
}

fn partition_keys(tpl: &TopicPartitionList) -> Vec<PartitionKey> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

impl ClientContext for ConsumerCallbacks {}

impl ConsumerContext for ConsumerCallbacks {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let partitions = partition_keys(tpl);
                let pending = self.tracker.in_flight(&partitions);
                info!(?partitions, pending, "分区即将被回收，等待在途消息完成");

                if !self.drain(&partitions) {
                    warn!(
                        drain_timeout_secs = self.drain_timeout.as_secs(),
                        remaining = self.tracker.in_flight(&partitions),
                        "等待在途消息超时，未完成的消息将由新的分区持有者重新消费"
                    );
                }

                if let Err(e) = base_consumer.commit_consumer_state(CommitMode::Sync) {
                    debug!(error = %e, "回收前同步提交位点未完成");
                }
                self.tracker.release(&partitions);
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = ?partition_keys(tpl), "已分配分区");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "消费组再均衡出错");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "位点已提交"),
            Err(e) => warn!(error = %e, "位点提交失败"),
        }
    }
}

// ---------------------------------------------------------------------------
// 消息来源与位点确认
// ---------------------------------------------------------------------------

/// 消费循环依赖的消息来源
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError>;

    async fn recv(&self) -> Result<ConsumerMessage, NotifyError>;

    /// 同步提交已存储的位点
    fn commit_stored(&self) -> Result<(), NotifyError>;
}

#[async_trait]
impl<C: ConsumerContext + 'static> MessageSource for KafkaConsumer<C> {
    fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        KafkaConsumer::subscribe(self, topics)
    }

    async fn recv(&self) -> Result<ConsumerMessage, NotifyError> {
        KafkaConsumer::recv(self).await
    }

    fn commit_stored(&self) -> Result<(), NotifyError> {
        KafkaConsumer::commit_stored(self)
    }
}

/// 存储分区的下一个待消费位点
pub trait OffsetStore: Send + Sync {
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), NotifyError>;
}

impl<C: ConsumerContext + 'static> OffsetStore for KafkaConsumer<C> {
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<(), NotifyError> {
        self.store_offset(topic, partition, next_offset)
    }
}

/// 工作协程处理完成后推进连续低水位并存储位点
///
/// 被停机中断的消息保持在途，位点不会越过它。
pub struct OffsetAcknowledger<S: OffsetStore> {
    store: Arc<S>,
    tracker: Arc<OffsetTracker>,
}

impl<S: OffsetStore> OffsetAcknowledger<S> {
    pub fn new(store: Arc<S>, tracker: Arc<OffsetTracker>) -> Self {
        Self { store, tracker }
    }
}

impl<S: OffsetStore> Acknowledger for OffsetAcknowledger<S> {
    fn acknowledge(&self, position: &MessagePosition, outcome: DispatchOutcome) {
        if outcome == DispatchOutcome::Cancelled {
            debug!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                "消息被中断，不推进位点"
            );
            return;
        }

        let Some(next) = self
            .tracker
            .complete(&position.topic, position.partition, position.offset)
        else {
            return;
        };

        match self.store.store(&position.topic, position.partition, next) {
            Ok(()) => debug!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                next_offset = next,
                outcome = outcome.as_str(),
                "位点已存储"
            ),
            Err(e) => warn!(
                topic = %position.topic,
                partition = position.partition,
                next_offset = next,
                error = %e,
                "存储位点失败"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationConsumer
// ---------------------------------------------------------------------------

pub struct NotificationConsumer<S: MessageSource + OffsetStore + 'static> {
    source: Arc<S>,
    tracker: Arc<OffsetTracker>,
    pool: DispatchWorkerPool,
    topics: Vec<String>,
    drain_timeout: Duration,
}

impl NotificationConsumer<KafkaConsumer<ConsumerCallbacks>> {
    pub fn new(config: &AppConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, DispatchError> {
        let tracker = Arc::new(OffsetTracker::new());
        let callbacks = ConsumerCallbacks::new(tracker.clone(), config.dispatch.drain_timeout());
        let consumer = Arc::new(KafkaConsumer::with_context(&config.kafka, callbacks)?);

        Ok(Self::with_source(consumer, tracker, config, dispatcher))
    }
}

impl<S: MessageSource + OffsetStore + 'static> NotificationConsumer<S> {
    /// 使用给定的消息来源启动工作池
    ///
    /// `tracker` 必须与来源的再均衡回调共享同一个实例。
    pub fn with_source(
        source: Arc<S>,
        tracker: Arc<OffsetTracker>,
        config: &AppConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let acknowledger = Arc::new(OffsetAcknowledger::new(source.clone(), tracker.clone()));
        let pool = DispatchWorkerPool::start(&config.dispatch, dispatcher, acknowledger);

        Self {
            source,
            tracker,
            pool,
            topics: config.kafka.topics.clone(),
            drain_timeout: config.dispatch.drain_timeout(),
        }
    }

    /// 启动消费循环，直到收到 shutdown 信号或遇到致命错误
    ///
    /// 退出前关闭队列、等待工作协程处理完已入队的消息，并同步提交位点。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        if let Err(e) = self.source.subscribe(&topics) {
            self.pool.shutdown(self.drain_timeout).await;
            return Err(e.into());
        }

        info!(?topics, "通知消费者已启动");

        let mut fatal: Option<NotifyError> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("收到停机信号，停止拉取消息");
                    break;
                }

                received = self.source.recv() => match received {
                    Ok(message) => {
                        metrics::record_message_consumed(&message.topic);
                        let position = message.position();
                        self.tracker.begin(&position.topic, position.partition, position.offset);

                        // 队列满时在这里挂起，停机信号可以打断等待
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => {
                                info!(
                                    topic = %position.topic,
                                    partition = position.partition,
                                    offset = position.offset,
                                    "停机时消息尚未入队，位点不会越过它"
                                );
                                break;
                            }
                            submitted = self.pool.submit(message) => {
                                if let Err(e) = submitted {
                                    error!(error = %e, "投递队列已关闭，停止拉取");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Kafka 致命错误，消费者停止");
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "接收消息出错，跳过");
                    }
                }
            }
        }

        self.pool.shutdown(self.drain_timeout).await;

        if let Err(e) = self.source.commit_stored() {
            warn!(error = %e, "停机时提交位点失败");
        }

        info!("通知消费者已停止");

        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
