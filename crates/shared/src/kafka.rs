//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和手动位点存储语义。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::NotifyError;
use crate::events::NotificationCommand;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，防止字符串散落在各服务中导致拼写不一致
pub mod topics {
    use crate::events::ChannelType;

    pub const EMAIL_NOTIFICATIONS: &str = "email-notifications";
    pub const INAPP_NOTIFICATIONS: &str = "inapp-notifications";
    pub const OTP_NOTIFICATIONS: &str = "otp-notifications";

    /// 渠道对应的 topic：`{channel}-notifications`
    pub fn for_channel(channel: ChannelType) -> &'static str {
        match channel {
            ChannelType::Email => EMAIL_NOTIFICATIONS,
            ChannelType::InApp => INAPP_NOTIFICATIONS,
            ChannelType::Otp => OTP_NOTIFICATIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消息在分区中的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给工作池。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    pub fn position(&self) -> MessagePosition {
        MessagePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, NotifyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| NotifyError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 要求全部副本确认，避免指令在 leader 切换时丢失。
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), NotifyError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }

    /// 发布通知指令到渠道对应的 topic，以通知 id 作为消息键
    pub async fn publish_command(
        &self,
        command: &NotificationCommand,
    ) -> Result<(i32, i64), NotifyError> {
        let topic = topics::for_channel(command.channel_type);
        let position = self.send_json(topic, &command.id, command).await?;

        info!(
            notification_id = %command.id,
            channel = %command.channel_type,
            topic,
            "通知指令已入队"
        );
        Ok(position)
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动位点存储：只有工作池确认处理完成的位点才会被存储，
/// 再由周期性自动提交或显式同步提交写回 broker。
pub struct KafkaConsumer<C: ConsumerContext + 'static> {
    consumer: StreamConsumer<C>,
}

impl<C: ConsumerContext + 'static> KafkaConsumer<C> {
    /// 使用自定义上下文（再均衡回调、提交回调）创建消费者
    ///
    /// 分区分配采用 round-robin，新消费组从最新位点开始。
    pub fn with_context(config: &KafkaConfig, context: C) -> Result<Self, NotifyError> {
        let consumer: StreamConsumer<C> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("partition.assignment.strategy", "roundrobin")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create_with_context(context)
            .map_err(|e| NotifyError::KafkaFatal(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::KafkaFatal(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 等待下一条消息
    ///
    /// broker 全部不可达或 librdkafka 报告致命错误时返回 `KafkaFatal`，
    /// 其余接收错误返回可跳过的 `Kafka`。
    pub async fn recv(&self) -> Result<ConsumerMessage, NotifyError> {
        match self.consumer.recv().await {
            Ok(borrowed) => Ok(ConsumerMessage::from_borrowed(&borrowed)),
            Err(e) if is_fatal(&e) => Err(NotifyError::KafkaFatal(e.to_string())),
            Err(e) => Err(NotifyError::Kafka(format!("接收消息出错: {e}"))),
        }
    }

    /// 存储分区的下一个待消费位点，等待下一次提交
    pub fn store_offset(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), NotifyError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| NotifyError::Kafka(format!("构造位点列表失败: {e}")))?;

        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| NotifyError::Kafka(format!("存储位点失败: {e}")))
    }

    /// 同步提交已存储的位点
    pub fn commit_stored(&self) -> Result<(), NotifyError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // 没有新位点可提交不算错误
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(NotifyError::Kafka(format!("提交位点失败: {e}"))),
        }
    }
}

fn is_fatal(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::AllBrokersDown) | Some(RDKafkaErrorCode::Fatal)
    )
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
