//! 通知指令与幂等标记
//!
//! 定义生产端（API 层）写入 Kafka、投递管道消费的消息结构。
//! 指令一经发布即不可变，管道只读取不修改。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ChannelType: 投递渠道
// ---------------------------------------------------------------------------

/// 投递渠道类型
///
/// 序列化为小写字符串，与 topic 命名（`{channel}-notifications`）保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    #[serde(alias = "in-app", alias = "in_app")]
    InApp,
    /// OTP 验证码，以邮件形式投递
    Otp,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::InApp => "inapp",
            Self::Otp => "otp",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// NotificationCommand: 通知投递指令
// ---------------------------------------------------------------------------

/// 通知投递指令
///
/// 一条指令对应一个收件人、一个渠道。`id` 由服务端生成且全局唯一，
/// 同时作为幂等键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCommand {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(alias = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub recipient: String,
    /// 投递管道不读取该字段，缺失时取 Unix 纪元
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl NotificationCommand {
    /// 生成新指令，id 与创建时间由服务端填充
    pub fn new(
        user_id: impl Into<String>,
        channel_type: ChannelType,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            channel_type,
            subject: subject.into(),
            body: body.into(),
            recipient: recipient.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessedMarker: 幂等标记
// ---------------------------------------------------------------------------

/// 幂等标记：记录某条通知已完成投递处理
///
/// 只会创建一次，永不更新或删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMarker {
    pub notification_id: String,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_deserialize_camel_case() {
        let json = r#"{
            "id": "n1",
            "userId": "user-001",
            "channelType": "email",
            "subject": "欢迎",
            "body": "<p>hello</p>",
            "recipient": "a@b.com",
            "createdAt": "2025-01-15T10:30:00Z"
        }"#;

        let command: NotificationCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.id, "n1");
        assert_eq!(command.user_id, "user-001");
        assert_eq!(command.channel_type, ChannelType::Email);
        assert_eq!(command.recipient, "a@b.com");
    }

    #[test]
    fn test_command_accepts_type_alias_and_extra_fields() {
        // 生产端旧版本使用 "type" 字段，并附带 isRead 等存储字段
        let json = r#"{
            "id": "n2",
            "userId": "user-002",
            "type": "inapp",
            "recipient": "user-002",
            "isRead": false,
            "createdAt": "2025-01-15T10:30:00Z"
        }"#;

        let command: NotificationCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.channel_type, ChannelType::InApp);
        assert!(command.subject.is_empty());
    }

    #[test]
    fn test_command_tolerates_missing_metadata() {
        let json = r#"{"id": "n3", "channelType": "otp", "recipient": "a@b.com"}"#;

        let command: NotificationCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.channel_type, ChannelType::Otp);
        assert!(command.user_id.is_empty());
        assert_eq!(command.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn test_channel_type_aliases() {
        let channel: ChannelType = serde_json::from_str(r#""in-app""#).unwrap();
        assert_eq!(channel, ChannelType::InApp);

        let channel: ChannelType = serde_json::from_str(r#""otp""#).unwrap();
        assert_eq!(channel, ChannelType::Otp);

        assert!(serde_json::from_str::<ChannelType>(r#""sms""#).is_err());
    }

    #[test]
    fn test_new_command_generates_unique_ids() {
        let a = NotificationCommand::new("u", ChannelType::Email, "a@b.com", "s", "b");
        let b = NotificationCommand::new("u", ChannelType::Email, "a@b.com", "s", "b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.channel_type.to_string(), "email");
    }
}
