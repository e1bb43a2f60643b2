//! 渠道发送器注册表
//!
//! 启动时按渠道类型注册发送器，构建后只读。渠道相关的逻辑全部在发送器内部，
//! 注册表只做查表分发。

use std::collections::HashMap;
use std::sync::Arc;

use notify_shared::events::{ChannelType, NotificationCommand};

use crate::context::SendContext;
use crate::error::DispatchError;
use crate::sender::ChannelSender;

/// 渠道 → 发送器的分发表
pub struct SenderRegistry {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn builder() -> SenderRegistryBuilder {
        SenderRegistryBuilder::default()
    }

    /// 交给指令渠道对应的发送器
    pub async fn send(
        &self,
        ctx: &SendContext,
        command: &NotificationCommand,
    ) -> Result<(), DispatchError> {
        let sender = self
            .senders
            .get(&command.channel_type)
            .ok_or(DispatchError::UnsupportedChannel(command.channel_type))?;
        sender.send(ctx, command).await
    }
}

#[derive(Default)]
pub struct SenderRegistryBuilder {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
}

impl SenderRegistryBuilder {
    /// 注册渠道发送器，同一渠道重复注册时后者覆盖前者
    pub fn register(mut self, channel: ChannelType, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn build(self) -> SenderRegistry {
        SenderRegistry {
            senders: self.senders,
        }
    }
}
