//! 投递调度服务
//!
//! 薄调度层：持有已注册的渠道适配器，把一次通知并发投递到请求的
//! 渠道集合并汇总结果。渠道契约的正确性不依赖本服务——
//! 每个适配器都可独立使用，这里只是组合根的便捷入口。

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, instrument, warn};

use notify_shared::events::{ChannelType, EventBus};

use crate::channels::{BulkOptions, Channel, SendOptions};
use crate::types::{DeliveryError, DeliveryResult, Notification};

/// 投递调度服务
pub struct DeliveryService {
    channels: Vec<Arc<dyn Channel>>,
    events: EventBus,
}

impl DeliveryService {
    pub fn new(events: EventBus) -> Self {
        Self {
            channels: Vec::new(),
            events,
        }
    }

    /// 注册渠道适配器
    pub fn register_channel(&mut self, channel: Arc<dyn Channel>) {
        info!(
            channel_type = %channel.channel_type(),
            channel_name = channel.name(),
            "注册通知渠道"
        );
        self.channels.push(channel);
    }

    /// 按类型获取已注册的渠道
    pub fn channel(&self, channel_type: ChannelType) -> Option<&Arc<dyn Channel>> {
        self.channels
            .iter()
            .find(|c| c.channel_type() == channel_type)
    }

    /// 已注册的渠道类型
    pub fn registered_channel_types(&self) -> Vec<ChannelType> {
        self.channels.iter().map(|c| c.channel_type()).collect()
    }

    /// 事件总线（订阅入口）
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// 把一次通知并发投递到指定的渠道集合
    ///
    /// 每个渠道返回一条结果，顺序与 `channel_types` 一致；
    /// 未注册的渠道产生一条 CHANNEL_NOT_REGISTERED 失败结果，
    /// 不影响其他渠道。
    #[instrument(
        skip(self, notification),
        fields(
            notification_id = %notification.notification_id,
            user_id = %notification.user_id,
        )
    )]
    pub async fn send(
        &self,
        notification: &Notification,
        channel_types: &[ChannelType],
        options: &SendOptions,
    ) -> Vec<DeliveryResult> {
        let send_futures: Vec<_> = channel_types
            .iter()
            .map(|channel_type| async move {
                match self.channel(*channel_type) {
                    Some(channel) => channel.send_notification(notification, options).await,
                    None => {
                        warn!(channel = %channel_type, "渠道未注册");
                        DeliveryResult::failed(
                            notification.notification_id.clone(),
                            *channel_type,
                            0,
                            DeliveryError::new(
                                "CHANNEL_NOT_REGISTERED",
                                format!("渠道未注册: {}", channel_type),
                                true,
                                false,
                            ),
                            0,
                        )
                    }
                }
            })
            .collect();

        join_all(send_futures).await
    }

    /// 在单个渠道上批量发送
    ///
    /// 直接委托给渠道的 send_bulk（批内并发、批间延迟、顺序保持）。
    pub async fn send_bulk(
        &self,
        channel_type: ChannelType,
        notifications: &[Notification],
        options: &BulkOptions,
    ) -> Vec<DeliveryResult> {
        match self.channel(channel_type) {
            Some(channel) => channel.send_bulk(notifications, options).await,
            None => notifications
                .iter()
                .map(|n| {
                    DeliveryResult::failed(
                        n.notification_id.clone(),
                        channel_type,
                        0,
                        DeliveryError::new(
                            "CHANNEL_NOT_REGISTERED",
                            format!("渠道未注册: {}", channel_type),
                            true,
                            false,
                        ),
                        0,
                    )
                })
                .collect(),
        }
    }
}
