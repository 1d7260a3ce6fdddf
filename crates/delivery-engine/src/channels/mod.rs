//! 通知渠道实现
//!
//! 定义渠道契约 [`Channel`] 并提供四个渠道的具体实现。
//!
//! ## 支持的渠道
//!
//! - **Email**: 邮件（追踪注入、SMTP 永久错误分类、退信 / 投诉处理）
//! - **SMS**: 短信（号码规范化、分段计算、合规文案、关键字退订）
//! - **Push**: 推送（token 注册表、按平台分组、组播、失败生命周期）
//! - **InApp**: 站内信（实时优先、持久化回落、未读 / 角标计数）

mod email;
mod in_app;
mod push;
mod sms;

pub use email::{
    BounceType, EmailAdapter, EmailMessage, EmailReceipt, EmailTransport, EmailTransportError,
    SimulatedEmailTransport,
};
pub use in_app::{InAppAdapter, InAppNotification, UserNotifications, sanitize_for_client};
pub use push::{
    MulticastResult, PushAdapter, PushPayload, PushProviderError, PushTransport,
    SimulatedPushTransport,
};
pub use sms::{
    KeywordAction, SimulatedSmsTransport, SmsAdapter, SmsTransport, SmsTransportError,
    normalize_phone, sms_segments,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tracing::error;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{ChannelType, EventBus};
use notify_shared::store::KeyValueStore;

use crate::delivery_log::DeliveryLog;
use crate::metrics::{ChannelMetrics, MetricsAggregator, MetricsPeriod};
use crate::rate_limit::RateLimiter;
use crate::suppression::SuppressionStore;
use crate::types::{DeliveryError, DeliveryResult, Notification};

/// 单次发送选项
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// 为 false 时跳过模板渲染，即使元数据携带 template_id
    pub template: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { template: true }
    }
}

impl SendOptions {
    /// 跳过模板渲染
    pub fn without_template() -> Self {
        Self { template: false }
    }
}

/// 批量发送选项
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// 每批条数
    pub batch_size: usize,
    /// 批与批之间的间隔
    pub delay_between_batches: Duration,
    /// 单条发送选项
    pub send: SendOptions,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_between_batches: Duration::from_millis(200),
            send: SendOptions::default(),
        }
    }
}

/// 通知渠道契约
///
/// 单条失败一律以 `DeliveryResult { success: false }` 形式返回，
/// 不向调用方抛错——只有构造阶段的配置错误才会以 `Err` 出现。
#[async_trait]
pub trait Channel: Send + Sync {
    /// 渠道类型标识
    fn channel_type(&self) -> ChannelType;

    /// 渠道名称（用于日志）
    fn name(&self) -> &str;

    /// 发送通知
    ///
    /// 每次调用按序执行：限流检查（快速失败）、抑制检查、模板渲染、
    /// 传输调用（带超时）、指标更新、投递记录写入、事件发布。
    async fn send_notification(
        &self,
        notification: &Notification,
        options: &SendOptions,
    ) -> DeliveryResult;

    /// 批量发送通知
    ///
    /// 固定批次切分，批内并发、批间延迟；返回结果与输入一一对应且
    /// 保持顺序，单条拒绝（甚至 panic）不会中断整批——
    /// 意外中断被折叠为 BATCH_ERROR 结果。
    async fn send_bulk(
        &self,
        notifications: &[Notification],
        options: &BulkOptions,
    ) -> Vec<DeliveryResult> {
        let batch_size = options.batch_size.max(1);
        let mut results = Vec::with_capacity(notifications.len());
        let batch_count = notifications.len().div_ceil(batch_size);

        for (index, batch) in notifications.chunks(batch_size).enumerate() {
            let futures: Vec<_> = batch
                .iter()
                .map(|notification| {
                    let notification_id = notification.notification_id.clone();
                    async move {
                        let outcome = std::panic::AssertUnwindSafe(
                            self.send_notification(notification, &options.send),
                        )
                        .catch_unwind()
                        .await;
                        (notification_id, outcome)
                    }
                })
                .collect();

            for (notification_id, outcome) in join_all(futures).await {
                match outcome {
                    Ok(result) => results.push(result),
                    Err(_) => {
                        error!(
                            notification_id = %notification_id,
                            channel = %self.channel_type(),
                            "批量发送中单条任务异常中断"
                        );
                        let err = NotifyError::Batch("发送任务异常中断".to_string());
                        results.push(DeliveryResult::failed(
                            notification_id,
                            self.channel_type(),
                            0,
                            DeliveryError::from(&err),
                            0,
                        ));
                    }
                }
            }

            if index + 1 < batch_count && !options.delay_between_batches.is_zero() {
                tokio::time::sleep(options.delay_between_batches).await;
            }
        }

        results
    }

    /// 读取渠道指标
    async fn get_metrics(&self, period: MetricsPeriod) -> Result<ChannelMetrics>;
}

// ---------------------------------------------------------------------------
// ChannelRuntime — 适配器共享的横切组件
// ---------------------------------------------------------------------------

/// 渠道运行时
///
/// 限流器、抑制名单、指标聚合、投递记录与事件总线在四个适配器之间
/// 复用，全部挂在同一个键值存储上。
#[derive(Clone)]
pub struct ChannelRuntime {
    pub store: Arc<dyn KeyValueStore>,
    pub suppression: SuppressionStore,
    pub limiter: RateLimiter,
    pub metrics: MetricsAggregator,
    pub delivery_log: DeliveryLog,
    pub events: EventBus,
}

impl ChannelRuntime {
    pub fn new(store: Arc<dyn KeyValueStore>, events: EventBus, log_retention: Duration) -> Self {
        Self {
            suppression: SuppressionStore::new(store.clone()),
            limiter: RateLimiter::new(store.clone()),
            metrics: MetricsAggregator::new(store.clone()),
            delivery_log: DeliveryLog::new(store.clone(), log_retention),
            store,
            events,
        }
    }

    /// 投递收尾：写投递记录、发布完成事件、上报耗时
    ///
    /// 指标计数由各适配器自行维护（计数口径随渠道不同——
    /// push 按 token 计，其余按消息计）。
    pub(crate) async fn finalize(
        &self,
        notification: &Notification,
        result: DeliveryResult,
    ) -> DeliveryResult {
        self.delivery_log
            .record(&result, notification.metadata.ttl_secs)
            .await;

        metrics::histogram!(
            "notify_delivery_duration_seconds",
            "channel" => result.channel.as_str(),
        )
        .record(result.duration_ms as f64 / 1000.0);

        self.events
            .publish(notify_shared::events::EngineEvent::DeliveryCompleted {
                channel: result.channel,
                notification_id: result.notification_id.clone(),
                user_id: notification.user_id.clone(),
                success: result.success,
                error_code: result.error_code().map(|c| c.to_string()),
                timestamp: result.timestamp,
            });

        result
    }
}

/// 以超时约束传输调用
///
/// 超时以瞬时 `Timeout` 错误上浮——任何传输都不允许无限期阻塞。
pub(crate) async fn with_timeout<T>(
    channel: ChannelType,
    timeout_ms: u64,
    fut: impl std::future::Future<Output = std::result::Result<T, NotifyError>>,
) -> std::result::Result<T, NotifyError> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout {
            channel: channel.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(ChannelType::Email, 10, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, NotifyError>(())
        })
        .await;

        match result {
            Err(NotifyError::Timeout { channel }) => assert_eq!(channel, "email"),
            other => panic!("期望超时错误，实际: {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let result = with_timeout(ChannelType::Email, 1_000, async { Ok::<_, NotifyError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
