//! Push 推送通知渠道
//!
//! 职责：把通知扇出到用户名下所有启用的设备 token（按平台分组），
//! 跨用户组播时把全部平台的 token 全局汇总后按批次发送；
//! 逐次失败分类为"应移除 token"与"可重试"，前者立即禁用，
//! 后者累计失败计数、达到阈值后禁用。
//!
//! 适配器不关心推送服务商的线上协议，[`PushTransport`] 的契约只有：
//! 把载荷发给 (token, platform)，返回服务商消息 ID 或分类错误。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{ChannelType, EngineEvent};

use super::{Channel, ChannelRuntime, SendOptions, with_timeout};
use crate::config::PushConfig;
use crate::metrics::{ChannelMetrics, MetricEvent, MetricsPeriod};
use crate::rate_limit::RateWindow;
use crate::suppression::SuppressionReason;
use crate::template::{PersonalizationContext, TemplateRenderer};
use crate::token_registry::{PushPlatform, PushToken, TokenRegistry};
use crate::types::{
    DeliveryDetail, DeliveryError, DeliveryResult, Notification, NotificationAction,
    TokenDeliveryResult, mask_token,
};

// ---------------------------------------------------------------------------
// 载荷
// ---------------------------------------------------------------------------

/// iOS 专有字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IosOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<String>,
}

/// Android 专有字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidOptions {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// 推送载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub actions: Vec<NotificationAction>,
    /// 透传业务数据
    pub data: HashMap<String, serde_json::Value>,
    pub ios: IosOptions,
    pub android: AndroidOptions,
}

// ---------------------------------------------------------------------------
// 传输契约
// ---------------------------------------------------------------------------

/// 推送服务商错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum PushProviderError {
    /// token 已失效（设备卸载 / 注销）
    #[error("token 已失效")]
    Unregistered,
    /// token 格式被服务商拒绝
    #[error("token 无效")]
    InvalidToken,
    /// 载荷超限
    #[error("载荷超出大小限制")]
    PayloadTooLarge,
    /// 服务商限流
    #[error("服务商限流")]
    RateLimited,
    /// 服务商暂时不可用
    #[error("服务商不可用: {0}")]
    Unavailable(String),
}

impl PushProviderError {
    /// 是否应立即移除（禁用）token
    pub fn should_remove_token(&self) -> bool {
        matches!(self, Self::Unregistered | Self::InvalidToken)
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }
}

/// 推送传输抽象
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        token: &str,
        platform: PushPlatform,
        payload: &PushPayload,
    ) -> std::result::Result<String, PushProviderError>;
}

/// 模拟推送传输
pub struct SimulatedPushTransport;

#[async_trait]
impl PushTransport for SimulatedPushTransport {
    async fn send(
        &self,
        token: &str,
        platform: PushPlatform,
        payload: &PushPayload,
    ) -> std::result::Result<String, PushProviderError> {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // 联调触发规则：特定片段模拟服务商侧失败
        if token.contains("dead") {
            return Err(PushProviderError::Unregistered);
        }
        if token.contains("flaky") {
            return Err(PushProviderError::Unavailable("连接被重置".to_string()));
        }

        debug!(platform = %platform, title = %payload.title, "模拟发送推送");
        Ok(format!("push_{}", Uuid::new_v4()))
    }
}

// ---------------------------------------------------------------------------
// 组播结果
// ---------------------------------------------------------------------------

/// 跨用户组播结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastResult {
    /// 去重后的目标用户数
    pub total_users: usize,
    /// 被抑制名单跳过的用户数
    pub suppressed_users: usize,
    pub total_tokens: usize,
    pub delivered: usize,
    pub failed: usize,
    pub token_results: Vec<TokenDeliveryResult>,
}

// ---------------------------------------------------------------------------
// PushAdapter
// ---------------------------------------------------------------------------

/// Push 推送通知渠道
pub struct PushAdapter {
    config: ArcSwap<PushConfig>,
    runtime: ChannelRuntime,
    renderer: Arc<dyn TemplateRenderer>,
    registry: TokenRegistry,
    transport: Arc<dyn PushTransport>,
}

impl PushAdapter {
    pub fn new(
        config: PushConfig,
        runtime: ChannelRuntime,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = TokenRegistry::new(
            runtime.store.clone(),
            runtime.events.clone(),
            config.max_tokens_per_user,
            config.failure_threshold,
        );
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            runtime,
            renderer,
            registry,
            transport,
        })
    }

    /// 替换渠道配置
    ///
    /// token 上限与失败阈值属于注册表的构造参数，
    /// 重新配置时一并重建注册表（存储数据不受影响）。
    pub fn reconfigure(&self, config: PushConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        info!("Push 渠道配置已更新");
        Ok(())
    }

    /// token 注册表（注册 / 清扫入口）
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// 构建推送载荷
    ///
    /// 平台可选字段从透传元数据读取：iOS 的 subtitle / attachments，
    /// Android 的 androidChannel / visibility。
    fn build_payload(
        &self,
        config: &PushConfig,
        notification: &Notification,
        title: String,
        body: String,
    ) -> PushPayload {
        let extra = &notification.metadata.extra;
        let str_field = |key: &str| -> Option<String> {
            extra
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        PushPayload {
            title,
            body,
            icon: notification.metadata.icon.clone(),
            sound: notification.metadata.sound.clone(),
            actions: notification.actions.clone(),
            data: extra.clone(),
            ios: IosOptions {
                subtitle: str_field("subtitle"),
                attachments: extra
                    .get("attachments")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            android: AndroidOptions {
                channel: str_field("androidChannel")
                    .unwrap_or_else(|| config.default_android_channel.clone()),
                visibility: str_field("visibility"),
            },
        }
    }

    /// 渲染标题与正文
    async fn render_content(
        &self,
        notification: &Notification,
        options: &SendOptions,
    ) -> Result<(String, String)> {
        if options.template
            && let Some(template_id) = &notification.metadata.template_id
        {
            let context = PersonalizationContext::new(
                notification.user_id.clone(),
                notification.metadata.extra.clone(),
            );
            let rendered = self
                .renderer
                .render(template_id, &context, ChannelType::Push)
                .await?;
            return Ok((
                rendered.title.unwrap_or_else(|| notification.title.clone()),
                rendered.body,
            ));
        }
        Ok((notification.title.clone(), notification.message.clone()))
    }

    /// 对一个 token 执行一次传输并处理失败生命周期
    async fn send_to_token(
        &self,
        config: &PushConfig,
        token: &PushToken,
        payload: &PushPayload,
    ) -> TokenDeliveryResult {
        let outcome = with_timeout(ChannelType::Push, config.timeout_ms, async {
            self.transport
                .send(&token.token, token.platform, payload)
                .await
                .map_err(|e| NotifyError::Transport {
                    code: match &e {
                        PushProviderError::Unregistered => "TOKEN_UNREGISTERED".to_string(),
                        PushProviderError::InvalidToken => "TOKEN_INVALID".to_string(),
                        PushProviderError::PayloadTooLarge => "PAYLOAD_TOO_LARGE".to_string(),
                        PushProviderError::RateLimited => "PROVIDER_RATE_LIMITED".to_string(),
                        PushProviderError::Unavailable(_) => "PROVIDER_UNAVAILABLE".to_string(),
                    },
                    message: e.to_string(),
                    permanent: e.should_remove_token(),
                })
        })
        .await;

        match outcome {
            Ok(message_id) => {
                if let Err(e) = self.registry.record_success(&token.token).await {
                    warn!(error = %e, "token 成功状态更新失败");
                }
                TokenDeliveryResult {
                    token: mask_token(&token.token),
                    platform: token.platform.to_string(),
                    success: true,
                    provider_message_id: Some(message_id),
                    error: None,
                }
            }
            Err(err) => {
                // 永久无效立即禁用；瞬时失败累计，达到阈值后禁用
                let remove = err.is_permanent();
                if let Err(e) = self
                    .registry
                    .record_failure(&token.token, &err.code(), remove)
                    .await
                {
                    warn!(error = %e, "token 失败状态更新失败");
                }
                TokenDeliveryResult {
                    token: mask_token(&token.token),
                    platform: token.platform.to_string(),
                    success: false,
                    provider_message_id: None,
                    error: Some(DeliveryError::from(&err)),
                }
            }
        }
    }

    /// 对一组 token 并发扇出（调用方负责分批）
    async fn fan_out(
        &self,
        config: &PushConfig,
        tokens: &[PushToken],
        payload: &PushPayload,
    ) -> Vec<TokenDeliveryResult> {
        let futures: Vec<_> = tokens
            .iter()
            .map(|token| self.send_to_token(config, token, payload))
            .collect();
        join_all(futures).await
    }

    async fn deliver(
        &self,
        notification: &Notification,
        options: &SendOptions,
        start: Instant,
    ) -> Result<DeliveryResult> {
        let config = self.config.load_full();

        if !config.enabled {
            return Err(NotifyError::Configuration("Push 渠道已禁用".to_string()));
        }
        if notification.is_expired(Utc::now()) {
            return Err(NotifyError::Validation("通知已过期".to_string()));
        }

        let user_id = notification.user_id.as_str();

        // 限流（快速失败，不产生任何部分发送）
        let windows = [RateWindow::per_recipient(
            "recipient_minute",
            config.per_recipient_minute_limit,
            60,
        )];
        if let Err(err) = self
            .runtime
            .limiter
            .check(ChannelType::Push, &windows, user_id)
            .await
        {
            if matches!(err, NotifyError::RateLimited { .. }) {
                self.runtime.events.publish(EngineEvent::RateLimited {
                    channel: ChannelType::Push,
                    scope: err.code(),
                    timestamp: Utc::now(),
                });
            }
            return Err(err);
        }

        // 推送的收件人标识就是 user_id
        if self
            .runtime
            .suppression
            .is_suppressed(ChannelType::Push, user_id)
            .await?
        {
            let reason = self
                .runtime
                .suppression
                .entry(ChannelType::Push, user_id)
                .await?
                .map(|e| e.reason.as_str().to_string())
                .unwrap_or_else(|| SuppressionReason::ManualBlock.as_str().to_string());
            self.runtime.events.publish(EngineEvent::Suppressed {
                channel: ChannelType::Push,
                recipient_key: user_id.to_string(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return Err(NotifyError::Suppressed {
                channel: "push".to_string(),
                reason,
            });
        }

        let tokens = self.registry.enabled_tokens(user_id).await?;
        if tokens.is_empty() {
            return Err(NotifyError::AddressUnresolvable {
                user_id: user_id.to_string(),
                channel: "push".to_string(),
            });
        }

        let (title, body) = self.render_content(notification, options).await?;
        let payload = self.build_payload(&config, notification, title, body);

        // 按平台分组后逐组并发扇出（同平台可走服务商的 multicast 接口）
        let mut by_platform: HashMap<PushPlatform, Vec<PushToken>> = HashMap::new();
        for token in tokens {
            by_platform.entry(token.platform).or_default().push(token);
        }

        let mut token_results = Vec::new();
        for (platform, group) in by_platform {
            debug!(platform = %platform, count = group.len(), "按平台扇出推送");
            token_results.extend(self.fan_out(&config, &group, &payload).await);
        }

        let total = token_results.len();
        let delivered = token_results.iter().filter(|r| r.success).count();
        let failed = total - delivered;

        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Sent, total as u64)
            .await?;
        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Delivered, delivered as u64)
            .await?;
        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Failed, failed as u64)
            .await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let provider_message_id = token_results
            .iter()
            .find_map(|r| r.provider_message_id.clone());
        let detail = DeliveryDetail::Push {
            total,
            delivered,
            failed,
            token_results,
        };

        // 任一 token 送达即视为本次投递成功
        let result = if delivered > 0 {
            DeliveryResult::delivered(
                notification.notification_id.clone(),
                ChannelType::Push,
                1,
                provider_message_id,
                duration_ms,
            )
        } else {
            DeliveryResult::failed(
                notification.notification_id.clone(),
                ChannelType::Push,
                1,
                DeliveryError::new(
                    "ALL_TOKENS_FAILED",
                    format!("{} 个设备 token 全部发送失败", total),
                    false,
                    true,
                ),
                duration_ms,
            )
        };
        Ok(result.with_detail(detail))
    }

    /// 跨用户组播
    ///
    /// 用户去重后逐用户做抑制检查，把所有平台的启用 token 全局汇总，
    /// 再按配置的批次大小切分、批内并发发送。
    pub async fn send_multicast(
        &self,
        notification: &Notification,
        user_ids: &[String],
    ) -> Result<MulticastResult> {
        let config = self.config.load_full();
        if !config.enabled {
            return Err(NotifyError::Configuration("Push 渠道已禁用".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        let unique_users: Vec<&String> = user_ids.iter().filter(|u| seen.insert(*u)).collect();

        let mut suppressed_users = 0;
        let mut all_tokens: Vec<PushToken> = Vec::new();
        for user_id in &unique_users {
            if self
                .runtime
                .suppression
                .is_suppressed(ChannelType::Push, user_id)
                .await?
            {
                suppressed_users += 1;
                continue;
            }
            all_tokens.extend(self.registry.enabled_tokens(user_id).await?);
        }

        let (title, body) = self
            .render_content(notification, &SendOptions::default())
            .await?;
        let payload = self.build_payload(&config, notification, title, body);

        let mut token_results = Vec::with_capacity(all_tokens.len());
        for batch in all_tokens.chunks(config.multicast_batch_size) {
            token_results.extend(self.fan_out(&config, batch, &payload).await);
        }

        let total_tokens = token_results.len();
        let delivered = token_results.iter().filter(|r| r.success).count();
        let failed = total_tokens - delivered;

        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Sent, total_tokens as u64)
            .await?;
        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Delivered, delivered as u64)
            .await?;
        self.runtime
            .metrics
            .record_n(ChannelType::Push, MetricEvent::Failed, failed as u64)
            .await?;

        info!(
            total_users = unique_users.len(),
            suppressed_users,
            total_tokens,
            delivered,
            failed,
            "组播推送完成"
        );

        Ok(MulticastResult {
            total_users: unique_users.len(),
            suppressed_users,
            total_tokens,
            delivered,
            failed,
            token_results,
        })
    }
}

#[async_trait]
impl Channel for PushAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Push
    }

    fn name(&self) -> &str {
        "Push"
    }

    async fn send_notification(
        &self,
        notification: &Notification,
        options: &SendOptions,
    ) -> DeliveryResult {
        let start = Instant::now();

        let result = match self.deliver(notification, options, start).await {
            Ok(result) => result,
            Err(err) => {
                let metric = match &err {
                    NotifyError::RateLimited { .. } => MetricEvent::RateLimited,
                    NotifyError::Suppressed { .. } => MetricEvent::Suppressed,
                    _ => MetricEvent::Failed,
                };
                let _ = self.runtime.metrics.record(ChannelType::Push, metric).await;
                DeliveryResult::rejected(
                    notification.notification_id.clone(),
                    ChannelType::Push,
                    &err,
                )
            }
        };

        self.runtime.finalize(notification, result).await
    }

    async fn get_metrics(&self, period: MetricsPeriod) -> Result<ChannelMetrics> {
        self.runtime.metrics.snapshot(ChannelType::Push, period).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VariableTemplateRenderer;
    use notify_shared::events::EventBus;
    use notify_shared::store::MemoryStore;
    use std::time::Duration;

    const IOS_TOKEN: &str =
        "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn android_token(tag: &str) -> String {
        format!("android-{}-{}", tag, "x".repeat(40))
    }

    fn test_adapter() -> PushAdapter {
        PushAdapter::new(
            PushConfig::default(),
            ChannelRuntime::new(
                MemoryStore::shared(),
                EventBus::default(),
                Duration::from_secs(3600),
            ),
            Arc::new(VariableTemplateRenderer::new()),
            Arc::new(SimulatedPushTransport),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_to_all_enabled_tokens() {
        let adapter = test_adapter();
        adapter
            .registry()
            .register_token("u1", IOS_TOKEN, PushPlatform::Ios, "d1")
            .await
            .unwrap();
        adapter
            .registry()
            .register_token("u1", &android_token("ok"), PushPlatform::Android, "d2")
            .await
            .unwrap();

        let notification = Notification::new("u1", "alert", "提醒", "有新动态");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(result.success);
        match result.detail {
            DeliveryDetail::Push {
                total, delivered, ..
            } => {
                assert_eq!(total, 2);
                assert_eq!(delivered, 2);
            }
            other => panic!("期望 Push 明细，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_tokens_is_unresolvable() {
        let adapter = test_adapter();
        let notification = Notification::new("nobody", "alert", "提醒", "内容");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code(), Some("ADDRESS_UNRESOLVABLE"));
    }

    #[tokio::test]
    async fn test_unregistered_token_disabled_immediately() {
        let adapter = test_adapter();
        adapter
            .registry()
            .register_token("u1", &android_token("dead"), PushPlatform::Android, "d1")
            .await
            .unwrap();
        adapter
            .registry()
            .register_token("u1", &android_token("ok"), PushPlatform::Android, "d2")
            .await
            .unwrap();

        let notification = Notification::new("u1", "alert", "提醒", "内容");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        // 一个 token 失效，但另一个送达，整体成功
        assert!(result.success);
        match &result.detail {
            DeliveryDetail::Push {
                delivered, failed, ..
            } => {
                assert_eq!(*delivered, 1);
                assert_eq!(*failed, 1);
            }
            other => panic!("期望 Push 明细，实际: {:?}", other),
        }

        // 失效 token 被立即禁用，下次扇出只剩 1 个
        let enabled = adapter.registry().enabled_tokens("u1").await.unwrap();
        assert_eq!(enabled.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_counts_up() {
        let adapter = test_adapter();
        adapter
            .registry()
            .register_token("u1", &android_token("flaky"), PushPlatform::Android, "d1")
            .await
            .unwrap();

        let notification = Notification::new("u1", "alert", "提醒", "内容");

        // 阈值 5：前 4 次失败后仍启用
        for _ in 0..4 {
            let result = adapter
                .send_notification(&notification, &SendOptions::default())
                .await;
            assert!(!result.success);
            assert_eq!(result.error_code(), Some("ALL_TOKENS_FAILED"));
        }
        assert_eq!(adapter.registry().enabled_tokens("u1").await.unwrap().len(), 1);

        // 第 5 次达到阈值，token 被禁用
        adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(adapter.registry().enabled_tokens("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_carries_platform_options() {
        let adapter = test_adapter();
        let config = adapter.config.load_full();
        let notification = Notification::new("u1", "alert", "提醒", "内容")
            .with_data("subtitle", serde_json::json!("副标题"))
            .with_data("attachments", serde_json::json!(["https://cdn/a.png"]))
            .with_data("androidChannel", serde_json::json!("alerts"))
            .with_data("visibility", serde_json::json!("public"));
        let mut notification = notification;
        notification.metadata.icon = Some("bell".to_string());
        notification.metadata.sound = Some("ding".to_string());

        let payload =
            adapter.build_payload(&config, &notification, "标题".to_string(), "正文".to_string());

        assert_eq!(payload.ios.subtitle.as_deref(), Some("副标题"));
        assert_eq!(payload.ios.attachments.len(), 1);
        assert_eq!(payload.android.channel, "alerts");
        assert_eq!(payload.android.visibility.as_deref(), Some("public"));
        assert_eq!(payload.icon.as_deref(), Some("bell"));
        assert_eq!(payload.sound.as_deref(), Some("ding"));
    }

    #[tokio::test]
    async fn test_android_channel_falls_back_to_config() {
        let adapter = test_adapter();
        let config = adapter.config.load_full();
        let notification = Notification::new("u1", "alert", "提醒", "内容");

        let payload =
            adapter.build_payload(&config, &notification, "标题".to_string(), "正文".to_string());
        assert_eq!(payload.android.channel, "default");
    }

    #[tokio::test]
    async fn test_multicast_groups_across_users() {
        let adapter = test_adapter();
        adapter
            .registry()
            .register_token("u1", IOS_TOKEN, PushPlatform::Ios, "d1")
            .await
            .unwrap();
        adapter
            .registry()
            .register_token("u2", &android_token("u2"), PushPlatform::Android, "d2")
            .await
            .unwrap();
        adapter
            .registry()
            .register_token("u3", &android_token("u3"), PushPlatform::Android, "d3")
            .await
            .unwrap();

        let notification = Notification::new("-", "broadcast", "公告", "系统维护通知");
        // u2 重复出现，应去重
        let users = vec![
            "u1".to_string(),
            "u2".to_string(),
            "u2".to_string(),
            "u3".to_string(),
        ];
        let result = adapter.send_multicast(&notification, &users).await.unwrap();

        assert_eq!(result.total_users, 3);
        assert_eq!(result.total_tokens, 3);
        assert_eq!(result.delivered, 3);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_multicast_skips_suppressed_users() {
        let adapter = test_adapter();
        adapter
            .registry()
            .register_token("u1", IOS_TOKEN, PushPlatform::Ios, "d1")
            .await
            .unwrap();
        adapter
            .registry()
            .register_token("u2", &android_token("u2"), PushPlatform::Android, "d2")
            .await
            .unwrap();

        adapter
            .runtime
            .suppression
            .suppress(&crate::suppression::SuppressionEntry::new(
                ChannelType::Push,
                "u1",
                SuppressionReason::ManualBlock,
            ))
            .await
            .unwrap();

        let notification = Notification::new("-", "broadcast", "公告", "内容");
        let users = vec!["u1".to_string(), "u2".to_string()];
        let result = adapter.send_multicast(&notification, &users).await.unwrap();

        assert_eq!(result.suppressed_users, 1);
        assert_eq!(result.total_tokens, 1);
        assert_eq!(result.delivered, 1);
    }

    #[tokio::test]
    async fn test_recipient_rate_limit() {
        let adapter = PushAdapter::new(
            PushConfig {
                per_recipient_minute_limit: 1,
                ..PushConfig::default()
            },
            ChannelRuntime::new(
                MemoryStore::shared(),
                EventBus::default(),
                Duration::from_secs(3600),
            ),
            Arc::new(VariableTemplateRenderer::new()),
            Arc::new(SimulatedPushTransport),
        )
        .unwrap();
        adapter
            .registry()
            .register_token("u1", IOS_TOKEN, PushPlatform::Ios, "d1")
            .await
            .unwrap();

        let notification = Notification::new("u1", "alert", "提醒", "内容");
        let first = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(first.success);

        let second = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert_eq!(second.error_code(), Some("RATE_LIMITED"));
    }
}
