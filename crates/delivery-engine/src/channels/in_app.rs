//! 站内信通知渠道
//!
//! 双路径投递：优先尝试实时下发（用户有活跃连接时直接推事件），
//! 实时成功且未配置强制落库时跳过持久化，否则写入用户的站内信集合。
//! 任一路径成功即视为投递成功。
//!
//! 持久化形态：按用户一份按创建时间排序的集合（新的在前），
//! 超出单用户上限淘汰最旧；未读数与角标数维护为独立的快路径计数器，
//! 从不通过扫全表重算。周期清扫移除已过期的条目并同步修正计数。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{ChannelType, EngineEvent};

use super::{Channel, ChannelRuntime, SendOptions};
use crate::config::InAppConfig;
use crate::keys::StoreKey;
use crate::metrics::{ChannelMetrics, MetricEvent, MetricsPeriod};
use crate::rate_limit::RateWindow;
use crate::realtime::RealtimeTransport;
use crate::suppression::SuppressionReason;
use crate::template::{PersonalizationContext, TemplateRenderer};
use crate::types::{
    DeliveryDetail, DeliveryError, DeliveryResult, Notification, NotificationAction, Priority,
};

// ---------------------------------------------------------------------------
// 持久化模型
// ---------------------------------------------------------------------------

/// 持久化的站内信
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InAppNotification {
    pub notification_id: String,
    pub user_id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    /// 透传业务数据（下发客户端前经过脱敏）
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<DateTime<Utc>>,
}

/// 用户站内信查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotifications {
    /// 新的在前
    pub notifications: Vec<InAppNotification>,
    pub total: u64,
    pub unread: u64,
    pub badge: u64,
}

/// 下发客户端前的载荷脱敏
///
/// 递归剔除键名（大小写不敏感）包含敏感子串的字段。
/// 子串按包含匹配——`apiKey`、`refresh_token`、`authData` 都会被剔除。
pub fn sanitize_for_client(value: &serde_json::Value) -> serde_json::Value {
    const SENSITIVE: [&str; 5] = ["password", "token", "secret", "key", "auth"];

    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(name, _)| {
                    let lower = name.to_lowercase();
                    !SENSITIVE.iter().any(|needle| lower.contains(needle))
                })
                .map(|(name, inner)| (name.clone(), sanitize_for_client(inner)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_for_client).collect())
        }
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// InAppAdapter
// ---------------------------------------------------------------------------

/// 站内信通知渠道
pub struct InAppAdapter {
    config: ArcSwap<InAppConfig>,
    runtime: ChannelRuntime,
    renderer: Arc<dyn TemplateRenderer>,
    realtime: Arc<dyn RealtimeTransport>,
}

impl InAppAdapter {
    pub fn new(
        config: InAppConfig,
        runtime: ChannelRuntime,
        renderer: Arc<dyn TemplateRenderer>,
        realtime: Arc<dyn RealtimeTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            runtime,
            renderer,
            realtime,
        })
    }

    /// 替换渠道配置
    pub fn reconfigure(&self, config: InAppConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        info!("站内信渠道配置已更新");
        Ok(())
    }

    async fn load_item(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<Option<InAppNotification>> {
        let raw = self
            .runtime
            .store
            .hget(&StoreKey::inapp_items(user_id), notification_id)
            .await?;
        match raw {
            Some(raw) => {
                let item = serde_json::from_str(&raw)
                    .map_err(|e| NotifyError::Serialization(format!("站内信解析失败: {}", e)))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn save_item(&self, item: &InAppNotification) -> Result<()> {
        let serialized = serde_json::to_string(item)
            .map_err(|e| NotifyError::Serialization(format!("站内信序列化失败: {}", e)))?;
        self.runtime
            .store
            .hset(
                &StoreKey::inapp_items(&item.user_id),
                &item.notification_id,
                &serialized,
            )
            .await
    }

    /// 计数器自减并在 0 处截断
    ///
    /// 并发 read/dismiss 偶发的多减会把计数器带到负数，
    /// 这里直接归零——计数器是快路径近似值，集合本身才是事实来源。
    async fn decr_clamped(&self, key: &str) -> Result<()> {
        let value = self.runtime.store.incr(key, -1).await?;
        if value < 0 {
            self.runtime.store.set(key, "0", None).await?;
        }
        Ok(())
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        Ok(self
            .runtime
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.max(0) as u64)
            .unwrap_or(0))
    }

    /// 从索引、正文与过期索引中移除一条站内信；未读的同步修正计数
    async fn remove_item(&self, user_id: &str, item: &InAppNotification) -> Result<()> {
        self.runtime
            .store
            .zrem(&StoreKey::inapp_index(user_id), &item.notification_id)
            .await?;
        self.runtime
            .store
            .hdel(&StoreKey::inapp_items(user_id), &item.notification_id)
            .await?;
        self.runtime
            .store
            .zrem(
                &StoreKey::inapp_expiry(),
                &format!("{}:{}", user_id, item.notification_id),
            )
            .await?;
        if !item.read {
            self.decr_clamped(&StoreKey::inapp_unread(user_id)).await?;
            self.decr_clamped(&StoreKey::inapp_badge(user_id)).await?;
        }
        Ok(())
    }

    /// 持久化站内信并执行上限淘汰
    async fn persist(
        &self,
        config: &InAppConfig,
        item: &InAppNotification,
    ) -> Result<()> {
        let user_id = &item.user_id;

        self.save_item(item).await?;
        self.runtime
            .store
            .zadd(
                &StoreKey::inapp_index(user_id),
                &item.notification_id,
                item.created_at.timestamp_millis() as f64,
            )
            .await?;
        self.runtime
            .store
            .incr(&StoreKey::inapp_unread(user_id), 1)
            .await?;
        self.runtime
            .store
            .incr(&StoreKey::inapp_badge(user_id), 1)
            .await?;

        if let Some(expires_at) = item.expires_at {
            self.runtime
                .store
                .zadd(
                    &StoreKey::inapp_expiry(),
                    &format!("{}:{}", user_id, item.notification_id),
                    expires_at.timestamp_millis() as f64,
                )
                .await?;
        }

        // 超出单用户上限：淘汰最旧
        let count = self
            .runtime
            .store
            .zcard(&StoreKey::inapp_index(user_id))
            .await? as usize;
        if count > config.max_notifications_per_user {
            let surplus = count - config.max_notifications_per_user;
            let oldest = self
                .runtime
                .store
                .zrange_asc(&StoreKey::inapp_index(user_id), 0, surplus as isize - 1)
                .await?;
            for notification_id in oldest {
                if let Some(victim) = self.load_item(user_id, &notification_id).await? {
                    self.remove_item(user_id, &victim).await?;
                    debug!(
                        user_id = %user_id,
                        notification_id = %notification_id,
                        "超出站内信上限，最旧条目已淘汰"
                    );
                }
            }
        }

        Ok(())
    }

    async fn deliver(
        &self,
        notification: &Notification,
        options: &SendOptions,
        start: Instant,
    ) -> Result<DeliveryResult> {
        let config = self.config.load_full();

        if !config.enabled {
            return Err(NotifyError::Configuration("站内信渠道已禁用".to_string()));
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
            .check(ChannelType::InApp, &windows, user_id)
            .await
        {
            if matches!(err, NotifyError::RateLimited { .. }) {
                self.runtime.events.publish(EngineEvent::RateLimited {
                    channel: ChannelType::InApp,
                    scope: err.code(),
                    timestamp: Utc::now(),
                });
            }
            return Err(err);
        }

        if self
            .runtime
            .suppression
            .is_suppressed(ChannelType::InApp, user_id)
            .await?
        {
            let reason = self
                .runtime
                .suppression
                .entry(ChannelType::InApp, user_id)
                .await?
                .map(|e| e.reason.as_str().to_string())
                .unwrap_or_else(|| SuppressionReason::ManualBlock.as_str().to_string());
            self.runtime.events.publish(EngineEvent::Suppressed {
                channel: ChannelType::InApp,
                recipient_key: user_id.to_string(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return Err(NotifyError::Suppressed {
                channel: "in_app".to_string(),
                reason,
            });
        }

        // 渲染
        let (title, message) = if options.template
            && let Some(template_id) = &notification.metadata.template_id
        {
            let context = PersonalizationContext::new(
                user_id.to_string(),
                notification.metadata.extra.clone(),
            );
            let rendered = self
                .renderer
                .render(template_id, &context, ChannelType::InApp)
                .await?;
            (
                rendered.title.unwrap_or_else(|| notification.title.clone()),
                rendered.body,
            )
        } else {
            (notification.title.clone(), notification.message.clone())
        };

        let item = InAppNotification {
            notification_id: notification.notification_id.clone(),
            user_id: user_id.to_string(),
            notification_type: notification.notification_type.clone(),
            title,
            message,
            priority: notification.priority,
            icon: notification.metadata.icon.clone(),
            actions: notification.actions.clone(),
            data: notification.metadata.extra.clone(),
            created_at: notification.created_at,
            expires_at: notification.expires_at,
            read: false,
            read_at: None,
            dismissed: false,
            dismissed_at: None,
        };

        self.runtime
            .metrics
            .record(ChannelType::InApp, MetricEvent::Sent)
            .await?;

        // 路径一：实时下发（超时按瞬时失败处理）。失败只记录，不影响持久化路径。
        let mut realtime_ok = false;
        if config.realtime_enabled && self.realtime.is_user_connected(user_id).await {
            let payload = serde_json::to_value(&item)
                .map(|v| sanitize_for_client(&v))
                .map_err(|e| NotifyError::Serialization(format!("站内信序列化失败: {}", e)))?;
            let emit = super::with_timeout(
                ChannelType::InApp,
                config.timeout_ms,
                self.realtime.emit_to_user(user_id, "notification", payload),
            )
            .await;
            match emit {
                Ok(()) => realtime_ok = true,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "实时下发失败，回落到持久化");
                }
            }
        }

        // 路径二：持久化。实时成功且未强制落库时跳过。
        let mut persisted = false;
        let mut persist_err: Option<NotifyError> = None;
        if !realtime_ok || config.always_persist {
            match self.persist(&config, &item).await {
                Ok(()) => persisted = true,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "站内信持久化失败");
                    persist_err = Some(e);
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let detail = DeliveryDetail::InApp {
            realtime: realtime_ok,
            persisted,
        };

        // 任一路径成功即视为送达
        if realtime_ok || persisted {
            self.runtime
                .metrics
                .record(ChannelType::InApp, MetricEvent::Delivered)
                .await?;
            Ok(DeliveryResult::delivered(
                notification.notification_id.clone(),
                ChannelType::InApp,
                1,
                None,
                duration_ms,
            )
            .with_detail(detail))
        } else {
            self.runtime
                .metrics
                .record(ChannelType::InApp, MetricEvent::Failed)
                .await?;
            let err = persist_err.unwrap_or_else(|| {
                NotifyError::Internal("实时与持久化路径均不可用".to_string())
            });
            Ok(DeliveryResult::failed(
                notification.notification_id.clone(),
                ChannelType::InApp,
                1,
                DeliveryError::from(&err),
                duration_ms,
            )
            .with_detail(detail))
        }
    }

    // ==================== 查询与状态变更 ====================

    /// 查询用户站内信（新的在前，分页）
    pub async fn get_user_notifications(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<UserNotifications> {
        let limit = limit.max(1);
        let ids = self
            .runtime
            .store
            .zrange_desc(
                &StoreKey::inapp_index(user_id),
                offset as isize,
                (offset + limit - 1) as isize,
            )
            .await?;

        let mut notifications = Vec::with_capacity(ids.len());
        for notification_id in ids {
            if let Some(item) = self.load_item(user_id, &notification_id).await? {
                notifications.push(item);
            }
        }

        Ok(UserNotifications {
            notifications,
            total: self
                .runtime
                .store
                .zcard(&StoreKey::inapp_index(user_id))
                .await?,
            unread: self.counter(&StoreKey::inapp_unread(user_id)).await?,
            badge: self.counter(&StoreKey::inapp_badge(user_id)).await?,
        })
    }

    /// 标记单条已读
    ///
    /// 返回是否发生状态变化（不存在或已读返回 false）。
    pub async fn mark_as_read(&self, user_id: &str, notification_id: &str) -> Result<bool> {
        let Some(mut item) = self.load_item(user_id, notification_id).await? else {
            return Ok(false);
        };
        if item.read {
            return Ok(false);
        }

        item.read = true;
        item.read_at = Some(Utc::now());
        self.save_item(&item).await?;
        self.decr_clamped(&StoreKey::inapp_unread(user_id)).await?;
        self.decr_clamped(&StoreKey::inapp_badge(user_id)).await?;

        self.runtime
            .metrics
            .record(ChannelType::InApp, MetricEvent::Read)
            .await?;
        self.runtime.events.publish(EngineEvent::NotificationRead {
            user_id: user_id.to_string(),
            notification_id: notification_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// 全部标记已读，计数器直接归零
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let items = self
            .runtime
            .store
            .hgetall(&StoreKey::inapp_items(user_id))
            .await?;

        let mut updated = 0;
        let now = Utc::now();
        for raw in items.values() {
            let Ok(mut item) = serde_json::from_str::<InAppNotification>(raw) else {
                continue;
            };
            if !item.read {
                item.read = true;
                item.read_at = Some(now);
                self.save_item(&item).await?;
                updated += 1;
            }
        }

        self.runtime
            .store
            .set(&StoreKey::inapp_unread(user_id), "0", None)
            .await?;
        self.runtime
            .store
            .set(&StoreKey::inapp_badge(user_id), "0", None)
            .await?;

        self.runtime
            .metrics
            .record_n(ChannelType::InApp, MetricEvent::Read, updated)
            .await?;
        Ok(updated)
    }

    /// 删除单条（用户主动清除）
    ///
    /// 生命周期定义上 dismissed 即删除：条目被整体移除，
    /// 仅事件流中留下 dismissed 痕迹。
    pub async fn dismiss(&self, user_id: &str, notification_id: &str) -> Result<bool> {
        let Some(item) = self.load_item(user_id, notification_id).await? else {
            return Ok(false);
        };

        self.remove_item(user_id, &item).await?;

        self.runtime
            .metrics
            .record(ChannelType::InApp, MetricEvent::Dismissed)
            .await?;
        self.runtime
            .events
            .publish(EngineEvent::NotificationDismissed {
                user_id: user_id.to_string(),
                notification_id: notification_id.to_string(),
                timestamp: Utc::now(),
            });
        Ok(true)
    }

    /// 记录动作交互：命中的动作按钮回传，同时条目被标记已读
    pub async fn record_interaction(
        &self,
        user_id: &str,
        notification_id: &str,
        action: &str,
    ) -> Result<Option<NotificationAction>> {
        let Some(item) = self.load_item(user_id, notification_id).await? else {
            return Ok(None);
        };
        let matched = item.actions.iter().find(|a| a.action == action).cloned();
        if matched.is_some() {
            self.mark_as_read(user_id, notification_id).await?;
        }
        Ok(matched)
    }

    /// 清扫已过期的站内信
    ///
    /// 扫描全局过期索引中 score 不晚于当前时间的成员，逐条移除并
    /// 修正对应用户的计数。由宿主系统按固定周期驱动。
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis() as f64;
        let expired = self
            .runtime
            .store
            .zrangebyscore(&StoreKey::inapp_expiry(), f64::MIN, now)
            .await?;

        let mut swept = 0;
        for member in expired {
            // notification_id 是 UUID（不含冒号），从右侧切一次即可
            let Some((user_id, notification_id)) = member.rsplit_once(':') else {
                self.runtime
                    .store
                    .zrem(&StoreKey::inapp_expiry(), &member)
                    .await?;
                continue;
            };
            if let Some(item) = self.load_item(user_id, notification_id).await? {
                self.remove_item(user_id, &item).await?;
                swept += 1;
                self.runtime
                    .events
                    .publish(EngineEvent::NotificationExpired {
                        user_id: user_id.to_string(),
                        notification_id: notification_id.to_string(),
                        timestamp: Utc::now(),
                    });
            } else {
                self.runtime
                    .store
                    .zrem(&StoreKey::inapp_expiry(), &member)
                    .await?;
            }
        }

        if swept > 0 {
            info!(swept, "过期站内信清扫完成");
        }
        Ok(swept)
    }
}

#[async_trait]
impl Channel for InAppAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::InApp
    }

    fn name(&self) -> &str {
        "InApp"
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
                let _ = self.runtime.metrics.record(ChannelType::InApp, metric).await;
                DeliveryResult::rejected(
                    notification.notification_id.clone(),
                    ChannelType::InApp,
                    &err,
                )
            }
        };

        self.runtime.finalize(notification, result).await
    }

    async fn get_metrics(&self, period: MetricsPeriod) -> Result<ChannelMetrics> {
        self.runtime.metrics.snapshot(ChannelType::InApp, period).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::InMemoryRealtimeHub;
    use crate::template::VariableTemplateRenderer;
    use notify_shared::events::EventBus;
    use notify_shared::store::MemoryStore;
    use std::time::Duration;

    fn test_adapter_with(config: InAppConfig) -> (InAppAdapter, Arc<InMemoryRealtimeHub>) {
        let hub = Arc::new(InMemoryRealtimeHub::new());
        let adapter = InAppAdapter::new(
            config,
            ChannelRuntime::new(
                MemoryStore::shared(),
                EventBus::default(),
                Duration::from_secs(3600),
            ),
            Arc::new(VariableTemplateRenderer::new()),
            hub.clone(),
        )
        .unwrap();
        (adapter, hub)
    }

    fn test_adapter() -> (InAppAdapter, Arc<InMemoryRealtimeHub>) {
        test_adapter_with(InAppConfig::default())
    }

    #[tokio::test]
    async fn test_offline_user_gets_persisted_copy() {
        let (adapter, _hub) = test_adapter();
        let notification = Notification::new("u1", "order", "订单更新", "已发货");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(result.success);
        match result.detail {
            DeliveryDetail::InApp { realtime, persisted } => {
                assert!(!realtime);
                assert!(persisted);
            }
            other => panic!("期望 InApp 明细，实际: {:?}", other),
        }

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 1);
        assert_eq!(inbox.unread, 1);
        assert_eq!(inbox.badge, 1);
    }

    #[tokio::test]
    async fn test_realtime_success_skips_persistence_when_configured() {
        let (adapter, hub) = test_adapter_with(InAppConfig {
            always_persist: false,
            ..InAppConfig::default()
        });
        hub.connect("u1");

        let notification = Notification::new("u1", "chat", "新消息", "你好");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(result.success);
        match result.detail {
            DeliveryDetail::InApp { realtime, persisted } => {
                assert!(realtime);
                assert!(!persisted);
            }
            other => panic!("期望 InApp 明细，实际: {:?}", other),
        }
        assert_eq!(hub.emitted_events().len(), 1);

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 0);
    }

    #[tokio::test]
    async fn test_realtime_failure_falls_back_to_persistence() {
        let mut realtime = crate::realtime::MockRealtime::new();
        realtime.expect_is_user_connected().returning(|_| true);
        realtime
            .expect_emit_to_user()
            .returning(|_, _, _| Err(NotifyError::Internal("连接中断".to_string())));

        let adapter = InAppAdapter::new(
            InAppConfig {
                always_persist: false,
                ..InAppConfig::default()
            },
            ChannelRuntime::new(
                MemoryStore::shared(),
                EventBus::default(),
                Duration::from_secs(3600),
            ),
            Arc::new(VariableTemplateRenderer::new()),
            Arc::new(realtime),
        )
        .unwrap();

        let notification = Notification::new("u1", "t", "标题", "内容");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        // 实时路径失败，但持久化兜底，整体仍视为送达
        assert!(result.success);
        match result.detail {
            DeliveryDetail::InApp { realtime, persisted } => {
                assert!(!realtime);
                assert!(persisted);
            }
            other => panic!("期望 InApp 明细，实际: {:?}", other),
        }
        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 1);
    }

    #[tokio::test]
    async fn test_always_persist_keeps_copy_even_when_realtime_succeeds() {
        let (adapter, hub) = test_adapter();
        hub.connect("u1");

        let notification = Notification::new("u1", "chat", "新消息", "你好");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(result.success);
        match result.detail {
            DeliveryDetail::InApp { realtime, persisted } => {
                assert!(realtime);
                assert!(persisted);
            }
            other => panic!("期望 InApp 明细，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_realtime_payload_is_sanitized() {
        let (adapter, hub) = test_adapter();
        hub.connect("u1");

        let notification = Notification::new("u1", "security", "安全提醒", "检测到新登录")
            .with_data("apiKey", serde_json::json!("sk-123"))
            .with_data("refresh_token", serde_json::json!("rt-456"))
            .with_data("authContext", serde_json::json!({"ip": "1.2.3.4"}))
            .with_data("device", serde_json::json!({"name": "MacBook", "password": "x"}));

        adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        let events = hub.emitted_events();
        let payload = serde_json::to_string(&events[0].2).unwrap();
        assert!(!payload.contains("apiKey"));
        assert!(!payload.contains("sk-123"));
        assert!(!payload.contains("refresh_token"));
        assert!(!payload.contains("authContext"));
        assert!(!payload.contains("password"));
        // 非敏感字段保留（嵌套对象内部同样被递归处理）
        assert!(payload.contains("MacBook"));
    }

    #[tokio::test]
    async fn test_unread_and_badge_after_mark_all_read() {
        let (adapter, _hub) = test_adapter();

        for i in 0..5 {
            let notification =
                Notification::new("u1", "t", format!("标题 {}", i), "内容");
            assert!(
                adapter
                    .send_notification(&notification, &SendOptions::default())
                    .await
                    .success
            );
        }

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.unread, 5);
        assert_eq!(inbox.badge, 5);

        let updated = adapter.mark_all_read("u1").await.unwrap();
        assert_eq!(updated, 5);

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.unread, 0);
        assert_eq!(inbox.badge, 0);
        assert!(inbox.notifications.iter().all(|n| n.read));
    }

    #[tokio::test]
    async fn test_mark_as_read_decrements_once() {
        let (adapter, _hub) = test_adapter();
        let notification = Notification::new("u1", "t", "标题", "内容");
        adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(
            adapter
                .mark_as_read("u1", &notification.notification_id)
                .await
                .unwrap()
        );
        // 重复标记不再变化
        assert!(
            !adapter
                .mark_as_read("u1", &notification.notification_id)
                .await
                .unwrap()
        );

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.unread, 0);
        assert_eq!(inbox.total, 1);
    }

    #[tokio::test]
    async fn test_dismiss_removes_entry_and_fixes_counters() {
        let (adapter, _hub) = test_adapter();
        let notification = Notification::new("u1", "t", "标题", "内容");
        adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(
            adapter
                .dismiss("u1", &notification.notification_id)
                .await
                .unwrap()
        );
        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 0);
        assert_eq!(inbox.unread, 0);
        assert_eq!(inbox.badge, 0);

        // 再次删除返回 false
        assert!(
            !adapter
                .dismiss("u1", &notification.notification_id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_first() {
        let (adapter, _hub) = test_adapter_with(InAppConfig {
            max_notifications_per_user: 3,
            per_recipient_minute_limit: 0,
            ..InAppConfig::default()
        });

        let mut first_id = None;
        for i in 0..4 {
            let mut notification =
                Notification::new("u1", "t", format!("标题 {}", i), "内容");
            // 人工拉开创建时间，保证排序稳定
            notification.created_at = Utc::now() - chrono::Duration::seconds(100 - i);
            if i == 0 {
                first_id = Some(notification.notification_id.clone());
            }
            adapter
                .send_notification(&notification, &SendOptions::default())
                .await;
        }

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 3);
        // 未读计数跟随淘汰修正
        assert_eq!(inbox.unread, 3);
        assert!(
            !inbox
                .notifications
                .iter()
                .any(|n| Some(&n.notification_id) == first_id.as_ref())
        );
        // 新的在前
        assert_eq!(inbox.notifications[0].title, "标题 3");
    }

    #[tokio::test]
    async fn test_sweep_expired_updates_counters() {
        let (adapter, _hub) = test_adapter();

        let expired = Notification::new("u1", "t", "过期", "内容")
            .with_expires_at(Utc::now() - chrono::Duration::seconds(5));
        // 绕过入口的过期拦截，直接写入一条已到期的站内信
        let config = adapter.config.load_full();
        let item = InAppNotification {
            notification_id: expired.notification_id.clone(),
            user_id: "u1".to_string(),
            notification_type: "t".to_string(),
            title: "过期".to_string(),
            message: "内容".to_string(),
            priority: Priority::Normal,
            icon: None,
            actions: Vec::new(),
            data: HashMap::new(),
            created_at: Utc::now() - chrono::Duration::minutes(10),
            expires_at: expired.expires_at,
            read: false,
            read_at: None,
            dismissed: false,
            dismissed_at: None,
        };
        adapter.persist(&config, &item).await.unwrap();

        let alive = Notification::new("u1", "t", "存活", "内容")
            .with_expires_at(Utc::now() + chrono::Duration::hours(1));
        adapter
            .send_notification(&alive, &SendOptions::default())
            .await;

        let swept = adapter.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.total, 1);
        assert_eq!(inbox.unread, 1);
        assert_eq!(inbox.notifications[0].title, "存活");
    }

    #[tokio::test]
    async fn test_record_interaction_marks_read() {
        let (adapter, _hub) = test_adapter();
        let notification = Notification::new("u1", "t", "标题", "内容").with_action(
            NotificationAction {
                action: "approve".to_string(),
                label: "同意".to_string(),
                icon: None,
                primary: true,
            },
        );
        adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        let matched = adapter
            .record_interaction("u1", &notification.notification_id, "approve")
            .await
            .unwrap();
        assert_eq!(matched.unwrap().label, "同意");

        let inbox = adapter.get_user_notifications("u1", 0, 10).await.unwrap();
        assert_eq!(inbox.unread, 0);

        // 未知动作不改状态
        let missing = adapter
            .record_interaction("u1", &notification.notification_id, "reject")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_sanitize_strips_sensitive_keys_recursively() {
        let value = serde_json::json!({
            "title": "ok",
            "Password": "p",
            "apiKey": "k",
            "nested": {"accessToken": "t", "kept": 1},
            "list": [{"secretValue": 2, "fine": 3}]
        });

        let sanitized = sanitize_for_client(&value);
        let text = serde_json::to_string(&sanitized).unwrap();

        assert!(!text.contains("Password"));
        assert!(!text.contains("apiKey"));
        assert!(!text.contains("accessToken"));
        assert!(!text.contains("secretValue"));
        assert!(text.contains("kept"));
        assert!(text.contains("fine"));
        assert!(text.contains("ok"));
    }
}
