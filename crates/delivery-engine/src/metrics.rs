//! 投递指标聚合
//!
//! 按渠道维护运行计数（发送 / 送达 / 退信 / 打开……），以哈希快照
//! 持久化在键值存储上，每次状态变更事件原子自增一次；派生比率
//! （送达率、退信率）在读取时重新计算，不落盘。
//!
//! 同时向 metrics facade 上报同名计数器，宿主服务安装 recorder 后
//! 即可在 Prometheus 等后端看到。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use notify_shared::error::Result;
use notify_shared::events::ChannelType;
use notify_shared::store::KeyValueStore;

use crate::keys::StoreKey;

/// 指标事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// 发起传输（含重试整体计一次）
    Sent,
    /// 传输确认接收
    Delivered,
    /// 传输失败
    Failed,
    /// 硬退信
    Bounced,
    /// 软退信
    SoftBounced,
    /// 投诉
    Complained,
    /// 打开（邮件追踪）
    Opened,
    /// 点击（邮件追踪）
    Clicked,
    /// 被抑制名单拦截
    Suppressed,
    /// 被限流拦截
    RateLimited,
    /// 已读（站内信）
    Read,
    /// 已删除（站内信）
    Dismissed,
}

impl MetricEvent {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::SoftBounced => "soft_bounced",
            Self::Complained => "complained",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Suppressed => "suppressed",
            Self::RateLimited => "rate_limited",
            Self::Read => "read",
            Self::Dismissed => "dismissed",
        }
    }
}

/// 指标查询周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsPeriod {
    /// 渠道生命周期累计
    #[default]
    Lifetime,
    /// 指定自然日（UTC）
    Day(NaiveDate),
}

/// 渠道指标快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetrics {
    pub channel: Option<ChannelType>,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub bounced: u64,
    pub soft_bounced: u64,
    pub complained: u64,
    pub opened: u64,
    pub clicked: u64,
    pub suppressed: u64,
    pub rate_limited: u64,
    pub read: u64,
    pub dismissed: u64,
    /// 送达率 = delivered / sent（读取时计算）
    pub delivery_rate: f64,
    /// 退信率 = bounced / sent
    pub bounce_rate: f64,
    /// 失败率 = failed / sent
    pub failure_rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self {
            channel: None,
            sent: 0,
            delivered: 0,
            failed: 0,
            bounced: 0,
            soft_bounced: 0,
            complained: 0,
            opened: 0,
            clicked: 0,
            suppressed: 0,
            rate_limited: 0,
            read: 0,
            dismissed: 0,
            delivery_rate: 0.0,
            bounce_rate: 0.0,
            failure_rate: 0.0,
            updated_at: Utc::now(),
        }
    }
}

impl ChannelMetrics {
    fn from_fields(channel: ChannelType, fields: &HashMap<String, String>) -> Self {
        let read_field = |name: &str| -> u64 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        let mut snapshot = Self {
            channel: Some(channel),
            sent: read_field("sent"),
            delivered: read_field("delivered"),
            failed: read_field("failed"),
            bounced: read_field("bounced"),
            soft_bounced: read_field("soft_bounced"),
            complained: read_field("complained"),
            opened: read_field("opened"),
            clicked: read_field("clicked"),
            suppressed: read_field("suppressed"),
            rate_limited: read_field("rate_limited"),
            read: read_field("read"),
            dismissed: read_field("dismissed"),
            updated_at: Utc::now(),
            ..Self::default()
        };
        snapshot.recompute_rates();
        snapshot
    }

    fn recompute_rates(&mut self) {
        if self.sent > 0 {
            self.delivery_rate = self.delivered as f64 / self.sent as f64;
            self.bounce_rate = self.bounced as f64 / self.sent as f64;
            self.failure_rate = self.failed as f64 / self.sent as f64;
        } else {
            self.delivery_rate = 0.0;
            self.bounce_rate = 0.0;
            self.failure_rate = 0.0;
        }
    }
}

/// 指标聚合器
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn KeyValueStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 记录一次指标事件
    ///
    /// 同时写入累计快照与当日快照（当日键保留 90 天）。
    pub async fn record(&self, channel: ChannelType, event: MetricEvent) -> Result<()> {
        self.record_n(channel, event, 1).await
    }

    /// 记录 N 次指标事件（push 逐 token 计数时使用）
    pub async fn record_n(&self, channel: ChannelType, event: MetricEvent, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let field = event.field();

        self.store
            .hincr(&StoreKey::metrics(channel), field, n as i64)
            .await?;

        let day_key = StoreKey::metrics_day(channel, Utc::now().date_naive());
        self.store.hincr(&day_key, field, n as i64).await?;
        self.store
            .expire(&day_key, std::time::Duration::from_secs(90 * 24 * 3600))
            .await?;

        metrics::counter!(
            "notify_deliveries_total",
            "channel" => channel.as_str(),
            "outcome" => field,
        )
        .increment(n);

        Ok(())
    }

    /// 读取渠道指标快照，派生比率即时计算
    pub async fn snapshot(
        &self,
        channel: ChannelType,
        period: MetricsPeriod,
    ) -> Result<ChannelMetrics> {
        let key = match period {
            MetricsPeriod::Lifetime => StoreKey::metrics(channel),
            MetricsPeriod::Day(date) => StoreKey::metrics_day(channel, date),
        };
        let fields = self.store.hgetall(&key).await?;
        Ok(ChannelMetrics::from_fields(channel, &fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::store::MemoryStore;

    fn test_metrics() -> MetricsAggregator {
        MetricsAggregator::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn test_record_and_snapshot() {
        let metrics = test_metrics();

        for _ in 0..4 {
            metrics
                .record(ChannelType::Email, MetricEvent::Sent)
                .await
                .unwrap();
        }
        for _ in 0..3 {
            metrics
                .record(ChannelType::Email, MetricEvent::Delivered)
                .await
                .unwrap();
        }
        metrics
            .record(ChannelType::Email, MetricEvent::Bounced)
            .await
            .unwrap();

        let snapshot = metrics
            .snapshot(ChannelType::Email, MetricsPeriod::Lifetime)
            .await
            .unwrap();
        assert_eq!(snapshot.sent, 4);
        assert_eq!(snapshot.delivered, 3);
        assert_eq!(snapshot.bounced, 1);
        assert!((snapshot.delivery_rate - 0.75).abs() < f64::EPSILON);
        assert!((snapshot.bounce_rate - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_snapshot_has_zero_rates() {
        let metrics = test_metrics();
        let snapshot = metrics
            .snapshot(ChannelType::Push, MetricsPeriod::Lifetime)
            .await
            .unwrap();

        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.delivery_rate, 0.0);
    }

    #[tokio::test]
    async fn test_daily_snapshot_tracks_today() {
        let metrics = test_metrics();
        metrics
            .record_n(ChannelType::Sms, MetricEvent::Sent, 5)
            .await
            .unwrap();

        let today = metrics
            .snapshot(
                ChannelType::Sms,
                MetricsPeriod::Day(Utc::now().date_naive()),
            )
            .await
            .unwrap();
        assert_eq!(today.sent, 5);

        let other_day = metrics
            .snapshot(
                ChannelType::Sms,
                MetricsPeriod::Day(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(other_day.sent, 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let metrics = test_metrics();
        metrics
            .record(ChannelType::Email, MetricEvent::Sent)
            .await
            .unwrap();

        let sms = metrics
            .snapshot(ChannelType::Sms, MetricsPeriod::Lifetime)
            .await
            .unwrap();
        assert_eq!(sms.sent, 0);
    }
}
