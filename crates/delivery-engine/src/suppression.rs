//! 抑制名单
//!
//! 按 (渠道, 收件人) 维护永不发送的名单：退订、硬退信、投诉、手动拉黑。
//! 任一原因的条目都会同时进入渠道的总拉黑集合，发送前的检查因此始终是
//! 一次 O(1) 的集合成员判断，与具体原因无关。
//!
//! 条目是粘性的：一旦写入，只有显式 opt-in 能解除。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::ChannelType;
use notify_shared::store::KeyValueStore;

use crate::keys::StoreKey;

/// 抑制原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    /// 收件人主动退订
    Unsubscribed,
    /// 硬退信（地址永久不可达）
    HardBounce,
    /// 投诉（标记为垃圾）
    Complaint,
    /// 运营手动拉黑
    ManualBlock,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::HardBounce => "hard_bounce",
            Self::Complaint => "complaint",
            Self::ManualBlock => "manual_block",
        }
    }
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 抑制条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionEntry {
    pub channel: ChannelType,
    /// 渠道内的收件人标识（小写邮箱 / 规范化手机号 / user_id）
    pub recipient_key: String,
    pub reason: SuppressionReason,
    pub timestamp: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(
        channel: ChannelType,
        recipient_key: impl Into<String>,
        reason: SuppressionReason,
    ) -> Self {
        Self {
            channel,
            recipient_key: recipient_key.into(),
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// 抑制名单存储
#[derive(Clone)]
pub struct SuppressionStore {
    store: Arc<dyn KeyValueStore>,
}

impl SuppressionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 收件人是否被抑制（发送路径上的唯一检查，O(1)）
    pub async fn is_suppressed(&self, channel: ChannelType, recipient_key: &str) -> Result<bool> {
        self.store
            .sismember(&StoreKey::suppression_all(channel), recipient_key)
            .await
    }

    /// 写入抑制条目
    ///
    /// 同时写入原因集合、总拉黑集合与条目详情。重复写入幂等，
    /// 后写的原因覆盖条目详情（保留最新一次的原因与时间）。
    pub async fn suppress(&self, entry: &SuppressionEntry) -> Result<()> {
        let serialized = serde_json::to_string(entry)
            .map_err(|e| NotifyError::Serialization(format!("抑制条目序列化失败: {}", e)))?;

        self.store
            .sadd(
                &StoreKey::suppression_reason(entry.channel, entry.reason.as_str()),
                &entry.recipient_key,
            )
            .await?;
        self.store
            .sadd(&StoreKey::suppression_all(entry.channel), &entry.recipient_key)
            .await?;
        self.store
            .set(
                &StoreKey::suppression_entry(entry.channel, &entry.recipient_key),
                &serialized,
                None,
            )
            .await?;

        info!(
            channel = %entry.channel,
            recipient_key = %entry.recipient_key,
            reason = %entry.reason,
            "收件人已加入抑制名单"
        );
        Ok(())
    }

    /// 解除抑制（唯一的解除路径：显式 opt-in）
    ///
    /// 返回是否确有条目被移除。
    pub async fn opt_in(&self, channel: ChannelType, recipient_key: &str) -> Result<bool> {
        let existed = self
            .store
            .srem(&StoreKey::suppression_all(channel), recipient_key)
            .await?;

        for reason in [
            SuppressionReason::Unsubscribed,
            SuppressionReason::HardBounce,
            SuppressionReason::Complaint,
            SuppressionReason::ManualBlock,
        ] {
            self.store
                .srem(
                    &StoreKey::suppression_reason(channel, reason.as_str()),
                    recipient_key,
                )
                .await?;
        }
        self.store
            .delete(&StoreKey::suppression_entry(channel, recipient_key))
            .await?;

        if existed {
            info!(
                channel = %channel,
                recipient_key = %recipient_key,
                "收件人已解除抑制"
            );
        }
        Ok(existed)
    }

    /// 读取抑制条目详情
    pub async fn entry(
        &self,
        channel: ChannelType,
        recipient_key: &str,
    ) -> Result<Option<SuppressionEntry>> {
        let raw = self
            .store
            .get(&StoreKey::suppression_entry(channel, recipient_key))
            .await?;
        match raw {
            Some(raw) => {
                let entry = serde_json::from_str(&raw)
                    .map_err(|e| NotifyError::Serialization(format!("抑制条目解析失败: {}", e)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// 某一原因下的收件人列表（运营排查用）
    pub async fn list_by_reason(
        &self,
        channel: ChannelType,
        reason: SuppressionReason,
    ) -> Result<Vec<String>> {
        self.store
            .smembers(&StoreKey::suppression_reason(channel, reason.as_str()))
            .await
    }
}

/// 静态名单模式匹配
///
/// 模式以 `@` 开头时按域名后缀匹配（`@example.com` 匹配该域的所有地址），
/// 否则做大小写不敏感的精确匹配。
pub fn matches_pattern(recipient: &str, pattern: &str) -> bool {
    let recipient = recipient.to_lowercase();
    let pattern = pattern.to_lowercase();
    if let Some(domain) = pattern.strip_prefix('@') {
        recipient
            .rsplit_once('@')
            .map(|(_, d)| d == domain)
            .unwrap_or(false)
    } else {
        recipient == pattern
    }
}

/// 依据静态黑白名单判定收件人是否可发
///
/// 白名单非空时仅匹配者可发；黑名单命中直接拒绝。黑名单优先。
pub fn allowed_by_patterns(recipient: &str, blocklist: &[String], allowlist: &[String]) -> bool {
    if blocklist.iter().any(|p| matches_pattern(recipient, p)) {
        return false;
    }
    if !allowlist.is_empty() {
        return allowlist.iter().any(|p| matches_pattern(recipient, p));
    }
    true
}
