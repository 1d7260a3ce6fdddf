//! 推送 token 注册表
//!
//! 维护用户设备 token 的全生命周期：按 token 值去重注册、单用户上限
//! 淘汰、失败计数与禁用、长期未使用清扫。token 记录按 token 值索引，
//! 用户维度用按注册时间排序的有序集合维护，淘汰最旧即取 score 最小者。
//!
//! 并发语义：对同一 token 的注册 / 失败更新是对单条当前记录的
//! 读-改-写，字段级 last-writer-wins；注册表不做多写合并。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{EngineEvent, EventBus};
use notify_shared::store::KeyValueStore;

use crate::keys::StoreKey;

/// 推送平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Ios,
    Android,
    Web,
}

impl PushPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
        }
    }
}

impl std::fmt::Display for PushPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备 token 记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub token: String,
    pub platform: PushPlatform,
    pub device_id: String,
    pub user_id: String,
    /// 禁用的 token 保留记录但被所有发送排除
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

/// token 形状校验
///
/// iOS 为定长 64 位十六进制；Android / Web 采用最短长度启发式
/// （FCM 注册 token 与 Web Push endpoint 都远长于 32 字符）。
pub fn validate_token_shape(token: &str, platform: PushPlatform) -> Result<()> {
    let valid = match platform {
        PushPlatform::Ios => token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()),
        PushPlatform::Android | PushPlatform::Web => {
            token.len() >= 32 && !token.chars().any(char::is_whitespace)
        }
    };
    if valid {
        Ok(())
    } else {
        Err(NotifyError::InvalidArgument {
            field: "token".to_string(),
            message: format!("不符合 {} 平台的 token 形状", platform),
        })
    }
}

/// 推送 token 注册表
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    /// 单用户 token 上限
    max_tokens_per_user: usize,
    /// 连续失败禁用阈值
    failure_threshold: u32,
}

impl TokenRegistry {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
        max_tokens_per_user: usize,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            events,
            max_tokens_per_user,
            failure_threshold,
        }
    }

    async fn load(&self, token: &str) -> Result<Option<PushToken>> {
        let raw = self.store.get(&StoreKey::push_token(token)).await?;
        match raw {
            Some(raw) => {
                let record = serde_json::from_str(&raw)
                    .map_err(|e| NotifyError::Serialization(format!("token 记录解析失败: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &PushToken) -> Result<()> {
        let serialized = serde_json::to_string(record)
            .map_err(|e| NotifyError::Serialization(format!("token 记录序列化失败: {}", e)))?;
        self.store
            .set(&StoreKey::push_token(&record.token), &serialized, None)
            .await
    }

    /// 注册设备 token（按 token 值 upsert）
    ///
    /// 已存在的 token 刷新归属与时间戳而不是新建记录；换绑用户时从旧
    /// 用户的集合摘除。重新注册视为设备侧的有效性证明：重置失败计数
    /// 并重新启用。
    pub async fn register_token(
        &self,
        user_id: &str,
        token: &str,
        platform: PushPlatform,
        device_id: &str,
    ) -> Result<PushToken> {
        validate_token_shape(token, platform)?;

        let now = Utc::now();
        let existing = self.load(token).await?;
        let refreshed = existing.is_some();

        let record = match existing {
            Some(mut record) => {
                if record.user_id != user_id {
                    // 设备换绑：从旧用户的集合摘除
                    self.store
                        .zrem(&StoreKey::push_user_tokens(&record.user_id), token)
                        .await?;
                }
                record.user_id = user_id.to_string();
                record.device_id = device_id.to_string();
                record.platform = platform;
                record.enabled = true;
                record.failure_count = 0;
                record.last_failure_reason = None;
                record.updated_at = now;
                record
            }
            None => PushToken {
                token: token.to_string(),
                platform,
                device_id: device_id.to_string(),
                user_id: user_id.to_string(),
                enabled: true,
                created_at: now,
                updated_at: now,
                last_used_at: None,
                failure_count: 0,
                last_failure_reason: None,
            },
        };

        self.save(&record).await?;
        self.store
            .zadd(
                &StoreKey::push_user_tokens(user_id),
                token,
                record.created_at.timestamp() as f64,
            )
            .await?;
        self.store
            .zadd(&StoreKey::push_last_used(), token, now.timestamp() as f64)
            .await?;

        self.enforce_token_cap(user_id).await?;

        metrics::counter!(
            "notify_tokens_registered_total",
            "platform" => platform.as_str(),
        )
        .increment(1);
        self.events.publish(EngineEvent::TokenRegistered {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            refreshed,
            timestamp: now,
        });

        debug!(
            user_id = %user_id,
            platform = %platform,
            refreshed,
            "设备 token 已注册"
        );
        Ok(record)
    }

    /// 超出上限时淘汰最旧的 token
    async fn enforce_token_cap(&self, user_id: &str) -> Result<()> {
        let key = StoreKey::push_user_tokens(user_id);
        let count = self.store.zcard(&key).await? as usize;
        if count <= self.max_tokens_per_user {
            return Ok(());
        }

        let surplus = count - self.max_tokens_per_user;
        let oldest = self.store.zrange_asc(&key, 0, surplus as isize - 1).await?;
        for token in oldest {
            let platform = self
                .load(&token)
                .await?
                .map(|r| r.platform.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.remove_token(user_id, &token).await?;

            info!(user_id = %user_id, "超出 token 上限，最旧 token 已淘汰");
            self.events.publish(EngineEvent::TokenEvicted {
                user_id: user_id.to_string(),
                platform,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// 彻底移除 token（淘汰 / 清扫路径）
    pub async fn remove_token(&self, user_id: &str, token: &str) -> Result<()> {
        self.store
            .zrem(&StoreKey::push_user_tokens(user_id), token)
            .await?;
        self.store.zrem(&StoreKey::push_last_used(), token).await?;
        self.store.delete(&StoreKey::push_token(token)).await?;
        Ok(())
    }

    /// 用户当前启用的 token 列表（发送扇出的输入）
    pub async fn enabled_tokens(&self, user_id: &str) -> Result<Vec<PushToken>> {
        let tokens = self
            .store
            .zrange_desc(&StoreKey::push_user_tokens(user_id), 0, -1)
            .await?;

        let mut records = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(record) = self.load(&token).await?
                && record.enabled
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// 用户当前持有的 token 总数（含禁用）
    pub async fn token_count(&self, user_id: &str) -> Result<u64> {
        self.store
            .zcard(&StoreKey::push_user_tokens(user_id))
            .await
    }

    /// 记录一次发送成功：失败计数清零并刷新最后使用时间
    pub async fn record_success(&self, token: &str) -> Result<()> {
        let Some(mut record) = self.load(token).await? else {
            return Ok(());
        };
        let now = Utc::now();
        record.failure_count = 0;
        record.last_failure_reason = None;
        record.last_used_at = Some(now);
        record.updated_at = now;
        self.save(&record).await?;
        self.store
            .zadd(&StoreKey::push_last_used(), token, now.timestamp() as f64)
            .await?;
        Ok(())
    }

    /// 记录一次发送失败
    ///
    /// `remove` 为 true（永久无效的注册）时立即禁用，不论失败计数；
    /// 否则递增计数，达到阈值后禁用。禁用是软删除——记录保留，
    /// 被所有后续发送排除。
    pub async fn record_failure(&self, token: &str, reason: &str, remove: bool) -> Result<()> {
        let Some(mut record) = self.load(token).await? else {
            return Ok(());
        };

        record.failure_count += 1;
        record.last_failure_reason = Some(reason.to_string());
        record.updated_at = Utc::now();

        let should_disable = remove || record.failure_count >= self.failure_threshold;
        if should_disable && record.enabled {
            record.enabled = false;
            warn!(
                user_id = %record.user_id,
                platform = %record.platform,
                failure_count = record.failure_count,
                reason = reason,
                "token 已禁用"
            );
            metrics::counter!(
                "notify_tokens_disabled_total",
                "platform" => record.platform.as_str(),
            )
            .increment(1);
            self.events.publish(EngineEvent::TokenDisabled {
                user_id: record.user_id.clone(),
                platform: record.platform.to_string(),
                reason: reason.to_string(),
                timestamp: record.updated_at,
            });
        }

        self.save(&record).await
    }

    /// 清扫超过保留期未使用的 token
    ///
    /// 以最后使用时间为准（从未发送过的 token 以注册时间计入活跃索引，
    /// 同样可被清扫）。返回清扫数量。
    pub async fn purge_stale(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = (Utc::now() - retention).timestamp() as f64;
        let stale = self
            .store
            .zrangebyscore(&StoreKey::push_last_used(), f64::MIN, cutoff)
            .await?;

        let mut purged = 0;
        for token in stale {
            if let Some(record) = self.load(&token).await? {
                self.remove_token(&record.user_id, &token).await?;
                purged += 1;
            } else {
                self.store.zrem(&StoreKey::push_last_used(), &token).await?;
            }
        }

        if purged > 0 {
            info!(purged, "过期 token 清扫完成");
        }
        Ok(purged)
    }
}
