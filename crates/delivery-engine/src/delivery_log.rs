//! 投递记录
//!
//! 每次 send 调用的最终结果按 (渠道, 通知 ID) 落盘，带有界保留时长，
//! 供调用方查询投递状态与问题排查。记录写入失败只告警不阻断——
//! 投递结果已经返回给调用方，记录是旁路。

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::ChannelType;
use notify_shared::store::KeyValueStore;

use crate::keys::StoreKey;
use crate::types::DeliveryResult;

/// 投递记录存储
#[derive(Clone)]
pub struct DeliveryLog {
    store: Arc<dyn KeyValueStore>,
    /// 默认保留时长
    retention: Duration,
}

impl DeliveryLog {
    pub fn new(store: Arc<dyn KeyValueStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// 写入投递记录
    ///
    /// `ttl_override` 来自通知元数据的 ttl_secs，允许单条覆盖保留时长。
    pub async fn record(&self, result: &DeliveryResult, ttl_override: Option<u64>) {
        let ttl = ttl_override
            .map(Duration::from_secs)
            .unwrap_or(self.retention);

        let serialized = match serde_json::to_string(result) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "投递记录序列化失败，跳过写入");
                return;
            }
        };

        let key = StoreKey::delivery_record(result.channel, &result.notification_id);
        if let Err(e) = self.store.set(&key, &serialized, Some(ttl)).await {
            warn!(
                notification_id = %result.notification_id,
                error = %e,
                "投递记录写入失败"
            );
        }
    }

    /// 查询投递记录
    pub async fn get(
        &self,
        channel: ChannelType,
        notification_id: &str,
    ) -> Result<Option<DeliveryResult>> {
        let raw = self
            .store
            .get(&StoreKey::delivery_record(channel, notification_id))
            .await?;
        match raw {
            Some(raw) => {
                let result = serde_json::from_str(&raw)
                    .map_err(|e| NotifyError::Serialization(format!("投递记录解析失败: {}", e)))?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}
