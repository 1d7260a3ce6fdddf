//! 固定窗口限流
//!
//! 基于存储的原子 INCR + 首次 EXPIRE 实现固定窗口计数器。
//! 计数器键包含向下取整的窗口时间戳，窗口滚动即自然切换到新键，
//! 旧键随 TTL 自清理；自增后超限不回退（计数器随窗口过期）。
//!
//! 一次发送可叠加多个互相独立的窗口（全局每秒 / 每分钟 / 每小时 /
//! 单收件人每日……），任一窗口超限即拒绝整次发送。

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::ChannelType;
use notify_shared::store::KeyValueStore;

use crate::keys::StoreKey;

/// 限流窗口作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    /// 渠道全局
    Global,
    /// 单收件人
    Recipient,
}

/// 限流窗口定义
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// 窗口名（进入错误信息、日志与指标标签）
    pub name: &'static str,
    pub scope: RateScope,
    /// 窗口内允许的最大发送数，0 或负数表示该窗口不启用
    pub limit: i64,
    /// 窗口大小（秒）
    pub window_secs: u64,
}

impl RateWindow {
    pub fn global(name: &'static str, limit: i64, window_secs: u64) -> Self {
        Self {
            name,
            scope: RateScope::Global,
            limit,
            window_secs,
        }
    }

    pub fn per_recipient(name: &'static str, limit: i64, window_secs: u64) -> Self {
        Self {
            name,
            scope: RateScope::Recipient,
            limit,
            window_secs,
        }
    }
}

/// 固定窗口限流器
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// 检查并占用一次发送配额
    ///
    /// 依次对每个窗口执行原子自增比较，任一窗口超限返回可重试的
    /// `RateLimited`。超限窗口的自增不回退——固定窗口语义下计数器
    /// 在窗口结束时整体过期，多计的次数不影响下一窗口。
    pub async fn check(
        &self,
        channel: ChannelType,
        windows: &[RateWindow],
        recipient_key: &str,
    ) -> Result<()> {
        let now_secs = chrono::Utc::now().timestamp() as u64;
        self.check_at(channel, windows, recipient_key, now_secs).await
    }

    /// 以显式时间执行检查（窗口边界测试用）
    pub(crate) async fn check_at(
        &self,
        channel: ChannelType,
        windows: &[RateWindow],
        recipient_key: &str,
        now_secs: u64,
    ) -> Result<()> {
        for window in windows {
            if window.limit <= 0 || window.window_secs == 0 {
                continue;
            }

            let scope = match window.scope {
                RateScope::Global => "global",
                RateScope::Recipient => recipient_key,
            };
            let slot = now_secs / window.window_secs;
            let key = StoreKey::rate_counter(channel, window.name, scope, slot);

            // INCR 在 key 不存在时自动创建并设为 1
            let count = self.store.incr(&key, 1).await?;

            // 首次创建时设置过期时间，确保窗口到期后自动清理。
            // 多留一个窗口的余量，避免边界上的键提前消失。
            if count == 1 {
                self.store
                    .expire(&key, Duration::from_secs(window.window_secs * 2))
                    .await?;
            }

            if count > window.limit {
                warn!(
                    channel = %channel,
                    window = window.name,
                    scope = scope,
                    count,
                    limit = window.limit,
                    "发送触发限流"
                );
                return Err(NotifyError::RateLimited {
                    scope: format!("{}:{}", channel, window.name),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::store::MemoryStore;

    fn test_limiter() -> RateLimiter {
        RateLimiter::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn test_limit_boundary_exactness() {
        let limiter = test_limiter();
        let windows = [RateWindow::per_recipient("minute", 3, 60)];
        let now = 1_700_000_000;

        // 第 N 次（N = limit）通过
        for _ in 0..3 {
            limiter
                .check_at(ChannelType::Sms, &windows, "+86138", now)
                .await
                .unwrap();
        }

        // 第 N+1 次拒绝
        let err = limiter
            .check_at(ChannelType::Sms, &windows, "+86138", now)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_window_rollover_resets_count() {
        let limiter = test_limiter();
        let windows = [RateWindow::global("minute", 1, 60)];
        let now = 1_700_000_000;

        limiter
            .check_at(ChannelType::Email, &windows, "-", now)
            .await
            .unwrap();
        assert!(
            limiter
                .check_at(ChannelType::Email, &windows, "-", now + 1)
                .await
                .is_err()
        );

        // 下一窗口恢复
        limiter
            .check_at(ChannelType::Email, &windows, "-", now + 60)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_windows_any_violation_blocks() {
        let limiter = test_limiter();
        let windows = [
            RateWindow::global("minute", 100, 60),
            RateWindow::per_recipient("daily", 1, 86_400),
        ];
        let now = 1_700_000_000;

        limiter
            .check_at(ChannelType::Sms, &windows, "+86138", now)
            .await
            .unwrap();

        // 全局窗口仍有配额，但收件人日窗口已满
        let err = limiter
            .check_at(ChannelType::Sms, &windows, "+86138", now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");

        // 其他收件人不受影响
        limiter
            .check_at(ChannelType::Sms, &windows, "+86139", now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_limit_disables_window() {
        let limiter = test_limiter();
        let windows = [RateWindow::global("second", 0, 1)];

        for _ in 0..10 {
            limiter
                .check_at(ChannelType::Email, &windows, "-", 1_700_000_000)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_recipient_scopes_are_isolated() {
        let limiter = test_limiter();
        let windows = [RateWindow::per_recipient("daily", 1, 86_400)];
        let now = 1_700_000_000;

        limiter
            .check_at(ChannelType::Push, &windows, "user-a", now)
            .await
            .unwrap();
        limiter
            .check_at(ChannelType::Push, &windows, "user-b", now)
            .await
            .unwrap();
        assert!(
            limiter
                .check_at(ChannelType::Push, &windows, "user-a", now)
                .await
                .is_err()
        );
    }
}
