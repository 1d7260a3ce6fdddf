//! 存储键生成器
//!
//! 所有落在键值存储上的键都从这里生成，保证命名空间不冲突。

use chrono::NaiveDate;

use notify_shared::events::ChannelType;

pub struct StoreKey;

impl StoreKey {
    // ==================== 抑制名单 ====================

    /// 渠道总拉黑集合（任何原因的抑制都会进入，检查 O(1)）
    pub fn suppression_all(channel: ChannelType) -> String {
        format!("suppress:{}:all", channel)
    }

    /// 按原因分类的抑制集合
    pub fn suppression_reason(channel: ChannelType, reason: &str) -> String {
        format!("suppress:{}:{}", channel, reason)
    }

    /// 抑制条目详情
    pub fn suppression_entry(channel: ChannelType, recipient_key: &str) -> String {
        format!("suppress:{}:entry:{}", channel, recipient_key)
    }

    // ==================== 限流 ====================

    /// 固定窗口限流计数器
    pub fn rate_counter(channel: ChannelType, window: &str, scope: &str, slot: u64) -> String {
        format!("rl:{}:{}:{}:{}", channel, window, scope, slot)
    }

    // ==================== 指标 ====================

    /// 渠道指标快照（全量）
    pub fn metrics(channel: ChannelType) -> String {
        format!("metrics:{}", channel)
    }

    /// 渠道指标快照（按天）
    pub fn metrics_day(channel: ChannelType, date: NaiveDate) -> String {
        format!("metrics:{}:{}", channel, date.format("%Y%m%d"))
    }

    // ==================== 投递记录 ====================

    pub fn delivery_record(channel: ChannelType, notification_id: &str) -> String {
        format!("delivery:{}:{}", channel, notification_id)
    }

    // ==================== 推送 token ====================

    /// token 记录（按 token 值索引，保证注册去重）
    pub fn push_token(token: &str) -> String {
        format!("push:token:{}", token)
    }

    /// 用户持有的 token 集合（score = 注册时间，用于最旧淘汰）
    pub fn push_user_tokens(user_id: &str) -> String {
        format!("push:user:{}:tokens", user_id)
    }

    /// 全局 token 活跃索引（score = 最后使用时间，用于过期清扫）
    pub fn push_last_used() -> String {
        "push:tokens:last_used".to_string()
    }

    // ==================== 站内信 ====================

    /// 用户站内信索引（score = 创建时间，新的在前）
    pub fn inapp_index(user_id: &str) -> String {
        format!("inapp:user:{}:index", user_id)
    }

    /// 用户站内信正文（field = notification_id）
    pub fn inapp_items(user_id: &str) -> String {
        format!("inapp:user:{}:items", user_id)
    }

    pub fn inapp_unread(user_id: &str) -> String {
        format!("inapp:user:{}:unread", user_id)
    }

    pub fn inapp_badge(user_id: &str) -> String {
        format!("inapp:user:{}:badge", user_id)
    }

    /// 全局过期索引（member = "{user_id}:{notification_id}"，score = 过期时间）
    pub fn inapp_expiry() -> String {
        "inapp:expiry".to_string()
    }

    // ==================== 邮件 ====================

    /// 软退信计数（带 TTL，不触发抑制）
    pub fn email_soft_bounce(recipient: &str) -> String {
        format!("email:softbounce:{}", recipient)
    }
}
