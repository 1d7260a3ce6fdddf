//! 引擎配置
//!
//! 每个渠道一份配置结构，在适配器构造时显式传入；运行时变更只通过
//! 适配器的 `reconfigure` 方法（内部为 ArcSwap 快照替换），不存在
//! 可被随意修改的全局单例。
//!
//! 所有结构都实现 `Deserialize`，可由 `notify_shared::config::load_config`
//! 从配置文件 / 环境变量整体加载。

use serde::Deserialize;

use notify_shared::config::{ObservabilityConfig, StoreConfig};
use notify_shared::error::{NotifyError, Result};

fn default_true() -> bool {
    true
}

/// Email 渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    /// 发件人地址，初始化时必须非空
    pub from_address: String,
    /// 发件人名称（用于构建邮件头 From 字段）
    pub from_name: String,
    /// 传输超时（毫秒）
    pub timeout_ms: u64,
    /// 瞬时错误最大重试次数
    pub max_retries: u32,
    /// 全局每秒发送上限（0 表示不限制）
    pub per_second_limit: i64,
    /// 单收件人每日上限（0 表示不限制）
    pub per_recipient_daily_limit: i64,
    /// 注入打开追踪像素
    pub track_opens: bool,
    /// 重写链接为点击追踪跳转
    pub track_clicks: bool,
    /// 追加退订链接
    pub track_unsubscribe: bool,
    /// 追踪跳转服务的基础 URL
    pub tracking_base_url: String,
    /// 默认邮件头，逐条发送时与消息级覆盖合并（消息级优先）
    pub default_headers: std::collections::HashMap<String, String>,
    /// 静态拉黑模式（精确地址或 @domain 后缀）
    pub blocklist: Vec<String>,
    /// 静态白名单模式，非空时仅匹配者可发
    pub allowlist: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            from_address: "noreply@notify.example.com".to_string(),
            from_name: "通知中心".to_string(),
            timeout_ms: 10_000,
            max_retries: 2,
            per_second_limit: 50,
            per_recipient_daily_limit: 0,
            track_opens: false,
            track_clicks: false,
            track_unsubscribe: false,
            tracking_base_url: "https://t.notify.example.com".to_string(),
            default_headers: std::collections::HashMap::new(),
            blocklist: Vec::new(),
            allowlist: Vec::new(),
        }
    }
}

impl EmailConfig {
    /// 初始化校验：配置错误在构造阶段抛出，不留下半初始化的渠道
    pub fn validate(&self) -> Result<()> {
        if self.from_address.trim().is_empty() || !self.from_address.contains('@') {
            return Err(NotifyError::Configuration(
                "email.from_address 缺失或格式无效".to_string(),
            ));
        }
        let tracking_enabled = self.track_opens || self.track_clicks || self.track_unsubscribe;
        if tracking_enabled && self.tracking_base_url.trim().is_empty() {
            return Err(NotifyError::Configuration(
                "启用追踪时 email.tracking_base_url 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

/// SMS 渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    /// 传输超时（毫秒）
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// 默认国家码（纯数字，不含 +），规范化时补全
    pub default_country_code: String,
    /// 合规文案，正文未含退订提示时追加
    pub compliance_text: String,
    /// 签名，最后追加（空字符串表示无签名）
    pub signature: String,
    /// 全局每分钟上限（0 = 不限制）
    pub per_minute_limit: i64,
    /// 全局每小时上限
    pub per_hour_limit: i64,
    /// 全局每日上限
    pub per_day_limit: i64,
    /// 单收件人每日上限
    pub per_recipient_daily_limit: i64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5_000,
            max_retries: 2,
            default_country_code: "86".to_string(),
            compliance_text: "Reply STOP to unsubscribe".to_string(),
            signature: String::new(),
            per_minute_limit: 60,
            per_hour_limit: 1_000,
            per_day_limit: 10_000,
            per_recipient_daily_limit: 10,
        }
    }
}

impl SmsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_country_code.is_empty()
            || !self.default_country_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(NotifyError::Configuration(
                "sms.default_country_code 必须为纯数字".to_string(),
            ));
        }
        Ok(())
    }
}

/// Push 渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    /// 单用户 token 上限，注册超出时淘汰最旧
    pub max_tokens_per_user: usize,
    /// 连续失败禁用阈值
    pub failure_threshold: u32,
    /// token 未使用保留天数，超出被清扫
    pub token_retention_days: i64,
    /// 组播批次大小
    pub multicast_batch_size: usize,
    /// 单收件人每分钟上限
    pub per_recipient_minute_limit: i64,
    /// Android 默认通知渠道
    pub default_android_channel: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 3_000,
            max_tokens_per_user: 10,
            failure_threshold: 5,
            token_retention_days: 90,
            multicast_batch_size: 500,
            per_recipient_minute_limit: 30,
            default_android_channel: "default".to_string(),
        }
    }
}

impl PushConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens_per_user == 0 {
            return Err(NotifyError::Configuration(
                "push.max_tokens_per_user 必须大于 0".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(NotifyError::Configuration(
                "push.failure_threshold 必须大于 0".to_string(),
            ));
        }
        if self.multicast_batch_size == 0 {
            return Err(NotifyError::Configuration(
                "push.multicast_batch_size 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 站内信渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InAppConfig {
    pub enabled: bool,
    /// 实时下发超时（毫秒）
    pub timeout_ms: u64,
    /// 尝试实时下发
    #[serde(default = "default_true")]
    pub realtime_enabled: bool,
    /// 实时下发成功后仍然落库
    ///
    /// 实时成功只说明存在活跃连接，并不等于客户端确认收到；
    /// 默认落库以保证可查。关闭后实时成功即跳过持久化。
    #[serde(default = "default_true")]
    pub always_persist: bool,
    /// 单用户保留的站内信上限，超出淘汰最旧
    pub max_notifications_per_user: usize,
    /// 单收件人每分钟上限
    pub per_recipient_minute_limit: i64,
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2_000,
            realtime_enabled: true,
            always_persist: true,
            max_notifications_per_user: 100,
            per_recipient_minute_limit: 60,
        }
    }
}

impl InAppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_notifications_per_user == 0 {
            return Err(NotifyError::Configuration(
                "in_app.max_notifications_per_user 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 投递记录配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryLogConfig {
    /// 投递记录保留时长（秒）
    pub retention_secs: u64,
}

impl Default for DeliveryLogConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 3600,
        }
    }
}

/// 引擎配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub observability: ObservabilityConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub push: PushConfig,
    pub in_app: InAppConfig,
    pub delivery_log: DeliveryLogConfig,
}

impl EngineConfig {
    /// 校验全部渠道配置
    pub fn validate(&self) -> Result<()> {
        self.email.validate()?;
        self.sms.validate()?;
        self.push.validate()?;
        self.in_app.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_email_config_rejects_bad_from() {
        let config = EmailConfig {
            from_address: "not-an-address".to_string(),
            ..EmailConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NotifyError::Configuration(_))
        ));
    }

    #[test]
    fn test_email_config_requires_tracking_url() {
        let config = EmailConfig {
            track_opens: true,
            tracking_base_url: "".to_string(),
            ..EmailConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sms_config_rejects_non_numeric_country_code() {
        let config = SmsConfig {
            default_country_code: "+86".to_string(),
            ..SmsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_config_rejects_zero_cap() {
        let config = PushConfig {
            max_tokens_per_user: 0,
            ..PushConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
