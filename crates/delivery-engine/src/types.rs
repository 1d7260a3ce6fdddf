//! 通知与投递结果类型定义
//!
//! 定义引擎入口的通知模型与出口的投递结果模型。
//! 通知一经签发不可变，所有适配器只读消费。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use notify_shared::error::NotifyError;
use notify_shared::events::ChannelType;

// ---------------------------------------------------------------------------
// Priority — 通知优先级
// ---------------------------------------------------------------------------

/// 通知优先级
///
/// 影响邮件头的优先级映射与推送的提醒强度，不影响投递顺序。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    /// 默认优先级，兼容历史数据中的 "medium" 写法
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationMetadata — 类型化元数据
// ---------------------------------------------------------------------------

/// 通知元数据
///
/// 引擎会读取的键以类型化字段表达，其余键保留在 `extra` 中原样透传给
/// 渠道 / 模板，引擎自身从不解释它们。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    /// 模板 ID，存在时发送前先渲染
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// 收件邮箱覆盖（优先于收件人目录）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    /// 收件手机号覆盖（优先于收件人目录）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// 推送 / 站内信图标
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// 推送提示音
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// 投递记录保留时长覆盖（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// 邮件列表 ID，存在时附加 List-Id / List-Unsubscribe 头
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    /// 渠道 / 模板专用的透传数据
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// 通知动作按钮
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAction {
    /// 动作标识（客户端回传）
    pub action: String,
    /// 按钮文案
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// 是否为主操作
    #[serde(default)]
    pub primary: bool,
}

// ---------------------------------------------------------------------------
// Notification — 通知请求
// ---------------------------------------------------------------------------

/// 通知请求
///
/// 由外部调用方产生，签发后不可变；适配器只读消费。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// 通知唯一标识
    pub notification_id: String,
    /// 目标用户 ID
    pub user_id: String,
    /// 业务通知类型（如 order_shipped、security_alert）
    pub notification_type: String,
    /// 通知标题
    pub title: String,
    /// 通知正文
    pub message: String,
    /// 优先级
    #[serde(default)]
    pub priority: Priority,
    /// 元数据（类型化字段 + 透传）
    #[serde(default)]
    pub metadata: NotificationMetadata,
    /// 动作按钮（有序）
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    /// 过期时间，过期后站内信被清理、其他渠道拒绝发送
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// 创建新通知
    pub fn new(
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            notification_type: notification_type.into(),
            title: title.into(),
            message: message.into(),
            priority: Priority::Normal,
            metadata: NotificationMetadata::default(),
            actions: Vec::new(),
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// 设置模板 ID
    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.metadata.template_id = Some(template_id.into());
        self
    }

    /// 覆盖收件邮箱
    pub fn with_recipient_email(mut self, email: impl Into<String>) -> Self {
        self.metadata.recipient_email = Some(email.into());
        self
    }

    /// 覆盖收件手机号
    pub fn with_phone_number(mut self, phone: impl Into<String>) -> Self {
        self.metadata.phone_number = Some(phone.into());
        self
    }

    /// 添加透传数据
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    /// 添加动作按钮
    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.actions.push(action);
        self
    }

    /// 设置过期时间
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// 通知是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// DeliveryResult — 投递结果
// ---------------------------------------------------------------------------

/// 投递错误
///
/// 在投递结果中替代 `Err`：单条失败永远以结果形式报告，
/// 调用方依据 `retryable` / `permanent` 决定后续处理。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryError {
    /// 稳定错误码（SUPPRESSED_*、RATE_LIMITED、TIMEOUT、BATCH_ERROR 等）
    pub code: String,
    pub message: String,
    /// 永久失败：重试无意义，通常伴随地址 / token 失效处理
    pub permanent: bool,
    /// 可重试：退避后重试可能成功
    pub retryable: bool,
}

impl DeliveryError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        permanent: bool,
        retryable: bool,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            permanent,
            retryable,
        }
    }
}

impl From<&NotifyError> for DeliveryError {
    fn from(err: &NotifyError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            permanent: err.is_permanent(),
            retryable: err.is_retryable(),
        }
    }
}

/// SMS 编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SmsEncoding {
    /// GSM 7-bit 基本字符集
    Gsm7,
    /// 2 字节编码（任一字符超出安全集时整条启用）
    Ucs2,
}

/// 单个 token 的推送结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDeliveryResult {
    /// token 摘要（仅保留首尾，避免完整凭证进入日志 / 存储）
    pub token: String,
    pub platform: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

/// 渠道特有的投递明细
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeliveryDetail {
    #[default]
    None,
    Email {
        envelope_from: String,
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
    Sms {
        segments: u32,
        encoding: SmsEncoding,
    },
    Push {
        total: usize,
        delivered: usize,
        failed: usize,
        token_results: Vec<TokenDeliveryResult>,
    },
    InApp {
        realtime: bool,
        persisted: bool,
    },
}

/// 投递结果
///
/// 每次 send 调用产生一条；推送渠道在 detail 中展开逐 token 明细。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub notification_id: String,
    pub channel: ChannelType,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// 实际执行的传输次数（含重试；未到传输阶段为 0）
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
    #[serde(default)]
    pub detail: DeliveryDetail,
    /// 发送耗时（毫秒）
    pub duration_ms: u64,
}

impl DeliveryResult {
    /// 创建成功结果
    pub fn delivered(
        notification_id: impl Into<String>,
        channel: ChannelType,
        attempts: u32,
        provider_message_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel,
            success: true,
            timestamp: Utc::now(),
            attempts,
            provider_message_id,
            error: None,
            detail: DeliveryDetail::None,
            duration_ms,
        }
    }

    /// 创建失败结果
    pub fn failed(
        notification_id: impl Into<String>,
        channel: ChannelType,
        attempts: u32,
        error: DeliveryError,
        duration_ms: u64,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel,
            success: false,
            timestamp: Utc::now(),
            attempts,
            provider_message_id: None,
            error: Some(error),
            detail: DeliveryDetail::None,
            duration_ms,
        }
    }

    /// 由 NotifyError 构造失败结果（未执行传输时 attempts 为 0）
    pub fn rejected(
        notification_id: impl Into<String>,
        channel: ChannelType,
        err: &NotifyError,
    ) -> Self {
        Self::failed(notification_id, channel, 0, DeliveryError::from(err), 0)
    }

    /// 附加渠道明细
    pub fn with_detail(mut self, detail: DeliveryDetail) -> Self {
        self.detail = detail;
        self
    }

    /// 错误码（无错误时为 None）
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// token 摘要：保留前 6 后 4 位，中间打码
///
/// 完整 token 是推送凭证，不落日志、不进投递记录。
pub fn mask_token(token: &str) -> String {
    if token.len() <= 12 {
        return "*".repeat(token.len());
    }
    format!("{}…{}", &token[..6], &token[token.len() - 4..])
}
