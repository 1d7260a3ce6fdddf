//! 统一错误处理模块
//!
//! 定义投递引擎中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//!
//! 错误分为五大类（与投递结果的错误分类一一对应）：
//! - 配置错误：初始化阶段致命，直接向调用方抛出
//! - 验证错误：按条目报告，永不自动重试
//! - 抑制拒绝：按条目报告，不可重试，与传输错误可区分
//! - 限流拒绝：按条目报告，可重试，退避由调用方决定
//! - 传输错误：由渠道分类为永久 / 瞬时

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Configuration(String),

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    #[error("收件地址无法解析: user_id={user_id} channel={channel}")]
    AddressUnresolvable { user_id: String, channel: String },

    // ==================== 抑制拒绝 ====================
    #[error("收件人已被抑制: channel={channel} reason={reason}")]
    Suppressed { channel: String, reason: String },

    // ==================== 限流拒绝 ====================
    #[error("发送频率超限: {scope}")]
    RateLimited { scope: String },

    // ==================== 传输错误 ====================
    #[error("传输失败: [{code}] {message}")]
    Transport {
        code: String,
        message: String,
        permanent: bool,
    },

    #[error("传输超时: {channel}")]
    Timeout { channel: String },

    // ==================== 存储错误 ====================
    #[error("Redis 错误: {0}")]
    Store(#[from] redis::RedisError),

    #[error("存储序列化失败: {0}")]
    Serialization(String),

    // ==================== 模板错误 ====================
    #[error("模板渲染失败: template_id={template_id} - {message}")]
    Template { template_id: String, message: String },

    // ==================== 通用错误 ====================
    #[error("批量处理异常: {0}")]
    Batch(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取稳定的错误码
    ///
    /// 错误码会出现在投递结果、日志与指标标签中，保持向后兼容。
    /// 抑制拒绝的错误码携带具体原因，便于调用方区分退订 / 硬退信 / 投诉。
    pub fn code(&self) -> String {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR".to_string(),
            Self::Validation(_) => "VALIDATION_ERROR".to_string(),
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT".to_string(),
            Self::AddressUnresolvable { .. } => "ADDRESS_UNRESOLVABLE".to_string(),
            Self::Suppressed { reason, .. } => {
                format!("SUPPRESSED_{}", reason.to_uppercase())
            }
            Self::RateLimited { .. } => "RATE_LIMITED".to_string(),
            Self::Transport { code, .. } => code.clone(),
            Self::Timeout { .. } => "TIMEOUT".to_string(),
            Self::Store(_) => "STORE_ERROR".to_string(),
            Self::Serialization(_) => "SERIALIZATION_ERROR".to_string(),
            Self::Template { .. } => "TEMPLATE_ERROR".to_string(),
            Self::Batch(_) => "BATCH_ERROR".to_string(),
            Self::Internal(_) => "INTERNAL_ERROR".to_string(),
        }
    }

    /// 是否为可重试错误
    ///
    /// 限流、超时、存储故障与瞬时传输错误允许重试；
    /// 验证失败、抑制拒绝与永久传输错误重试没有意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Store(_) => true,
            Self::Transport { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// 是否为永久失败
    ///
    /// 永久失败通常会触发地址 / token 失效处理。
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidArgument { .. }
                | Self::AddressUnresolvable { .. }
                | Self::Suppressed { .. }
                | Self::Transport {
                    permanent: true,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = NotifyError::RateLimited {
            scope: "sms:minute".to_string(),
        };
        assert_eq!(err.code(), "RATE_LIMITED");

        let err = NotifyError::Suppressed {
            channel: "email".to_string(),
            reason: "hard_bounce".to_string(),
        };
        assert_eq!(err.code(), "SUPPRESSED_HARD_BOUNCE");
    }

    #[test]
    fn test_is_retryable() {
        let rate_limited = NotifyError::RateLimited {
            scope: "global".to_string(),
        };
        assert!(rate_limited.is_retryable());

        let transient = NotifyError::Transport {
            code: "PROVIDER_UNAVAILABLE".to_string(),
            message: "连接被拒绝".to_string(),
            permanent: false,
        };
        assert!(transient.is_retryable());

        let permanent = NotifyError::Transport {
            code: "MAILBOX_UNAVAILABLE".to_string(),
            message: "550 mailbox unavailable".to_string(),
            permanent: true,
        };
        assert!(!permanent.is_retryable());
        assert!(permanent.is_permanent());

        let suppressed = NotifyError::Suppressed {
            channel: "sms".to_string(),
            reason: "unsubscribed".to_string(),
        };
        assert!(!suppressed.is_retryable());
        assert!(suppressed.is_permanent());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = NotifyError::Timeout {
            channel: "push".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_permanent());
    }
}
