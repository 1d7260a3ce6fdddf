//! SMS 短信通知渠道
//!
//! 职责：手机号规范化（带备忘缓存）、编码探测与分段计算、合规文案与
//! 签名追加、四层独立限流、入站关键字退订。
//!
//! 传输经由 [`SmsTransport`] trait 注入，契约只有"把正文发到规范化
//! 号码，返回消息 ID 或分类错误"。

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{ChannelType, EngineEvent};
use notify_shared::retry::{RetryPolicy, retry_with_policy};

use super::{Channel, ChannelRuntime, SendOptions, with_timeout};
use crate::config::SmsConfig;
use crate::directory::RecipientDirectory;
use crate::metrics::{ChannelMetrics, MetricEvent, MetricsPeriod};
use crate::rate_limit::RateWindow;
use crate::suppression::{SuppressionEntry, SuppressionReason};
use crate::template::{PersonalizationContext, TemplateRenderer};
use crate::types::{DeliveryDetail, DeliveryError, DeliveryResult, Notification, SmsEncoding};

// ---------------------------------------------------------------------------
// 号码规范化
// ---------------------------------------------------------------------------

/// 手机号规范化
///
/// 规则：剥离所有非数字字符；原始输入带 `+`（或国际拨号前缀 00）视为
/// 完整国际号码；否则在缺少国家码时补全配置的默认国家码；
/// 结果统一带前导 `+`。
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let mut digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    // 国际拨号前缀 00 等价于 +
    let international = has_plus || digits.starts_with("00");
    if !has_plus && international {
        digits = digits[2..].to_string();
    }

    if !international && !digits.starts_with(default_country_code) {
        digits = format!("{}{}", default_country_code, digits);
    }

    // E.164：国家码 + 号码最长 15 位
    if digits.len() < 8 || digits.len() > 15 {
        return Err(NotifyError::Validation(format!("手机号无效: {}", raw)));
    }

    Ok(format!("+{}", digits))
}

// ---------------------------------------------------------------------------
// 编码探测与分段
// ---------------------------------------------------------------------------

/// GSM 03.38 基本字符集（含扩展表字符与换行）
///
/// 任一字符超出该集合，整条短信改用 2 字节编码。
const GSM7_SAFE: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑܧ¿abcdefghijklmnopqrstuvwxyzäöñüà^{}\\[~]|€";

fn is_gsm7_char(c: char) -> bool {
    GSM7_SAFE.contains(c)
}

/// 计算短信分段数与编码
///
/// 7-bit：≤160 字符单段，超出按 153 字符/段；
/// 2 字节：≤70 字符单段，超出按 67 字符/段。
pub fn sms_segments(body: &str) -> (u32, SmsEncoding) {
    let len = body.chars().count();
    let gsm7 = body.chars().all(is_gsm7_char);

    if gsm7 {
        let segments = if len <= 160 {
            1
        } else {
            len.div_ceil(153) as u32
        };
        (segments, SmsEncoding::Gsm7)
    } else {
        let segments = if len <= 70 { 1 } else { len.div_ceil(67) as u32 };
        (segments, SmsEncoding::Ucs2)
    }
}

// ---------------------------------------------------------------------------
// 入站关键字
// ---------------------------------------------------------------------------

/// 入站短信关键字动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordAction {
    /// STOP 等价词：退订
    OptOut,
    /// START 等价词：重新订阅
    OptIn,
    /// 普通回复，不处理
    None,
}

/// 识别入站文本的首个词
fn classify_keyword(text: &str) -> KeywordAction {
    let first = text
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    match first.as_str() {
        "STOP" | "UNSUBSCRIBE" | "CANCEL" | "QUIT" | "END" => KeywordAction::OptOut,
        "START" | "UNSTOP" | "YES" => KeywordAction::OptIn,
        _ => KeywordAction::None,
    }
}

// ---------------------------------------------------------------------------
// 传输契约
// ---------------------------------------------------------------------------

/// 传输错误
#[derive(Debug, Clone, thiserror::Error)]
#[error("短信传输失败: {message}")]
pub struct SmsTransportError {
    /// 服务商错误码（如有）
    pub code: Option<String>,
    pub message: String,
    /// 永久失败（无效号码、被运营商拉黑）
    pub permanent: bool,
}

/// 短信传输抽象
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// 发送短信，`segments` 供服务商计费侧核对
    async fn send(
        &self,
        to: &str,
        body: &str,
        segments: u32,
    ) -> std::result::Result<String, SmsTransportError>;
}

/// 模拟短信传输
pub struct SimulatedSmsTransport;

#[async_trait]
impl SmsTransport for SimulatedSmsTransport {
    async fn send(
        &self,
        to: &str,
        body: &str,
        segments: u32,
    ) -> std::result::Result<String, SmsTransportError> {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // 联调触发规则：特定后缀模拟服务商侧失败
        if to.ends_with("0000") {
            return Err(SmsTransportError {
                code: Some("INVALID_NUMBER".to_string()),
                message: "号码不存在".to_string(),
                permanent: true,
            });
        }
        if to.ends_with("1111") {
            return Err(SmsTransportError {
                code: Some("GATEWAY_BUSY".to_string()),
                message: "网关忙".to_string(),
                permanent: false,
            });
        }

        debug!(to = %to, segments, body_len = body.chars().count(), "模拟发送短信");
        Ok(format!("sms_{}", Uuid::new_v4()))
    }
}

// ---------------------------------------------------------------------------
// SmsAdapter
// ---------------------------------------------------------------------------

/// SMS 短信通知渠道
pub struct SmsAdapter {
    config: ArcSwap<SmsConfig>,
    runtime: ChannelRuntime,
    directory: Arc<dyn RecipientDirectory>,
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn SmsTransport>,
    /// 规范化备忘缓存：原始输入 → 规范化号码
    ///
    /// 纯记忆层，持久状态始终以规范化号码为准。
    phone_cache: DashMap<String, String>,
}

impl SmsAdapter {
    pub fn new(
        config: SmsConfig,
        runtime: ChannelRuntime,
        directory: Arc<dyn RecipientDirectory>,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn SmsTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            runtime,
            directory,
            renderer,
            transport,
            phone_cache: DashMap::new(),
        })
    }

    /// 替换渠道配置
    ///
    /// 国家码可能变化，规范化缓存一并失效。
    pub fn reconfigure(&self, config: SmsConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        self.phone_cache.clear();
        info!("SMS 渠道配置已更新");
        Ok(())
    }

    /// 解析并规范化收件号码（带备忘缓存）
    async fn resolve_recipient(
        &self,
        notification: &Notification,
        config: &SmsConfig,
    ) -> Result<String> {
        let raw = match &notification.metadata.phone_number {
            Some(phone) => Some(phone.clone()),
            None => {
                self.directory
                    .resolve_address(&notification.user_id, ChannelType::Sms)
                    .await?
            }
        };
        let raw = raw.ok_or_else(|| NotifyError::AddressUnresolvable {
            user_id: notification.user_id.clone(),
            channel: "sms".to_string(),
        })?;

        if let Some(cached) = self.phone_cache.get(&raw) {
            return Ok(cached.clone());
        }
        let normalized = normalize_phone(&raw, &config.default_country_code)?;
        self.phone_cache.insert(raw, normalized.clone());
        Ok(normalized)
    }

    /// 组装正文：渲染 → 合规文案 → 签名
    ///
    /// 合规文案仅在正文尚无退订提示（不含 stop / unsubscribe，
    /// 大小写不敏感）时追加；签名永远排在最后。
    /// 追加完成后才计算分段。
    async fn compose_body(
        &self,
        notification: &Notification,
        config: &SmsConfig,
        options: &SendOptions,
    ) -> Result<String> {
        let mut body = if options.template
            && let Some(template_id) = &notification.metadata.template_id
        {
            let context = PersonalizationContext::new(
                notification.user_id.clone(),
                notification.metadata.extra.clone(),
            );
            self.renderer
                .render(template_id, &context, ChannelType::Sms)
                .await?
                .body
        } else {
            notification.message.clone()
        };

        if !config.compliance_text.is_empty() {
            let lower = body.to_lowercase();
            if !lower.contains("stop") && !lower.contains("unsubscribe") {
                body.push('\n');
                body.push_str(&config.compliance_text);
            }
        }

        if !config.signature.is_empty() {
            body.push('\n');
            body.push_str(&config.signature);
        }

        Ok(body)
    }

    async fn deliver(
        &self,
        notification: &Notification,
        options: &SendOptions,
        start: Instant,
    ) -> Result<DeliveryResult> {
        let config = self.config.load_full();

        if !config.enabled {
            return Err(NotifyError::Configuration("SMS 渠道已禁用".to_string()));
        }
        if notification.is_expired(Utc::now()) {
            return Err(NotifyError::Validation("通知已过期".to_string()));
        }

        let recipient = self.resolve_recipient(notification, &config).await?;

        // 四层独立限流（快速失败，不产生任何部分发送），任一窗口超限即拒绝
        let windows = [
            RateWindow::global("minute", config.per_minute_limit, 60),
            RateWindow::global("hour", config.per_hour_limit, 3_600),
            RateWindow::global("day", config.per_day_limit, 86_400),
            RateWindow::per_recipient("recipient_daily", config.per_recipient_daily_limit, 86_400),
        ];
        if let Err(err) = self
            .runtime
            .limiter
            .check(ChannelType::Sms, &windows, &recipient)
            .await
        {
            if matches!(err, NotifyError::RateLimited { .. }) {
                self.runtime.events.publish(EngineEvent::RateLimited {
                    channel: ChannelType::Sms,
                    scope: err.code(),
                    timestamp: Utc::now(),
                });
            }
            return Err(err);
        }

        // 抑制检查（命中即短路，零传输调用）
        if self
            .runtime
            .suppression
            .is_suppressed(ChannelType::Sms, &recipient)
            .await?
        {
            let reason = self
                .runtime
                .suppression
                .entry(ChannelType::Sms, &recipient)
                .await?
                .map(|e| e.reason.as_str().to_string())
                .unwrap_or_else(|| SuppressionReason::ManualBlock.as_str().to_string());
            self.runtime.events.publish(EngineEvent::Suppressed {
                channel: ChannelType::Sms,
                recipient_key: recipient.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return Err(NotifyError::Suppressed {
                channel: "sms".to_string(),
                reason,
            });
        }

        let body = self.compose_body(notification, &config, options).await?;
        let (segments, encoding) = sms_segments(&body);

        self.runtime
            .metrics
            .record(ChannelType::Sms, MetricEvent::Sent)
            .await?;

        let policy = RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        };
        let transport = self.transport.clone();
        let (outcome, attempts) = retry_with_policy(
            &policy,
            "sms_send",
            |e| e.is_retryable(),
            || {
                let transport = transport.clone();
                let recipient = recipient.clone();
                let body = body.clone();
                let timeout_ms = config.timeout_ms;
                async move {
                    with_timeout(ChannelType::Sms, timeout_ms, async move {
                        transport.send(&recipient, &body, segments).await.map_err(|e| {
                            NotifyError::Transport {
                                code: e
                                    .code
                                    .clone()
                                    .unwrap_or_else(|| "PROVIDER_ERROR".to_string()),
                                message: e.message.clone(),
                                permanent: e.permanent,
                            }
                        })
                    })
                    .await
                }
            },
        )
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(message_id) => {
                self.runtime
                    .metrics
                    .record(ChannelType::Sms, MetricEvent::Delivered)
                    .await?;
                Ok(DeliveryResult::delivered(
                    notification.notification_id.clone(),
                    ChannelType::Sms,
                    attempts,
                    Some(message_id),
                    duration_ms,
                )
                .with_detail(DeliveryDetail::Sms { segments, encoding }))
            }
            Err(err) => {
                self.runtime
                    .metrics
                    .record(ChannelType::Sms, MetricEvent::Failed)
                    .await?;
                // 无效号码等永久错误：号码进入抑制名单，之后零传输短路
                if err.is_permanent() {
                    self.runtime
                        .suppression
                        .suppress(&SuppressionEntry::new(
                            ChannelType::Sms,
                            recipient.clone(),
                            SuppressionReason::HardBounce,
                        ))
                        .await?;
                }
                Ok(DeliveryResult::failed(
                    notification.notification_id.clone(),
                    ChannelType::Sms,
                    attempts,
                    DeliveryError::from(&err),
                    duration_ms,
                )
                .with_detail(DeliveryDetail::Sms { segments, encoding }))
            }
        }
    }

    // ==================== 入站与订阅管理 ====================

    /// 处理入站短信
    ///
    /// STOP 等价词走与邮件退订相同的抑制路径；START 等价词解除抑制。
    /// 返回识别出的动作，普通回复原样返回 `KeywordAction::None`。
    pub async fn handle_inbound(&self, from: &str, text: &str) -> Result<KeywordAction> {
        let config = self.config.load_full();
        let recipient = normalize_phone(from, &config.default_country_code)?;

        let action = classify_keyword(text);
        match action {
            KeywordAction::OptOut => {
                self.handle_opt_out(&recipient).await?;
                info!(recipient = %recipient, "入站关键字退订");
            }
            KeywordAction::OptIn => {
                self.handle_opt_in(&recipient).await?;
                info!(recipient = %recipient, "入站关键字重新订阅");
            }
            KeywordAction::None => {}
        }
        Ok(action)
    }

    /// 退订
    pub async fn handle_opt_out(&self, recipient: &str) -> Result<()> {
        self.runtime
            .suppression
            .suppress(&SuppressionEntry::new(
                ChannelType::Sms,
                recipient.to_string(),
                SuppressionReason::Unsubscribed,
            ))
            .await?;
        self.runtime.events.publish(EngineEvent::OptOut {
            channel: ChannelType::Sms,
            recipient_key: recipient.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// 重新订阅（唯一的抑制解除路径）
    pub async fn handle_opt_in(&self, recipient: &str) -> Result<bool> {
        let removed = self
            .runtime
            .suppression
            .opt_in(ChannelType::Sms, recipient)
            .await?;
        self.runtime.events.publish(EngineEvent::OptIn {
            channel: ChannelType::Sms,
            recipient_key: recipient.to_string(),
            timestamp: Utc::now(),
        });
        Ok(removed)
    }
}

#[async_trait]
impl Channel for SmsAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }

    fn name(&self) -> &str {
        "SMS"
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
                let _ = self.runtime.metrics.record(ChannelType::Sms, metric).await;
                DeliveryResult::rejected(
                    notification.notification_id.clone(),
                    ChannelType::Sms,
                    &err,
                )
            }
        };

        self.runtime.finalize(notification, result).await
    }

    async fn get_metrics(&self, period: MetricsPeriod) -> Result<ChannelMetrics> {
        self.runtime.metrics.snapshot(ChannelType::Sms, period).await
    }
}
