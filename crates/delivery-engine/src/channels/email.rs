//! Email 邮件通知渠道
//!
//! 职责：收件地址解析、模板渲染 / 纯文本转 HTML、邮件头合并、
//! 打开 / 点击 / 退订追踪注入、SMTP 永久错误分类、退信与投诉处理。
//!
//! 传输经由 [`EmailTransport`] trait 注入，本模块不关心任何邮件服务商
//! 的线上协议——只要求"发出一封结构化邮件，返回回执或分类错误"。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{ChannelType, EngineEvent};
use notify_shared::retry::{RetryPolicy, retry_with_policy};

use super::{Channel, ChannelRuntime, SendOptions, with_timeout};
use crate::config::EmailConfig;
use crate::directory::RecipientDirectory;
use crate::keys::StoreKey;
use crate::metrics::{ChannelMetrics, MetricEvent, MetricsPeriod};
use crate::rate_limit::RateWindow;
use crate::suppression::{SuppressionEntry, SuppressionReason, allowed_by_patterns};
use crate::template::{PersonalizationContext, TemplateRenderer};
use crate::types::{DeliveryDetail, DeliveryError, DeliveryResult, Notification, Priority};

// ---------------------------------------------------------------------------
// 传输契约
// ---------------------------------------------------------------------------

/// 待发送的邮件
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    /// 纯文本正文（追踪注入不触碰它）
    pub text_body: String,
    pub html_body: Option<String>,
    pub headers: HashMap<String, String>,
}

/// 传输回执
#[derive(Debug, Clone)]
pub struct EmailReceipt {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// 传输错误
///
/// `code` 为服务商返回的 SMTP 状态码（如有）。
#[derive(Debug, Clone, thiserror::Error)]
#[error("邮件传输失败: {message}")]
pub struct EmailTransportError {
    pub code: Option<u16>,
    pub message: String,
}

impl EmailTransportError {
    /// 是否属于永久失败类
    ///
    /// 550-554 一类的状态码（邮箱不存在、存储超限等）重试无意义，
    /// 并会触发硬退信处理；其余一律按瞬时处理。
    pub fn is_permanent(&self) -> bool {
        if matches!(self.code, Some(code) if (550..=554).contains(&code)) {
            return true;
        }
        let message = self.message.to_lowercase();
        ["mailbox unavailable", "exceeded storage", "user unknown", "no such user"]
            .iter()
            .any(|needle| message.contains(needle))
    }
}

/// 邮件传输抽象
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        message: &EmailMessage,
    ) -> std::result::Result<EmailReceipt, EmailTransportError>;
}

/// 模拟邮件传输
///
/// 记录网络延迟并返回生成的消息 ID，生产环境替换为真实服务商实现。
pub struct SimulatedEmailTransport;

#[async_trait]
impl EmailTransport for SimulatedEmailTransport {
    async fn send(
        &self,
        message: &EmailMessage,
    ) -> std::result::Result<EmailReceipt, EmailTransportError> {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // 联调触发规则：特定前缀模拟服务商侧失败
        if message.to.starts_with("bounce") {
            return Err(EmailTransportError {
                code: Some(550),
                message: "550 mailbox unavailable".to_string(),
            });
        }
        if message.to.starts_with("greylist") {
            return Err(EmailTransportError {
                code: Some(421),
                message: "421 try again later".to_string(),
            });
        }

        debug!(to = %message.to, subject = %message.subject, "模拟发送邮件");
        Ok(EmailReceipt {
            message_id: format!("email_{}", Uuid::new_v4()),
            accepted: vec![message.to.clone()],
            rejected: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// 退信类型
// ---------------------------------------------------------------------------

/// 退信类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceType {
    /// 地址永久不可达，触发抑制
    Hard,
    /// 临时不可达（信箱满、服务暂停），只记录不抑制
    Soft,
}

// ---------------------------------------------------------------------------
// EmailAdapter
// ---------------------------------------------------------------------------

/// Email 邮件通知渠道
pub struct EmailAdapter {
    config: ArcSwap<EmailConfig>,
    runtime: ChannelRuntime,
    directory: Arc<dyn RecipientDirectory>,
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn EmailTransport>,
    link_regex: Regex,
}

impl EmailAdapter {
    /// 创建邮件渠道
    ///
    /// 配置校验失败直接返回错误，不产生半初始化的渠道。
    pub fn new(
        config: EmailConfig,
        runtime: ChannelRuntime,
        directory: Arc<dyn RecipientDirectory>,
        renderer: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn EmailTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            runtime,
            directory,
            renderer,
            transport,
            // 仅匹配 http(s) 链接；锚点内的相对链接和 mailto 不追踪
            link_regex: Regex::new(r#"href="(https?://[^"]+)""#).unwrap(),
        })
    }

    /// 替换渠道配置（唯一的运行时变更入口）
    pub fn reconfigure(&self, config: EmailConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        info!("Email 渠道配置已更新");
        Ok(())
    }

    /// 解析收件地址：元数据覆盖优先，其次收件人目录
    async fn resolve_recipient(&self, notification: &Notification) -> Result<String> {
        let address = match &notification.metadata.recipient_email {
            Some(address) => Some(address.clone()),
            None => {
                self.directory
                    .resolve_address(&notification.user_id, ChannelType::Email)
                    .await?
            }
        };

        let address = address.ok_or_else(|| NotifyError::AddressUnresolvable {
            user_id: notification.user_id.clone(),
            channel: "email".to_string(),
        })?;

        let address = address.trim().to_lowercase();
        if !address.contains('@') || address.starts_with('@') || address.ends_with('@') {
            return Err(NotifyError::Validation(format!("邮箱地址无效: {}", address)));
        }
        Ok(address)
    }

    /// 纯文本转 HTML（无模板时的回落路径）
    fn plain_to_html(title: &str, text: &str) -> String {
        let escape = |s: &str| {
            s.replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
        };
        let paragraphs: String = text
            .split('\n')
            .map(|line| format!("<p>{}</p>", escape(line)))
            .collect();
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"><title>{}</title></head>\
             <body>{}</body></html>",
            escape(title),
            paragraphs
        )
    }

    /// 渲染邮件内容：模板优先，否则纯文本自动转 HTML
    async fn render_content(
        &self,
        notification: &Notification,
        recipient: &str,
        options: &SendOptions,
    ) -> Result<(String, String, Option<String>)> {
        if options.template
            && let Some(template_id) = &notification.metadata.template_id
        {
            let context = PersonalizationContext::new(
                notification.user_id.clone(),
                notification.metadata.extra.clone(),
            )
            .with_email(recipient);
            let rendered = self
                .renderer
                .render(template_id, &context, ChannelType::Email)
                .await?;

            let subject = rendered
                .subject
                .unwrap_or_else(|| notification.title.clone());
            let html = rendered
                .html_body
                .unwrap_or_else(|| Self::plain_to_html(&subject, &rendered.body));
            return Ok((subject, rendered.body, Some(html)));
        }

        let subject = notification.title.clone();
        let html = Self::plain_to_html(&subject, &notification.message);
        Ok((subject, notification.message.clone(), Some(html)))
    }

    /// 合并邮件头：默认头 < 引擎头 < 消息级覆盖
    fn build_headers(
        &self,
        config: &EmailConfig,
        notification: &Notification,
        recipient: &str,
    ) -> HashMap<String, String> {
        let mut headers = config.default_headers.clone();

        headers.insert(
            "X-Notification-ID".to_string(),
            notification.notification_id.clone(),
        );
        let priority = match notification.priority {
            Priority::Critical => "1 (Highest)",
            Priority::High => "2 (High)",
            Priority::Normal => "3 (Normal)",
            Priority::Low => "5 (Lowest)",
        };
        headers.insert("X-Priority".to_string(), priority.to_string());

        if let Some(list_id) = &notification.metadata.list_id {
            headers.insert("List-Id".to_string(), format!("<{}>", list_id));
            headers.insert(
                "List-Unsubscribe".to_string(),
                format!(
                    "<{}/unsubscribe/{}?r={}>",
                    config.tracking_base_url,
                    notification.notification_id,
                    urlencoding::encode(recipient)
                ),
            );
        }

        // 消息级覆盖：metadata.extra.headers 中的字符串键值
        if let Some(serde_json::Value::Object(overrides)) = notification.metadata.extra.get("headers")
        {
            for (name, value) in overrides {
                if let serde_json::Value::String(value) = value {
                    headers.insert(name.clone(), value.clone());
                }
            }
        }

        headers
    }

    /// 注入追踪：链接重写 → 打开像素 → 退订链接
    ///
    /// 三者各受独立开关控制，且只在存在 HTML 正文时生效；
    /// 纯文本正文永不改写。链接重写必须先做，否则会把自己注入的
    /// 追踪 URL 再包一层。
    fn apply_tracking(
        &self,
        config: &EmailConfig,
        notification: &Notification,
        recipient: &str,
        html: String,
    ) -> String {
        let base = config.tracking_base_url.trim_end_matches('/');
        let nid = &notification.notification_id;
        let mut html = html;

        if config.track_clicks {
            html = self
                .link_regex
                .replace_all(&html, |caps: &regex::Captures| {
                    format!(
                        r#"href="{}/click/{}?url={}""#,
                        base,
                        nid,
                        urlencoding::encode(&caps[1])
                    )
                })
                .into_owned();
        }

        if config.track_opens {
            let pixel = format!(
                r#"<img src="{}/open/{}.gif" width="1" height="1" alt="" style="display:none"/>"#,
                base, nid
            );
            html = insert_before_body_end(html, &pixel);
        }

        if config.track_unsubscribe {
            let link = format!(
                r#"<p style="font-size:12px;color:#888"><a href="{}/unsubscribe/{}?r={}">退订此类邮件</a></p>"#,
                base,
                nid,
                urlencoding::encode(recipient)
            );
            html = insert_before_body_end(html, &link);
        }

        html
    }

    /// 发送主流程（传输前的拒绝以 Err 上浮，由 send_notification 收敛）
    async fn deliver(
        &self,
        notification: &Notification,
        options: &SendOptions,
        start: Instant,
    ) -> Result<DeliveryResult> {
        let config = self.config.load_full();

        if !config.enabled {
            return Err(NotifyError::Configuration("Email 渠道已禁用".to_string()));
        }
        if notification.is_expired(Utc::now()) {
            return Err(NotifyError::Validation("通知已过期".to_string()));
        }

        let recipient = self.resolve_recipient(notification).await?;

        // 限流（快速失败，不产生任何部分发送）：全局每秒 + 可选的单收件人每日
        let windows = [
            RateWindow::global("second", config.per_second_limit, 1),
            RateWindow::per_recipient("daily", config.per_recipient_daily_limit, 86_400),
        ];
        if let Err(err) = self
            .runtime
            .limiter
            .check(ChannelType::Email, &windows, &recipient)
            .await
        {
            if matches!(err, NotifyError::RateLimited { .. }) {
                self.runtime.events.publish(EngineEvent::RateLimited {
                    channel: ChannelType::Email,
                    scope: err.code(),
                    timestamp: Utc::now(),
                });
            }
            return Err(err);
        }

        // 静态黑白名单
        if !allowed_by_patterns(&recipient, &config.blocklist, &config.allowlist) {
            return Err(NotifyError::Suppressed {
                channel: "email".to_string(),
                reason: SuppressionReason::ManualBlock.as_str().to_string(),
            });
        }

        // 抑制名单检查（命中即短路，零传输调用）
        if self
            .runtime
            .suppression
            .is_suppressed(ChannelType::Email, &recipient)
            .await?
        {
            let reason = self
                .runtime
                .suppression
                .entry(ChannelType::Email, &recipient)
                .await?
                .map(|e| e.reason.as_str().to_string())
                .unwrap_or_else(|| SuppressionReason::ManualBlock.as_str().to_string());
            self.runtime.events.publish(EngineEvent::Suppressed {
                channel: ChannelType::Email,
                recipient_key: recipient.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return Err(NotifyError::Suppressed {
                channel: "email".to_string(),
                reason,
            });
        }

        // 渲染与追踪注入
        let (subject, text_body, html_body) =
            self.render_content(notification, &recipient, options).await?;
        let html_body = html_body
            .map(|html| self.apply_tracking(&config, notification, &recipient, html));

        let message = EmailMessage {
            to: recipient.clone(),
            from: format!("{} <{}>", config.from_name, config.from_address),
            subject,
            text_body,
            html_body,
            headers: self.build_headers(&config, notification, &recipient),
        };

        // 传输：超时约束 + 瞬时错误重试
        self.runtime
            .metrics
            .record(ChannelType::Email, MetricEvent::Sent)
            .await?;

        let policy = RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        };
        let transport = self.transport.clone();
        let (outcome, attempts) = retry_with_policy(
            &policy,
            "email_send",
            |e| e.is_retryable(),
            || {
                let transport = transport.clone();
                let message = message.clone();
                let timeout_ms = config.timeout_ms;
                async move {
                    with_timeout(ChannelType::Email, timeout_ms, async move {
                        transport.send(&message).await.map_err(|e| {
                            let permanent = e.is_permanent();
                            NotifyError::Transport {
                                code: e
                                    .code
                                    .map(|c| format!("SMTP_{}", c))
                                    .unwrap_or_else(|| "PROVIDER_ERROR".to_string()),
                                message: e.message,
                                permanent,
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
            Ok(receipt) => {
                self.runtime
                    .metrics
                    .record(ChannelType::Email, MetricEvent::Delivered)
                    .await?;
                Ok(DeliveryResult::delivered(
                    notification.notification_id.clone(),
                    ChannelType::Email,
                    attempts,
                    Some(receipt.message_id),
                    duration_ms,
                )
                .with_detail(DeliveryDetail::Email {
                    envelope_from: config.from_address.clone(),
                    accepted: receipt.accepted,
                    rejected: receipt.rejected,
                }))
            }
            Err(err) => {
                self.runtime
                    .metrics
                    .record(ChannelType::Email, MetricEvent::Failed)
                    .await?;
                // 永久传输失败视为硬退信，地址进入抑制名单
                if err.is_permanent() {
                    self.handle_bounce(&recipient, BounceType::Hard, &err.to_string())
                        .await?;
                }
                Ok(DeliveryResult::failed(
                    notification.notification_id.clone(),
                    ChannelType::Email,
                    attempts,
                    DeliveryError::from(&err),
                    duration_ms,
                ))
            }
        }
    }

    // ==================== 回执处理 ====================

    /// 处理退信回执
    ///
    /// 硬退信：写抑制条目（同时进入渠道总拉黑集合）；
    /// 软退信：只在带 TTL 的计数器上记一笔，不抑制。
    pub async fn handle_bounce(
        &self,
        recipient: &str,
        bounce_type: BounceType,
        reason: &str,
    ) -> Result<()> {
        let recipient = recipient.trim().to_lowercase();
        match bounce_type {
            BounceType::Hard => {
                self.runtime
                    .suppression
                    .suppress(&SuppressionEntry::new(
                        ChannelType::Email,
                        recipient.clone(),
                        SuppressionReason::HardBounce,
                    ))
                    .await?;
                self.runtime
                    .metrics
                    .record(ChannelType::Email, MetricEvent::Bounced)
                    .await?;
            }
            BounceType::Soft => {
                self.runtime
                    .store
                    .incr(&StoreKey::email_soft_bounce(&recipient), 1)
                    .await?;
                self.runtime
                    .store
                    .expire(
                        &StoreKey::email_soft_bounce(&recipient),
                        std::time::Duration::from_secs(7 * 24 * 3600),
                    )
                    .await?;
                self.runtime
                    .metrics
                    .record(ChannelType::Email, MetricEvent::SoftBounced)
                    .await?;
            }
        }

        warn!(recipient = %recipient, ?bounce_type, reason, "收到退信回执");
        self.runtime.events.publish(EngineEvent::EmailBounce {
            recipient,
            hard: bounce_type == BounceType::Hard,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// 处理投诉回执（收件人标记为垃圾邮件）
    pub async fn handle_complaint(&self, recipient: &str) -> Result<()> {
        let recipient = recipient.trim().to_lowercase();
        self.runtime
            .suppression
            .suppress(&SuppressionEntry::new(
                ChannelType::Email,
                recipient.clone(),
                SuppressionReason::Complaint,
            ))
            .await?;
        self.runtime
            .metrics
            .record(ChannelType::Email, MetricEvent::Complained)
            .await?;
        self.runtime.events.publish(EngineEvent::EmailComplaint {
            recipient,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// 处理退订
    pub async fn handle_opt_out(&self, recipient: &str) -> Result<()> {
        let recipient = recipient.trim().to_lowercase();
        self.runtime
            .suppression
            .suppress(&SuppressionEntry::new(
                ChannelType::Email,
                recipient.clone(),
                SuppressionReason::Unsubscribed,
            ))
            .await?;
        self.runtime.events.publish(EngineEvent::OptOut {
            channel: ChannelType::Email,
            recipient_key: recipient,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// 处理重新订阅（唯一的抑制解除路径）
    pub async fn handle_opt_in(&self, recipient: &str) -> Result<bool> {
        let recipient = recipient.trim().to_lowercase();
        let removed = self
            .runtime
            .suppression
            .opt_in(ChannelType::Email, &recipient)
            .await?;
        self.runtime.events.publish(EngineEvent::OptIn {
            channel: ChannelType::Email,
            recipient_key: recipient,
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// 收件人的软退信累计（运营排查用）
    pub async fn soft_bounce_count(&self, recipient: &str) -> Result<i64> {
        let recipient = recipient.trim().to_lowercase();
        Ok(self
            .runtime
            .store
            .get(&StoreKey::email_soft_bounce(&recipient))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

/// 在 `</body>` 前插入片段，无 `</body>` 时追加到末尾
fn insert_before_body_end(html: String, fragment: &str) -> String {
    match html.rfind("</body>").or_else(|| html.rfind("</BODY>")) {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + fragment.len());
            out.push_str(&html[..pos]);
            out.push_str(fragment);
            out.push_str(&html[pos..]);
            out
        }
        None => format!("{}{}", html, fragment),
    }
}

#[async_trait]
impl Channel for EmailAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn name(&self) -> &str {
        "Email"
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
                // 传输前的拒绝：分类计数后转为失败结果
                let metric = match &err {
                    NotifyError::RateLimited { .. } => MetricEvent::RateLimited,
                    NotifyError::Suppressed { .. } => MetricEvent::Suppressed,
                    _ => MetricEvent::Failed,
                };
                let _ = self.runtime.metrics.record(ChannelType::Email, metric).await;
                DeliveryResult::rejected(
                    notification.notification_id.clone(),
                    ChannelType::Email,
                    &err,
                )
            }
        };

        self.runtime.finalize(notification, result).await
    }

    async fn get_metrics(&self, period: MetricsPeriod) -> Result<ChannelMetrics> {
        self.runtime.metrics.snapshot(ChannelType::Email, period).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::template::{TemplateDefinition, VariableTemplateRenderer};
    use notify_shared::events::EventBus;
    use notify_shared::store::MemoryStore;
    use std::time::Duration;

    fn test_runtime() -> ChannelRuntime {
        ChannelRuntime::new(
            MemoryStore::shared(),
            EventBus::default(),
            Duration::from_secs(3600),
        )
    }

    fn test_adapter_with(config: EmailConfig) -> EmailAdapter {
        let directory = StaticDirectory::new();
        directory.insert("user-1", ChannelType::Email, "user1@example.com");
        EmailAdapter::new(
            config,
            test_runtime(),
            Arc::new(directory),
            Arc::new(VariableTemplateRenderer::new()),
            Arc::new(SimulatedEmailTransport),
        )
        .unwrap()
    }

    fn test_adapter() -> EmailAdapter {
        test_adapter_with(EmailConfig::default())
    }

    #[tokio::test]
    async fn test_send_resolves_address_from_directory() {
        let adapter = test_adapter();
        let notification = Notification::new("user-1", "welcome", "欢迎", "欢迎加入");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        match &result.detail {
            DeliveryDetail::Email { accepted, .. } => {
                assert_eq!(accepted, &vec!["user1@example.com".to_string()]);
            }
            other => panic!("期望 Email 明细，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_metadata_email_overrides_directory() {
        let adapter = test_adapter();
        let notification = Notification::new("user-1", "welcome", "欢迎", "欢迎加入")
            .with_recipient_email("Override@Example.COM");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        match &result.detail {
            DeliveryDetail::Email { accepted, .. } => {
                // 地址规范化为小写
                assert_eq!(accepted, &vec!["override@example.com".to_string()]);
            }
            other => panic!("期望 Email 明细，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_address_fails_without_transport() {
        let adapter = test_adapter();
        let notification = Notification::new("nobody", "welcome", "欢迎", "欢迎加入");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.error_code(), Some("ADDRESS_UNRESOLVABLE"));
    }

    #[tokio::test]
    async fn test_suppressed_recipient_short_circuits() {
        let adapter = test_adapter();
        adapter.handle_opt_out("user1@example.com").await.unwrap();

        let notification = Notification::new("user-1", "promo", "活动", "大促开始");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 0); // 零传输调用
        assert_eq!(result.error_code(), Some("SUPPRESSED_UNSUBSCRIBED"));
        assert!(!result.error.as_ref().unwrap().retryable);

        // opt-in 后恢复
        assert!(adapter.handle_opt_in("user1@example.com").await.unwrap());
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_hard_bounce_suppresses_soft_does_not() {
        let adapter = test_adapter();

        adapter
            .handle_bounce("soft@example.com", BounceType::Soft, "mailbox full")
            .await
            .unwrap();
        assert_eq!(adapter.soft_bounce_count("soft@example.com").await.unwrap(), 1);

        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("soft@example.com");
        // 软退信不抑制：传输前检查通过（模拟传输对该地址直接成功）
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(result.success);

        adapter
            .handle_bounce("hard@example.com", BounceType::Hard, "550 user unknown")
            .await
            .unwrap();
        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("hard@example.com");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("SUPPRESSED_HARD_BOUNCE"));
    }

    #[tokio::test]
    async fn test_permanent_transport_error_triggers_suppression() {
        let adapter = test_adapter();
        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("bounce-now@example.com");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1); // 永久错误不重试
        assert!(result.error.as_ref().unwrap().permanent);

        // 地址已进入抑制名单，下一次发送零传输
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert_eq!(result.error_code(), Some("SUPPRESSED_HARD_BOUNCE"));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_transient_error_retries() {
        let adapter = test_adapter();
        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("greylist@example.com");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;

        assert!(!result.success);
        // 默认 max_retries = 2，共 3 次尝试
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_ref().unwrap().retryable);
    }

    #[tokio::test]
    async fn test_template_render_failure_reported_per_item() {
        let mut renderer = crate::template::MockRenderer::new();
        renderer.expect_render().returning(|template_id, _, _| {
            Err(NotifyError::Template {
                template_id: template_id.to_string(),
                message: "模板不存在".to_string(),
            })
        });

        let adapter = EmailAdapter::new(
            EmailConfig::default(),
            test_runtime(),
            Arc::new(StaticDirectory::new()),
            Arc::new(renderer),
            Arc::new(SimulatedEmailTransport),
        )
        .unwrap();

        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("a@example.com")
            .with_template("missing");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("TEMPLATE_ERROR"));
        assert_eq!(result.attempts, 0);

        // options.template = false 时跳过渲染，发送走纯文本回落
        let result = adapter
            .send_notification(&notification, &SendOptions::without_template())
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_static_blocklist() {
        let adapter = test_adapter_with(EmailConfig {
            blocklist: vec!["@blocked.com".to_string()],
            ..EmailConfig::default()
        });
        let notification = Notification::new("u", "t", "标题", "内容")
            .with_recipient_email("x@blocked.com");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert_eq!(result.error_code(), Some("SUPPRESSED_MANUAL_BLOCK"));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_tracking_injection_end_to_end() {
        let runtime = test_runtime();
        let renderer = VariableTemplateRenderer::new();
        renderer.register(
            "promo",
            TemplateDefinition {
                subject: Some("春季大促".to_string()),
                body: "查看 https://shop.example.com/sale".to_string(),
                html_body: Some(
                    r#"<html><body><p>点击 <a href="https://shop.example.com/sale">活动页</a> 或 <a href="http://shop.example.com/old">旧入口</a></p></body></html>"#
                        .to_string(),
                ),
                ..TemplateDefinition::default()
            },
        );

        let transport = Arc::new(CapturingTransport::default());
        let adapter = EmailAdapter::new(
            EmailConfig {
                track_opens: true,
                track_clicks: true,
                track_unsubscribe: true,
                tracking_base_url: "https://t.example.com".to_string(),
                ..EmailConfig::default()
            },
            runtime,
            Arc::new(StaticDirectory::new()),
            Arc::new(renderer),
            transport.clone(),
        )
        .unwrap();

        let notification = Notification::new("u", "promo", "春季大促", "查看活动")
            .with_recipient_email("buyer@example.com")
            .with_template("promo");
        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(result.success);

        let message = transport.last_message().expect("应捕获到邮件");
        let html = message.html_body.as_deref().unwrap();

        // 恰好一个打开像素
        assert_eq!(html.matches("/open/").count(), 1);
        // 所有原始 http(s) 链接被重写
        assert!(!html.contains(r#"href="https://shop.example.com/sale""#));
        assert!(!html.contains(r#"href="http://shop.example.com/old""#));
        assert_eq!(html.matches("/click/").count(), 2);
        // 恰好一个退订链接
        assert_eq!(html.matches("/unsubscribe/").count(), 1);
        // 纯文本正文未被改写
        assert_eq!(message.text_body, "查看 https://shop.example.com/sale");
    }

    #[tokio::test]
    async fn test_tracking_disabled_leaves_html_untouched() {
        let adapter = test_adapter();
        let notification = Notification::new("user-1", "t", "标题", "内容");

        let result = adapter
            .send_notification(&notification, &SendOptions::default())
            .await;
        assert!(result.success);
        // 默认配置三个开关全关——只验证发送成功即可
    }

    #[tokio::test]
    async fn test_headers_merge_and_override() {
        let mut default_headers = HashMap::new();
        default_headers.insert("X-Mailer".to_string(), "notify".to_string());
        let adapter = test_adapter_with(EmailConfig {
            default_headers,
            ..EmailConfig::default()
        });
        let config = adapter.config.load_full();

        let notification = Notification::new("u", "t", "标题", "内容")
            .with_priority(Priority::Critical)
            .with_data(
                "headers",
                serde_json::json!({"X-Mailer": "campaign", "X-Campaign": "spring"}),
            );
        let mut notification = notification;
        notification.metadata.list_id = Some("news.example.com".to_string());

        let headers = adapter.build_headers(&config, &notification, "user@example.com");

        assert_eq!(headers.get("X-Priority").unwrap(), "1 (Highest)");
        assert_eq!(
            headers.get("X-Notification-ID").unwrap(),
            &notification.notification_id
        );
        // 消息级覆盖默认头
        assert_eq!(headers.get("X-Mailer").unwrap(), "campaign");
        assert_eq!(headers.get("X-Campaign").unwrap(), "spring");
        assert!(headers.contains_key("List-Id"));
        assert!(headers.contains_key("List-Unsubscribe"));
    }

    #[tokio::test]
    async fn test_per_recipient_daily_limit() {
        let adapter = test_adapter_with(EmailConfig {
            per_recipient_daily_limit: 2,
            ..EmailConfig::default()
        });

        let mut rejected = 0;
        for _ in 0..3 {
            let notification = Notification::new("u", "t", "标题", "内容")
                .with_recipient_email("rl@example.com");
            let result = adapter
                .send_notification(&notification, &SendOptions::default())
                .await;
            if result.error_code() == Some("RATE_LIMITED") {
                rejected += 1;
            }
        }
        // 日窗口内第 3 条被拒，且拒绝可重试
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn test_plain_to_html_escapes() {
        let html = EmailAdapter::plain_to_html("标题", "a < b & c\n第二行");
        assert!(html.contains("a &lt; b &amp; c"));
        assert!(html.contains("<p>第二行</p>"));
    }

    #[test]
    fn test_insert_before_body_end() {
        let html = "<html><body><p>hi</p></body></html>".to_string();
        let out = insert_before_body_end(html, "<img/>");
        assert_eq!(out, "<html><body><p>hi</p><img/></body></html>");

        let no_body = "<p>hi</p>".to_string();
        assert_eq!(insert_before_body_end(no_body, "<img/>"), "<p>hi</p><img/>");
    }

    #[test]
    fn test_transport_error_classification() {
        let permanent = EmailTransportError {
            code: Some(552),
            message: "552 exceeded storage allocation".to_string(),
        };
        assert!(permanent.is_permanent());

        let by_message = EmailTransportError {
            code: None,
            message: "recipient mailbox unavailable".to_string(),
        };
        assert!(by_message.is_permanent());

        let transient = EmailTransportError {
            code: Some(451),
            message: "451 temporary failure".to_string(),
        };
        assert!(!transient.is_permanent());
    }

    // ==================== 测试辅助 ====================

    /// 捕获最后一封邮件的传输实现
    #[derive(Default)]
    struct CapturingTransport {
        last: parking_lot::Mutex<Option<EmailMessage>>,
    }

    impl CapturingTransport {
        fn last_message(&self) -> Option<EmailMessage> {
            self.last.lock().clone()
        }
    }

    #[async_trait]
    impl EmailTransport for CapturingTransport {
        async fn send(
            &self,
            message: &EmailMessage,
        ) -> std::result::Result<EmailReceipt, EmailTransportError> {
            *self.last.lock() = Some(message.clone());
            Ok(EmailReceipt {
                message_id: "captured".to_string(),
                accepted: vec![message.to.clone()],
                rejected: Vec::new(),
            })
        }
    }
}
