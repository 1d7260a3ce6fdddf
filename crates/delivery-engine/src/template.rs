//! 模板渲染
//!
//! 外部协作方：给定模板 ID、个性化上下文与目标渠道，返回渲染后的
//! 主题 / 标题 / 正文 / HTML。引擎把渲染当作不透明调用——
//! [`TemplateRenderer`] trait 是唯一的依赖面。
//!
//! 同时提供一个内置的 [`VariableTemplateRenderer`]：`{{variable}}`
//! 语法的变量替换实现，够用作默认渲染器和测试替身；
//! 需要完整模板语言的宿主系统注入自己的实现即可。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use notify_shared::error::{NotifyError, Result};
use notify_shared::events::ChannelType;

// ---------------------------------------------------------------------------
// 渲染契约
// ---------------------------------------------------------------------------

/// 个性化上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalizationContext {
    pub user: ContextUser,
    pub context: ContextInfo,
    /// 任意业务数据，模板内按键引用
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub timestamp: DateTime<Utc>,
    pub timezone: String,
    pub locale: String,
}

impl PersonalizationContext {
    /// 以用户 ID 和业务数据构建默认上下文
    pub fn new(user_id: impl Into<String>, data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            user: ContextUser {
                id: user_id.into(),
                email: None,
                name: None,
            },
            context: ContextInfo {
                timestamp: Utc::now(),
                timezone: "UTC".to_string(),
                locale: "zh-CN".to_string(),
            },
            data,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.user.email = Some(email.into());
        self
    }
}

/// 渲染结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedTemplate {
    /// 邮件主题（邮件渠道使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// 标题（push / 站内信使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 纯文本正文
    pub body: String,
    /// HTML 正文（邮件渠道使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
}

/// 模板渲染器抽象
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// 渲染模板
    ///
    /// 模板不存在或渲染失败返回 `NotifyError::Template`，
    /// 适配器将其按不可重试的单条失败上报。
    async fn render(
        &self,
        template_id: &str,
        context: &PersonalizationContext,
        channel: ChannelType,
    ) -> Result<RenderedTemplate>;
}

// ---------------------------------------------------------------------------
// VariableTemplateRenderer — 内置变量替换实现
// ---------------------------------------------------------------------------

/// 模板定义
#[derive(Debug, Clone, Default)]
pub struct TemplateDefinition {
    pub subject: Option<String>,
    pub title: Option<String>,
    pub body: String,
    pub html_body: Option<String>,
}

/// 内置变量替换渲染器
///
/// 支持 `{{variable}}` 语法；变量取值顺序：data 内的键 > 内置用户字段
/// （user_id / user_email / user_name）。未知变量保留原样并记录告警。
/// 可按 (模板, 渠道) 注册渠道特化版本，未命中时回落到通用版本。
pub struct VariableTemplateRenderer {
    templates: DashMap<String, TemplateDefinition>,
    channel_templates: DashMap<(String, ChannelType), TemplateDefinition>,
    variable_regex: Regex,
}

impl Default for VariableTemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableTemplateRenderer {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            channel_templates: DashMap::new(),
            // 匹配 {{variable_name}} 格式，变量名支持字母、数字、下划线
            variable_regex: Regex::new(r"\{\{(\w+)\}\}").unwrap(),
        }
    }

    /// 注册通用模板
    pub fn register(&self, template_id: impl Into<String>, definition: TemplateDefinition) {
        self.templates.insert(template_id.into(), definition);
    }

    /// 注册渠道特化模板
    pub fn register_for_channel(
        &self,
        template_id: impl Into<String>,
        channel: ChannelType,
        definition: TemplateDefinition,
    ) {
        self.channel_templates
            .insert((template_id.into(), channel), definition);
    }

    /// 变量替换
    fn substitute(&self, template: &str, context: &PersonalizationContext) -> String {
        self.variable_regex
            .replace_all(template, |caps: &regex::Captures| {
                let name = &caps[1];
                if let Some(value) = context.data.get(name) {
                    return match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                }
                match name {
                    "user_id" => context.user.id.clone(),
                    "user_email" => context.user.email.clone().unwrap_or_default(),
                    "user_name" => context.user.name.clone().unwrap_or_default(),
                    _ => {
                        warn!(variable = name, "模板变量缺失，保留原样");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    fn lookup(&self, template_id: &str, channel: ChannelType) -> Option<TemplateDefinition> {
        self.channel_templates
            .get(&(template_id.to_string(), channel))
            .map(|d| d.clone())
            .or_else(|| self.templates.get(template_id).map(|d| d.clone()))
    }
}

#[async_trait]
impl TemplateRenderer for VariableTemplateRenderer {
    async fn render(
        &self,
        template_id: &str,
        context: &PersonalizationContext,
        channel: ChannelType,
    ) -> Result<RenderedTemplate> {
        let definition = self.lookup(template_id, channel).ok_or_else(|| {
            NotifyError::Template {
                template_id: template_id.to_string(),
                message: "模板不存在".to_string(),
            }
        })?;

        Ok(RenderedTemplate {
            subject: definition
                .subject
                .as_deref()
                .map(|s| self.substitute(s, context)),
            title: definition
                .title
                .as_deref()
                .map(|t| self.substitute(t, context)),
            body: self.substitute(&definition.body, context),
            html_body: definition
                .html_body
                .as_deref()
                .map(|h| self.substitute(h, context)),
        })
    }
}

#[cfg(test)]
mockall::mock! {
    pub Renderer {}

    #[async_trait]
    impl TemplateRenderer for Renderer {
        async fn render(
            &self,
            template_id: &str,
            context: &PersonalizationContext,
            channel: ChannelType,
        ) -> Result<RenderedTemplate>;
    }
}
