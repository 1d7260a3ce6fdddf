//! 多渠道通知投递引擎
//!
//! 接收抽象通知（用户、消息、优先级、可选模板引用），通过 Email、SMS、
//! Push、站内信四个渠道可靠投递。每个渠道实现统一的 [`Channel`] 契约，
//! 并各自处理传输语义、失败分类与收件人同意规则。
//!
//! 横切关注点在适配器之间复用：
//! - [`suppression`]：退订 / 硬退信 / 投诉 / 手动拉黑的抑制名单
//! - [`rate_limit`]：固定窗口限流（按收件人 + 全局多窗口叠加）
//! - [`metrics`]：按渠道的投递指标快照与派生比率
//! - [`delivery_log`]：带 TTL 的投递记录
//!
//! 外部协作方以 trait 注入：收件人目录（[`directory`]）、模板渲染
//! （[`template`]）、实时通道（[`realtime`]）与各渠道的传输实现。

pub mod channels;
pub mod config;
pub mod delivery_log;
pub mod directory;
pub mod keys;
pub mod metrics;
pub mod rate_limit;
pub mod realtime;
pub mod service;
pub mod suppression;
pub mod template;
pub mod token_registry;
pub mod types;

pub use notify_shared::error::{NotifyError, Result};
pub use notify_shared::events::{ChannelType, EngineEvent, EventBus};

pub use channels::{BulkOptions, Channel, ChannelRuntime, SendOptions};
pub use service::DeliveryService;
pub use types::{DeliveryError, DeliveryResult, Notification, Priority};
