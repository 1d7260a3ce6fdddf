//! 事件模型与事件总线
//!
//! 定义投递引擎对外发布的事件模型，以及进程内的订阅分发机制。
//! 适配器在每次状态变更（投递、抑制、token 生命周期、已读等）时发布事件，
//! 外部观察者通过 [`EventBus::subscribe`] 订阅。
//!
//! 发布方对订阅者数量没有假设：零订阅者时发布是空操作，
//! 任何渠道契约的正确性都不依赖事件被消费。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

// ---------------------------------------------------------------------------
// ChannelType — 渠道类型枚举
// ---------------------------------------------------------------------------

/// 通知渠道类型
///
/// 每个渠道对应一个适配器实现，各自拥有独立的传输语义、
/// 失败模式与收件人同意规则。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
    InApp,
}

impl ChannelType {
    /// 渠道标识（小写，用于存储 key 和指标标签）
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::InApp => "in_app",
        }
    }

    pub fn all() -> [ChannelType; 4] {
        [Self::Email, Self::Sms, Self::Push, Self::InApp]
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EngineEvent — 引擎事件
// ---------------------------------------------------------------------------

/// 引擎对外发布的事件
///
/// 事件携带的收件人标识一律是渠道内的 recipient key
/// （email 地址小写、规范化手机号、user_id），不携带消息正文。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// 单次投递完成（成功或失败）
    DeliveryCompleted {
        channel: ChannelType,
        notification_id: String,
        user_id: String,
        success: bool,
        error_code: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// 发送被抑制名单拦截
    Suppressed {
        channel: ChannelType,
        recipient_key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// 发送被限流拦截
    RateLimited {
        channel: ChannelType,
        scope: String,
        timestamp: DateTime<Utc>,
    },
    /// 邮件退信（hard 为 true 表示硬退信，已触发抑制）
    EmailBounce {
        recipient: String,
        hard: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// 邮件投诉（标记为垃圾邮件）
    EmailComplaint {
        recipient: String,
        timestamp: DateTime<Utc>,
    },
    /// 收件人退订
    OptOut {
        channel: ChannelType,
        recipient_key: String,
        timestamp: DateTime<Utc>,
    },
    /// 收件人重新订阅（唯一的抑制解除路径）
    OptIn {
        channel: ChannelType,
        recipient_key: String,
        timestamp: DateTime<Utc>,
    },
    /// 设备 token 注册（新增或刷新）
    TokenRegistered {
        user_id: String,
        platform: String,
        refreshed: bool,
        timestamp: DateTime<Utc>,
    },
    /// 设备 token 被禁用（连续失败或永久失效）
    TokenDisabled {
        user_id: String,
        platform: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// 超出单用户上限，最旧 token 被淘汰
    TokenEvicted {
        user_id: String,
        platform: String,
        timestamp: DateTime<Utc>,
    },
    /// 站内信被标记已读
    NotificationRead {
        user_id: String,
        notification_id: String,
        timestamp: DateTime<Utc>,
    },
    /// 站内信被删除（用户主动）
    NotificationDismissed {
        user_id: String,
        notification_id: String,
        timestamp: DateTime<Utc>,
    },
    /// 站内信过期被清理
    NotificationExpired {
        user_id: String,
        notification_id: String,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// EventBus — 进程内事件总线
// ---------------------------------------------------------------------------

/// 进程内事件总线
///
/// 基于 `tokio::sync::broadcast`：发布端不阻塞，慢订阅者丢最旧事件
/// （broadcast 的 lagged 语义）。事件不承诺可靠送达——需要可靠性的
/// 消费方应依赖投递记录而非事件流。
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// 创建事件总线，`capacity` 为每个订阅者的缓冲上限
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件
    ///
    /// 没有订阅者时 broadcast 返回错误，这里静默忽略——
    /// 引擎行为不因订阅者存在与否而变化。
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            debug!("事件无订阅者，已丢弃");
        }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
