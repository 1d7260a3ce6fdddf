//! 实时通道
//!
//! 站内信渠道的外部协作方：向已建立连接的用户推送事件。
//! 契约只有两个操作——连接检查与事件下发；
//! WebSocket / SSE 等具体承载由宿主系统实现。

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use notify_shared::error::Result;

/// 实时传输抽象
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// 用户当前是否有活跃连接
    async fn is_user_connected(&self, user_id: &str) -> bool;

    /// 向用户的所有活跃连接下发事件
    ///
    /// 成功仅代表事件已写入连接，不代表客户端确认收到。
    async fn emit_to_user(
        &self,
        user_id: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<()>;
}

/// 内存实时集线器
///
/// 记录"在线"用户并缓存下发的事件，用于测试和单进程开发环境。
#[derive(Default)]
pub struct InMemoryRealtimeHub {
    connected: DashMap<String, ()>,
    emitted: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl InMemoryRealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记用户上线
    pub fn connect(&self, user_id: impl Into<String>) {
        self.connected.insert(user_id.into(), ());
    }

    /// 标记用户下线
    pub fn disconnect(&self, user_id: &str) {
        self.connected.remove(user_id);
    }

    /// 取出截至目前下发过的事件（测试断言用）
    pub fn emitted_events(&self) -> Vec<(String, String, serde_json::Value)> {
        self.emitted.lock().clone()
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryRealtimeHub {
    async fn is_user_connected(&self, user_id: &str) -> bool {
        self.connected.contains_key(user_id)
    }

    async fn emit_to_user(
        &self,
        user_id: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.emitted
            .lock()
            .push((user_id.to_string(), event_name.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mockall::mock! {
    pub Realtime {}

    #[async_trait]
    impl RealtimeTransport for Realtime {
        async fn is_user_connected(&self, user_id: &str) -> bool;
        async fn emit_to_user(
            &self,
            user_id: &str,
            event_name: &str,
            payload: serde_json::Value,
        ) -> Result<()>;
    }
}
