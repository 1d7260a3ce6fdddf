//! 收件人目录
//!
//! 外部协作方：把用户 ID 解析为渠道内的收件地址（邮箱、手机号）。
//! 引擎只依赖 [`RecipientDirectory`] trait；宿主系统注入自己的实现。

use async_trait::async_trait;
use dashmap::DashMap;

use notify_shared::error::Result;
use notify_shared::events::ChannelType;

/// 收件人目录抽象
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// 解析用户在指定渠道的收件地址
    ///
    /// 返回 None 表示用户未绑定该渠道的地址——适配器据此产生
    /// 不可重试的地址解析失败，而不是向传输层透传空地址。
    async fn resolve_address(&self, user_id: &str, channel: ChannelType) -> Result<Option<String>>;
}

/// 静态收件人目录
///
/// 基于 DashMap 的内存实现，用于测试和开发环境；
/// 生产环境由宿主的用户服务实现 trait。
#[derive(Default)]
pub struct StaticDirectory {
    entries: DashMap<(String, ChannelType), String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记用户地址
    pub fn insert(
        &self,
        user_id: impl Into<String>,
        channel: ChannelType,
        address: impl Into<String>,
    ) {
        self.entries
            .insert((user_id.into(), channel), address.into());
    }

    pub fn remove(&self, user_id: &str, channel: ChannelType) {
        self.entries.remove(&(user_id.to_string(), channel));
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn resolve_address(&self, user_id: &str, channel: ChannelType) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(&(user_id.to_string(), channel))
            .map(|v| v.clone()))
    }
}

#[cfg(test)]
mockall::mock! {
    pub Directory {}

    #[async_trait]
    impl RecipientDirectory for Directory {
        async fn resolve_address(
            &self,
            user_id: &str,
            channel: ChannelType,
        ) -> Result<Option<String>>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_resolve() {
        let directory = StaticDirectory::new();
        directory.insert("user-1", ChannelType::Email, "user1@example.com");
        directory.insert("user-1", ChannelType::Sms, "+8613800138000");

        assert_eq!(
            directory
                .resolve_address("user-1", ChannelType::Email)
                .await
                .unwrap(),
            Some("user1@example.com".to_string())
        );
        assert_eq!(
            directory
                .resolve_address("user-1", ChannelType::Push)
                .await
                .unwrap(),
            None
        );

        directory.remove("user-1", ChannelType::Email);
        assert_eq!(
            directory
                .resolve_address("user-1", ChannelType::Email)
                .await
                .unwrap(),
            None
        );
    }
}
