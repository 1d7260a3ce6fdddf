//! 测试工具模块
//!
//! 提供测试所需的存储构造、配置辅助与唯一 ID 生成器。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::store::{KeyValueStore, MemoryStore};

/// 创建测试用内存存储
pub fn test_store() -> Arc<dyn KeyValueStore> {
    MemoryStore::shared()
}

/// 创建测试用 Redis 配置
///
/// 优先使用环境变量，否则使用本地测试实例的 db 1
pub fn test_redis_config() -> StoreConfig {
    StoreConfig {
        url: std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
        pool_size: 5,
    }
}

/// 生成唯一的测试用户 ID
pub fn test_user_id() -> String {
    format!("test-user-{}", Uuid::new_v4())
}

/// 生成唯一的测试通知 ID
pub fn test_notification_id() -> String {
    format!("test-notif-{}", Uuid::new_v4())
}

/// 生成单调递增的测试序号
///
/// 使用原子计数器确保并行测试时的唯一性
pub fn test_seq() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        assert_ne!(test_user_id(), test_user_id());
        assert_ne!(test_notification_id(), test_notification_id());
    }

    #[test]
    fn test_seq_monotonic() {
        let a = test_seq();
        let b = test_seq();
        assert!(b > a);
    }
}
