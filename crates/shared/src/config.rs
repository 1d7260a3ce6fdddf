//! 配置管理模块
//!
//! 支持多格式配置文件加载、环境变量覆盖，以及类型安全的配置访问。
//! 运行时变更只走 [`DynamicConfig::reconfigure`] 一条路径——
//! 任何组件都不得在别处偷改配置。

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::info;

/// 键值存储配置
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 从配置文件和环境变量加载配置
///
/// 加载顺序（后加载的会覆盖先加载的同名配置项）：
/// 1. config/default.toml（默认配置）
/// 2. config/{environment}.toml（环境特定配置，环境取自 NOTIFY_ENV）
/// 3. 环境变量（NOTIFY 前缀，双下划线分隔，如 NOTIFY__STORE__URL -> store.url）
///
/// 所有配置结构体都带 serde 默认值，缺失的文件不会导致加载失败。
pub fn load_config<T: DeserializeOwned>() -> Result<T, ConfigError> {
    let env = std::env::var("NOTIFY_ENV").unwrap_or_else(|_| "development".to_string());
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

    let builder = Config::builder()
        .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
        .add_source(
            File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
        )
        .add_source(
            Environment::with_prefix("NOTIFY")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}

// ===========================================================================
// DynamicConfig — 显式 reconfigure 的动态配置容器
// ===========================================================================

/// 动态配置容器
///
/// 使用 `ArcSwap` 实现近零开销的读取（仅一次原子 load），
/// 配合 `watch` channel 让消费方异步等待配置变更通知。
/// 写入只有 [`reconfigure`](Self::reconfigure) 一个入口。
pub struct DynamicConfig<T> {
    /// 当前配置快照，读取端通过 ArcSwap::load 获取（无锁）
    current: Arc<ArcSwap<T>>,
    /// 配置变更通知 channel 的发送端
    tx: watch::Sender<Arc<T>>,
}

impl<T> DynamicConfig<T> {
    pub fn new(initial: T) -> Self {
        let initial = Arc::new(initial);
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            current: Arc::new(ArcSwap::from(initial)),
            tx,
        }
    }

    /// 获取当前配置快照
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// 替换配置
    ///
    /// 同时更新 ArcSwap 快照和 watch channel。已经持有旧快照的调用方
    /// 继续使用旧值直到下一次 load——单次发送内配置是一致的。
    pub fn reconfigure(&self, next: T) {
        let next = Arc::new(next);
        self.current.store(next.clone());
        let _ = self.tx.send(next);
        info!("配置已更新");
    }

    /// 订阅配置变更通知
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            tx: self.tx.clone(),
        }
    }
}
