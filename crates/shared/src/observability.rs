//! 可观测性模块
//!
//! 初始化 tracing 日志（EnvFilter + json/pretty 格式），并注册引擎的
//! 业务指标描述。指标走 metrics facade——recorder/exporter 由宿主服务
//! 自行安装，未安装时所有指标宏都是空操作。

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ObservabilityConfig;

/// 初始化日志
///
/// 环境变量 RUST_LOG 优先于配置中的 log_level。
/// 重复初始化（常见于测试）返回错误，由调用方决定是否忽略。
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// 注册引擎指标描述
///
/// 描述会出现在 exporter 的 HELP 注释中。各适配器通过
/// `metrics::counter!` 按渠道 / 结果打标签上报。
pub fn describe_metrics() {
    metrics::describe_counter!(
        "notify_deliveries_total",
        "Total delivery attempts by channel and outcome"
    );
    metrics::describe_histogram!(
        "notify_delivery_duration_seconds",
        "Delivery duration in seconds by channel"
    );
    metrics::describe_counter!(
        "notify_suppressed_total",
        "Sends short-circuited by suppression, by channel and reason"
    );
    metrics::describe_counter!(
        "notify_rate_limited_total",
        "Sends rejected by rate limiting, by channel and window"
    );
    metrics::describe_counter!(
        "notify_tokens_registered_total",
        "Push token registrations by platform"
    );
    metrics::describe_counter!(
        "notify_tokens_disabled_total",
        "Push tokens disabled by failure handling"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_metrics_without_recorder() {
        // 未安装 recorder 时注册描述应当是空操作，不会 panic
        describe_metrics();
    }
}
