//! 结构化日志初始化
//!
//! 基于 tracing-subscriber，开发环境输出可读文本，生产环境输出 JSON。
//! `RUST_LOG` 优先于配置中的 `log_level`。

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ObservabilityConfig;

/// 构建日志过滤器
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化全局 tracing subscriber
///
/// 重复初始化（如测试中多次调用）返回错误而不是 panic。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let fmt_layer = if config.json_logs {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(build_filter(&config.log_level))
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        // 非法指令不应导致 panic
        let filter = build_filter("not==valid");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn test_second_init_returns_error() {
        let config = ObservabilityConfig::default();
        let first = init(&config);
        let second = init(&config);
        // 至多一次成功
        assert!(first.is_err() || second.is_err());
    }
}
