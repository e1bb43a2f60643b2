//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。
//! 投递管道没有入站 RPC，不做分布式追踪上下文传播，只输出结构化日志。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有指标 HTTP 服务的生命周期，drop 时停止该服务。
pub struct ObservabilityGuard {
    metrics_handle: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    #[cfg(test)]
    fn empty() -> Self {
        Self {
            metrics_handle: None,
        }
    }

    /// 指标服务是否在运行
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_handle.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if self.metrics_handle.take().is_some() {
            info!("可观测性组件已关闭");
        }
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（结构化日志）
/// 2. Metrics（Prometheus 指标，可通过配置关闭）
///
/// # Example
///
/// ```ignore
/// use notify_shared::{config::AppConfig, observability};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::load("notification-worker")?;
///     let _guard = observability::init(&config.observability, &config.service_name).await?;
///
///     // 应用逻辑...
///
///     Ok(())
/// }
/// ```
pub async fn init(config: &ObservabilityConfig, service_name: &str) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    info!(
        service = %service_name,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        json_logs = config.json_logs,
        "可观测性初始化完成"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init(config, service_name).await?)
    } else {
        None
    };

    Ok(ObservabilityGuard { metrics_handle })
}
