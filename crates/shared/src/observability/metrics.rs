//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫
///
/// drop 时终止指标 HTTP 服务。
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig, service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_pipeline_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册投递管道指标的描述，出现在 /metrics 的 HELP 注释中
fn register_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_messages_consumed_total",
        "Total number of messages received from the stream"
    );
    metrics::describe_counter!(
        "notification_dispatch_total",
        "Total number of processed messages by final outcome"
    );
    metrics::describe_counter!(
        "notification_send_attempts_total",
        "Total number of channel send attempts"
    );
    metrics::describe_histogram!(
        "notification_dispatch_duration_seconds",
        "Time from dequeue to acknowledgment in seconds"
    );
    metrics::describe_histogram!(
        "notification_rate_limit_wait_seconds",
        "Time spent waiting for a rate limit token in seconds"
    );
    metrics::describe_counter!(
        "notification_smtp_connections_opened_total",
        "Total number of authenticated SMTP connections opened"
    );
    metrics::describe_counter!(
        "notification_smtp_connections_closed_total",
        "Total number of SMTP connections closed"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务已启动");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务异常退出");
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录从 topic 收到一条消息
#[inline]
pub fn record_message_consumed(topic: &str) {
    metrics::counter!(
        "notification_messages_consumed_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// 记录一条消息的最终处理结果与耗时
#[inline]
pub fn record_dispatch(channel: &str, outcome: &str, duration: Duration) {
    metrics::counter!(
        "notification_dispatch_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_dispatch_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

/// 记录一次渠道发送尝试
#[inline]
pub fn record_send_attempt(channel: &str, status: &str) {
    metrics::counter!(
        "notification_send_attempts_total",
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录限流等待时长
#[inline]
pub fn record_rate_limit_wait(wait: Duration) {
    metrics::histogram!("notification_rate_limit_wait_seconds").record(wait.as_secs_f64());
}

#[inline]
pub fn record_smtp_connection_opened() {
    metrics::counter!("notification_smtp_connections_opened_total").increment(1);
}

#[inline]
pub fn record_smtp_connection_closed() {
    metrics::counter!("notification_smtp_connections_closed_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_message_consumed("email-notifications");
        record_dispatch("email", "delivered", Duration::from_millis(120));
        record_send_attempt("email", "failure");
        record_rate_limit_wait(Duration::from_millis(100));
        record_smtp_connection_opened();
        record_smtp_connection_closed();
    }
}
