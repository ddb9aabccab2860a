//! telemetry - 可观测性库

use guard_config::TelemetryConfig;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// 初始化 tracing
///
/// 已有全局 subscriber 时返回 false
pub fn init_tracing(log_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}

/// 按配置选择输出格式
pub fn init(log_level: &str, json: bool) -> bool {
    if json {
        init_tracing_json(log_level)
    } else {
        init_tracing(log_level)
    }
}

/// 按 `[telemetry]` 配置初始化
pub fn init_from(config: &TelemetryConfig) -> bool {
    init(&config.log_level, config.json)
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
