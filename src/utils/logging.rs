//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 初始化全局 tracing 订阅器
///
/// 优先使用 `RUST_LOG` 环境变量，未设置时使用 `default_directive`（如 `"info"`、
/// `"flare_discovery=debug"`）。重复调用是安全的，已安装订阅器时返回 `false`。
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// 以 JSON 格式初始化全局 tracing 订阅器（用于日志采集）
pub fn init_json(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
