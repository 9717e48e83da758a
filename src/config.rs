//! 配置文件加载

use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::discovery::config::DiscoveryConfig;
use crate::discovery::instance::ServiceInstance;
use crate::error::{ErrorCode, InfraResult, InfraResultExt, Result};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    pub service: ServiceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// tracing 过滤指令，如 `info` 或 `flare_discovery=debug`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    /// 实例 ID，未配置时每次构造实例都会生成随机 UUID
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::read(path).into_flare(
            ErrorCode::ConfigurationError,
            format!("failed to load config from {}", path.display()),
        )
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::parse(content).into_flare(ErrorCode::ConfigurationError, "invalid config")
    }

    /// 由 `[service]` 段构造待注册的实例
    pub fn service_instance(&self) -> ServiceInstance {
        let instance = match &self.service.id {
            Some(id) => ServiceInstance::new(&self.service.name, id),
            None => ServiceInstance::with_random_id(&self.service.name),
        };
        self.service
            .endpoints
            .iter()
            .fold(instance.with_version(&self.service.version), |inst, endpoint| {
                inst.with_endpoint(endpoint)
            })
    }

    /// 按 `log_level` 安装 tracing 订阅器，`RUST_LOG` 优先
    pub fn init_logging(&self) -> bool {
        crate::utils::logging::init(&self.log_level)
    }

    fn read(path: &Path) -> InfraResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> InfraResult<Self> {
        let config: Config = toml::from_str(content).context("parsing toml")?;
        config.discovery.validate().map_err(anyhow::Error::new)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::config::BackendType;

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
            log_level = "debug"

            [service]
            name = "helloworld"
            version = "v1"

            [discovery]
            backend = "consul"
            endpoints = ["http://127.0.0.1:8500"]
            required_clusters = ["c1"]
            zone = "az-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.service.name, "helloworld");
        assert_eq!(config.discovery.backend, BackendType::Consul);
        assert_eq!(config.discovery.zone.as_deref(), Some("az-1"));
        assert_eq!(config.discovery.lease_ttl, 15);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_service_instance_from_config() {
        let config = Config::from_toml_str(
            r#"
            [service]
            name = "helloworld"
            version = "v2"
            endpoints = ["grpc://127.0.0.1:9000"]
            "#,
        )
        .unwrap();
        let first = config.service_instance();
        let second = config.service_instance();
        assert_eq!(first.name(), "helloworld");
        assert_eq!(first.version(), "v2");
        assert_eq!(first.endpoints(), ["grpc://127.0.0.1:9000".to_string()]);
        assert!(first.validate().is_ok());
        assert!(uuid::Uuid::parse_str(first.id()).is_ok());
        assert_ne!(first.id(), second.id());

        let fixed = Config::from_toml_str(
            r#"
            [service]
            name = "helloworld"
            id = "node-1"
            "#,
        )
        .unwrap();
        assert_eq!(fixed.service_instance().id(), "node-1");
    }

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let err = Config::from_toml_str(
            r#"
            [service]
            name = "helloworld"

            [discovery]
            backend = "etcd"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigurationError));

        let missing = Config::load_from_file("/nonexistent/flare.toml").unwrap_err();
        assert_eq!(missing.code(), Some(ErrorCode::ConfigurationError));
    }
}
