//! 服务发现配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::hub::HubOptions;
use crate::discovery::registry::RegistryOptions;
use crate::discovery::resolver::ResolverOptions;
use crate::error::{FlareError, Result};

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Memory,
    Etcd,
    Consul,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendType::Memory),
            "etcd" => Ok(BackendType::Etcd),
            "consul" => Ok(BackendType::Consul),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

/// 查询结果为空时的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultPolicy {
    /// 保留上一次的非空快照，不通知订阅者
    #[default]
    Retain,
    /// 发布空快照
    Publish,
}

/// consul 数据中心模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataCenter {
    /// 只查询本地数据中心
    #[default]
    Single,
    /// 查询所有数据中心，实例元数据带上 `dc`
    Multi,
}

/// 服务发现配置
///
/// 时间字段单位均为秒
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 后端类型：memory, etcd, consul
    pub backend: BackendType,

    /// 后端地址（etcd endpoints / consul url）
    pub endpoints: Vec<String>,

    /// 注册键命名空间
    pub namespace: String,

    /// 租约 TTL
    pub lease_ttl: u64,

    /// 租约丢失后重新注册的最大次数
    pub max_retry: usize,

    /// 连接后端超时
    pub dial_timeout: u64,

    /// consul 健康检查间隔
    pub health_check_interval: u64,

    /// consul 检查失败后自动注销的时间
    pub deregister_critical_after: u64,

    /// 解析器等待订阅建立的超时
    pub bootstrap_timeout: u64,

    /// 单次 blocking query 超时
    pub query_timeout: u64,

    /// 查询失败后的重试间隔
    pub retry_interval: u64,

    /// 只返回健康检查通过的实例
    pub passing_only: bool,

    /// 只接受元数据 `cluster` 在其中的实例，为空表示不过滤
    pub required_clusters: Vec<String>,

    /// 优先选择的可用区
    pub zone: Option<String>,

    pub empty_result_policy: EmptyResultPolicy,

    pub datacenter: DataCenter,

    /// 解析器选取的端点 scheme
    pub scheme: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Memory,
            endpoints: Vec::new(),
            namespace: "/microservices".to_string(),
            lease_ttl: 15,
            max_retry: 5,
            dial_timeout: 5,
            health_check_interval: 10,
            deregister_critical_after: 600,
            bootstrap_timeout: 10,
            query_timeout: 10,
            retry_interval: 1,
            passing_only: true,
            required_clusters: Vec::new(),
            zone: None,
            empty_result_policy: EmptyResultPolicy::Retain,
            datacenter: DataCenter::Single,
            scheme: "grpc".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.backend != BackendType::Memory && self.endpoints.is_empty() {
            return Err(FlareError::configuration_error(format!(
                "{:?} backend requires at least one endpoint",
                self.backend
            )));
        }
        if self.lease_ttl == 0 {
            return Err(FlareError::configuration_error("lease_ttl must be positive"));
        }
        if self.max_retry == 0 {
            return Err(FlareError::configuration_error("max_retry must be at least 1"));
        }
        if self.query_timeout == 0 || self.bootstrap_timeout == 0 {
            return Err(FlareError::configuration_error(
                "query_timeout and bootstrap_timeout must be positive",
            ));
        }
        if self.scheme.is_empty() {
            return Err(FlareError::configuration_error("scheme must not be empty"));
        }
        Ok(())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions::default()
            .with_namespace(self.namespace.clone())
            .with_lease_ttl(Duration::from_secs(self.lease_ttl))
            .with_max_retry(self.max_retry)
    }

    pub fn hub_options(&self) -> HubOptions {
        HubOptions::default()
            .with_query_timeout(Duration::from_secs(self.query_timeout))
            .with_retry_interval(Duration::from_secs(self.retry_interval))
            .with_passing_only(self.passing_only)
            .with_empty_result_policy(self.empty_result_policy)
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        let mut options = ResolverOptions::default()
            .with_scheme(self.scheme.clone())
            .with_bootstrap_timeout(Duration::from_secs(self.bootstrap_timeout))
            .with_retry_interval(Duration::from_secs(self.retry_interval))
            .with_required_clusters(self.required_clusters.clone());
        if let Some(zone) = &self.zone {
            options = options.with_zone(zone.clone());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.namespace, "/microservices");
        assert_eq!(config.lease_ttl, 15);
        assert_eq!(config.max_retry, 5);
        assert_eq!(config.empty_result_policy, EmptyResultPolicy::Retain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DiscoveryConfig = toml::from_str(
            r#"
            backend = "etcd"
            endpoints = ["http://127.0.0.1:2379"]
            max_retry = 3
            empty_result_policy = "publish"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Etcd);
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.query_timeout, 10);
        assert_eq!(config.empty_result_policy, EmptyResultPolicy::Publish);

        let options = config.registry_options();
        assert_eq!(options.max_retry, 3);
        assert_eq!(options.lease_ttl, Duration::from_secs(15));
    }

    #[test]
    fn test_remote_backend_requires_endpoints() {
        let config = DiscoveryConfig {
            backend: BackendType::Consul,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!("ETCD".parse::<BackendType>().unwrap(), BackendType::Etcd);
        assert!("dns".parse::<BackendType>().is_err());
    }
}
