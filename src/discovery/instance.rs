//! 服务实例定义

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::endpoint::{parse_endpoint, split_endpoint};

/// 服务实例
///
/// 构造完成后不可变，身份由 `(name, id)` 决定。
/// `endpoints` 形如 `grpc://10.0.0.1:9090`，同一实例可以暴露多个 scheme。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceInstance {
    /// 实例 ID（唯一标识）
    id: String,

    /// 服务名
    name: String,

    /// 版本
    #[serde(default)]
    version: String,

    /// 元数据（cluster、zone 等，用于过滤和路由）
    #[serde(default)]
    metadata: HashMap<String, String>,

    /// 端点列表
    #[serde(default)]
    endpoints: Vec<String>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// 使用随机 UUID 作为实例 ID
    pub fn with_random_id(name: impl Into<String>) -> Self {
        Self::new(name, uuid::Uuid::new_v4().to_string())
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 添加端点
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// 注册中心中的存储键：`{namespace}/{name}/{id}`
    pub fn registry_key(&self, namespace: &str) -> String {
        format!("{}/{}/{}", namespace.trim_end_matches('/'), self.name, self.id)
    }

    /// 某个服务所有实例的键前缀：`{namespace}/{name}/`
    pub fn service_prefix(namespace: &str, name: &str) -> String {
        format!("{}/{}/", namespace.trim_end_matches('/'), name)
    }

    /// 第一个匹配 scheme 的端点的 `host:port`
    pub fn endpoint(&self, scheme: &str) -> Result<Option<String>> {
        parse_endpoint(&self.endpoints, scheme)
    }

    /// 校验所有端点都是 `scheme://host:port` 格式
    pub fn validate(&self) -> Result<()> {
        for endpoint in &self.endpoints {
            split_endpoint(endpoint)?;
        }
        Ok(())
    }

    /// 内容是否等价：端点顺序无关，元数据、ID、名称、版本必须一致
    pub fn equivalent(&self, other: &ServiceInstance) -> bool {
        if self.id != other.id || self.name != other.name || self.version != other.version {
            return false;
        }
        if self.metadata != other.metadata || self.endpoints.len() != other.endpoints.len() {
            return false;
        }
        let mut a: Vec<&String> = self.endpoints.iter().collect();
        let mut b: Vec<&String> = other.endpoints.iter().collect();
        a.sort();
        b.sort();
        a == b
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ServiceInstance {
        ServiceInstance::new("svc", "1")
            .with_version("v1")
            .with_metadata("cluster", "c1")
            .with_endpoint("http://10.0.0.1:8000")
            .with_endpoint("grpc://10.0.0.1:9090")
    }

    #[test]
    fn test_equivalent_ignores_endpoint_order() {
        let reordered = ServiceInstance::new("svc", "1")
            .with_version("v1")
            .with_metadata("cluster", "c1")
            .with_endpoint("grpc://10.0.0.1:9090")
            .with_endpoint("http://10.0.0.1:8000");
        assert!(instance().equivalent(&reordered));
        assert_ne!(instance(), reordered);
        assert!(!instance().equivalent(&reordered.clone().with_version("v2")));
    }

    #[test]
    fn test_endpoint_and_keys() {
        let ins = instance();
        assert_eq!(ins.endpoint("grpc").unwrap().as_deref(), Some("10.0.0.1:9090"));
        assert_eq!(ins.registry_key("/microservices"), "/microservices/svc/1");
        assert_eq!(
            ServiceInstance::service_prefix("/microservices/", "svc"),
            "/microservices/svc/"
        );
        assert_eq!(ins.to_string(), "svc-1");
    }

    #[test]
    fn test_validate_rejects_malformed_endpoint() {
        assert!(instance().validate().is_ok());
        let bad = ServiceInstance::new("svc", "2").with_endpoint("10.0.0.2");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_uses_lowercase_fields() {
        let json = serde_json::to_value(instance()).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["name"], "svc");
        let back: ServiceInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance());

        let minimal: ServiceInstance =
            serde_json::from_str(r#"{"id":"0","name":"helloworld"}"#).unwrap();
        assert!(minimal.endpoints().is_empty());
    }
}
