//! 解析后的网络地址

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::discovery::instance::ServiceInstance;

/// 发布给下游解析消费者的地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// `host:port`
    pub addr: String,

    /// 服务名（TLS server name）
    pub server_name: String,

    /// 实例元数据，附带 `version` 与 `instance_id`
    pub attributes: HashMap<String, String>,
}

impl Address {
    /// 由实例和已经解析出的 `host:port` 构造地址
    pub fn from_instance(instance: &ServiceInstance, addr: impl Into<String>) -> Self {
        let mut attributes = instance.metadata().clone();
        if !instance.version().is_empty() {
            attributes.insert("version".to_string(), instance.version().to_string());
        }
        attributes.insert("instance_id".to_string(), instance.id().to_string());
        Self {
            addr: addr.into(),
            server_name: instance.name().to_string(),
            attributes,
        }
    }

    pub fn new(addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: server_name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
