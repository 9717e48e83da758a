//! Consul 服务发现后端
//!
//! 注册时附带 TTL 检查 `service:<id>`（TTL 为健康检查间隔的两倍），
//! 续约即按健康检查间隔调用 `/v1/agent/check/pass/service:<id>`。
//! 查询走 `/v1/health/service/<name>` blocking query，游标为 `X-Consul-Index`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DiscoveryBackend, KeepAliveReceiver, KeepAliveResponse, Lease, QueryResult};
use crate::discovery::config::DataCenter;
use crate::discovery::instance::ServiceInstance;
use crate::error::{FlareError, Result};
use crate::utils::endpoint::{new_endpoint, split_endpoint};

/// blocking query 的服务端等待时间
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);

/// 这些 tagged address 是 consul 自带的，不是实例端点
const RESERVED_TAGGED_ADDRESSES: [&str; 4] = ["lan_ipv4", "wan_ipv4", "lan_ipv6", "wan_ipv6"];

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
    #[serde(rename = "TaggedAddresses", default)]
    tagged_addresses: Option<HashMap<String, TaggedAddress>>,
}

#[derive(Debug, Deserialize)]
struct TaggedAddress {
    #[serde(rename = "Address")]
    address: String,
}

/// 把 consul 健康检查条目还原为服务实例
fn resolve_entries(entries: Vec<ServiceEntry>) -> Vec<ServiceInstance> {
    entries
        .into_iter()
        .map(|entry| {
            let svc = entry.service;
            let mut instance = ServiceInstance::new(svc.service, svc.id);

            if let Some(version) = svc
                .tags
                .unwrap_or_default()
                .iter()
                .find_map(|tag| tag.strip_prefix("version=").map(str::to_string))
            {
                instance = instance.with_version(version);
            }
            for (key, value) in svc.meta.unwrap_or_default() {
                instance = instance.with_metadata(key, value);
            }

            let mut tagged: Vec<(String, TaggedAddress)> = svc
                .tagged_addresses
                .unwrap_or_default()
                .into_iter()
                .filter(|(scheme, _)| !RESERVED_TAGGED_ADDRESSES.contains(&scheme.as_str()))
                .collect();
            tagged.sort_by(|a, b| a.0.cmp(&b.0));

            if tagged.is_empty() && !svc.address.is_empty() && svc.port > 0 {
                instance = instance
                    .with_endpoint(new_endpoint("http", &format!("{}:{}", svc.address, svc.port)));
            }
            for (_, addr) in tagged {
                instance = instance.with_endpoint(addr.address);
            }
            instance
        })
        .collect()
}

/// Consul 服务发现后端
pub struct ConsulBackend {
    http_client: HttpClient,
    consul_url: String,
    datacenter: DataCenter,
    health_check_interval: Duration,
    deregister_critical_after: Duration,
    wait_time: Duration,
    enable_tcp_check: bool,
    check_timeout: Duration,
    next_lease: AtomicI64,
}

impl ConsulBackend {
    pub fn new(consul_url: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            consul_url: consul_url.into().trim_end_matches('/').to_string(),
            datacenter: DataCenter::Single,
            health_check_interval: Duration::from_secs(10),
            deregister_critical_after: Duration::from_secs(600),
            wait_time: DEFAULT_WAIT_TIME,
            enable_tcp_check: false,
            check_timeout: Duration::from_secs(10),
            next_lease: AtomicI64::new(0),
        }
    }

    pub fn with_datacenter(mut self, datacenter: DataCenter) -> Self {
        self.datacenter = datacenter;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_deregister_critical_after(mut self, after: Duration) -> Self {
        self.deregister_critical_after = after;
        self
    }

    /// 为每个端点附加 TCP 健康检查
    pub fn with_tcp_check(mut self, enable: bool, timeout: Duration) -> Self {
        self.enable_tcp_check = enable;
        self.check_timeout = timeout;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    fn check_id(instance_id: &str) -> String {
        format!("service:{}", instance_id)
    }

    fn registration_payload(&self, instance: &ServiceInstance) -> Result<serde_json::Value> {
        let mut tagged = serde_json::Map::new();
        let mut primary: Option<(String, u16)> = None;
        for endpoint in instance.endpoints() {
            let (scheme, host_port) = split_endpoint(endpoint)?;
            let (host, port) = host_port
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
                .ok_or_else(|| FlareError::invalid_endpoint(endpoint, "missing port"))?;
            tagged.insert(
                scheme,
                serde_json::json!({ "Address": endpoint, "Port": port }),
            );
            primary.get_or_insert((host, port));
        }

        let mut checks = Vec::new();
        if self.enable_tcp_check {
            for endpoint in instance.endpoints() {
                let (_, host_port) = split_endpoint(endpoint)?;
                checks.push(serde_json::json!({
                    "TCP": host_port,
                    "Interval": format!("{}s", self.health_check_interval.as_secs().max(1)),
                    "Timeout": format!("{}s", self.check_timeout.as_secs().max(1)),
                    "DeregisterCriticalServiceAfter":
                        format!("{}s", self.deregister_critical_after.as_secs()),
                }));
            }
        }
        let ttl = self.health_check_interval * 2;
        checks.push(serde_json::json!({
            "CheckID": Self::check_id(instance.id()),
            "TTL": format!("{}s", ttl.as_secs().max(1)),
            "DeregisterCriticalServiceAfter":
                format!("{}s", self.deregister_critical_after.as_secs()),
        }));

        let mut payload = serde_json::json!({
            "ID": instance.id(),
            "Name": instance.name(),
            "Meta": instance.metadata(),
            "Tags": [format!("version={}", instance.version())],
            "TaggedAddresses": tagged,
            "Checks": checks,
        });
        if let Some((host, port)) = primary {
            payload["Address"] = serde_json::Value::String(host);
            payload["Port"] = serde_json::Value::from(port);
        }
        Ok(payload)
    }

    async fn datacenters(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/catalog/datacenters", self.consul_url);
        let dcs = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<String>>()
            .await?;
        Ok(dcs)
    }

    async fn health_service(
        &self,
        service: &str,
        index: u64,
        passing_only: bool,
        dc: Option<&str>,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let url = format!("{}/v1/health/service/{}", self.consul_url, service);
        let mut params: Vec<(&str, String)> = vec![
            ("index", index.to_string()),
            ("wait", format!("{}s", self.wait_time.as_secs().max(1))),
        ];
        if passing_only {
            params.push(("passing", "true".to_string()));
        }
        if let Some(dc) = dc {
            params.push(("dc", dc.to_string()));
        }

        let resp = self
            .http_client
            .get(&url)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let last_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        let entries: Vec<ServiceEntry> = resp.json().await?;
        Ok((resolve_entries(entries), last_index))
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<Lease> {
        let url = format!("{}/v1/agent/service/register", self.consul_url);
        let payload = self.registration_payload(instance)?;

        self.http_client
            .put(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FlareError::registration_failed(format!("Consul register failed: {}", e)))?;

        info!(service = %instance, "Service instance registered in consul");
        Ok(Lease {
            id: self.next_lease.fetch_add(1, Ordering::Relaxed) + 1,
            key: Self::check_id(instance.id()),
            ttl,
        })
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.consul_url,
            instance.id()
        );
        self.http_client.put(&url).send().await?.error_for_status()?;
        info!(service = %instance, "Service instance deregistered from consul");
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveReceiver> {
        let url = format!("{}/v1/agent/check/pass/{}", self.consul_url, lease.key);
        let http_client = self.http_client.clone();
        let interval = self.health_check_interval;
        let lease_id = lease.id;
        let ttl = lease.ttl;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let result = tokio::time::timeout(interval, http_client.put(&url).send()).await;
                match result {
                    Ok(Ok(resp)) if resp.status().is_success() => {
                        if tx.send(KeepAliveResponse { lease_id, ttl }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Ok(resp)) => {
                        warn!(lease_id, status = %resp.status(), "Consul TTL update rejected");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(lease_id, error = %e, "Consul TTL update request failed");
                        break;
                    }
                    Err(_) => {
                        warn!(lease_id, "Consul TTL update timeout");
                        break;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(lease_id, "Consul TTL keeper stopped");
        });

        Ok(rx)
    }

    async fn query(
        &self,
        service: &str,
        last_index: u64,
        passing_only: bool,
    ) -> Result<QueryResult> {
        match self.datacenter {
            DataCenter::Single => {
                let (instances, index) = self
                    .health_service(service, last_index, passing_only, None)
                    .await?;
                Ok(QueryResult { instances, index })
            }
            DataCenter::Multi => {
                let mut instances = Vec::new();
                let mut index = last_index;
                for dc in self.datacenters().await? {
                    let (dc_instances, dc_index) = self
                        .health_service(service, index, passing_only, Some(&dc))
                        .await?;
                    instances.extend(
                        dc_instances
                            .into_iter()
                            .map(|ins| ins.with_metadata("dc", dc.clone())),
                    );
                    index = dc_index;
                }
                Ok(QueryResult { instances, index })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_entries_skips_reserved_tagged_addresses() {
        let json = r#"[{
            "Service": {
                "ID": "1",
                "Service": "svc",
                "Address": "10.0.0.1",
                "Port": 9090,
                "Tags": ["version=v1"],
                "Meta": {"cluster": "c1"},
                "TaggedAddresses": {
                    "lan_ipv4": {"Address": "10.0.0.1", "Port": 9090},
                    "grpc": {"Address": "grpc://10.0.0.1:9090", "Port": 9090}
                }
            }
        }]"#;
        let entries: Vec<ServiceEntry> = serde_json::from_str(json).unwrap();
        let instances = resolve_entries(entries);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoints(), ["grpc://10.0.0.1:9090".to_string()]);
        assert_eq!(instances[0].version(), "v1");
        assert_eq!(instances[0].metadata_value("cluster"), Some("c1"));
    }

    #[test]
    fn test_resolve_entries_falls_back_to_address_and_port() {
        let json = r#"[{"Service": {"ID": "2", "Service": "svc", "Address": "10.0.0.2", "Port": 8000,
            "Tags": null, "Meta": null, "TaggedAddresses": null}}]"#;
        let entries: Vec<ServiceEntry> = serde_json::from_str(json).unwrap();
        let instances = resolve_entries(entries);
        assert_eq!(instances[0].endpoints(), ["http://10.0.0.2:8000".to_string()]);
        assert_eq!(instances[0].version(), "");
    }

    #[test]
    fn test_registration_payload_uses_ttl_check() {
        let backend = ConsulBackend::new("http://127.0.0.1:8500/")
            .with_health_check_interval(Duration::from_secs(10));
        let instance = ServiceInstance::new("svc", "1")
            .with_version("v1")
            .with_endpoint("grpc://10.0.0.1:9090");
        let payload = backend.registration_payload(&instance).unwrap();
        assert_eq!(payload["Checks"].as_array().map(Vec::len), Some(1));
        assert_eq!(payload["Checks"][0]["CheckID"], "service:1");
        assert_eq!(payload["Checks"][0]["TTL"], "20s");
        assert_eq!(payload["Checks"][0]["DeregisterCriticalServiceAfter"], "600s");
        assert_eq!(payload["Address"], "10.0.0.1");
        assert_eq!(payload["Port"], 9090);
        assert_eq!(payload["TaggedAddresses"]["grpc"]["Address"], "grpc://10.0.0.1:9090");
        assert_eq!(backend.consul_url, "http://127.0.0.1:8500");

        let with_tcp = ConsulBackend::new("http://127.0.0.1:8500")
            .with_tcp_check(true, Duration::from_secs(3))
            .registration_payload(&instance)
            .unwrap();
        assert_eq!(with_tcp["Checks"][0]["TCP"], "10.0.0.1:9090");
        assert_eq!(with_tcp["Checks"][0]["Timeout"], "3s");
        assert_eq!(with_tcp["Checks"][1]["CheckID"], "service:1");
    }
}
