//! etcd 服务发现后端
//!
//! 实例以 JSON 存放在 `{namespace}/{name}/{id}`，绑定 TTL 租约。
//! blocking query 的游标是 etcd revision：游标为 0 时直接读前缀，
//! 否则从 `last_index + 1` 开始 watch，收到事件后重新读取前缀。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DiscoveryBackend, KeepAliveReceiver, KeepAliveResponse, Lease, LeaseId, QueryResult};
use crate::discovery::instance::ServiceInstance;
use crate::error::{FlareError, Result};

/// 没有事件时 watch 的最长等待时间
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(5);

/// etcd 服务发现后端
pub struct EtcdBackend {
    client: Client,
    namespace: String,
    wait_window: Duration,
    /// 注册键 -> 当前租约，注销时一并吊销
    leases: Mutex<HashMap<String, LeaseId>>,
}

impl EtcdBackend {
    /// 连接 etcd
    pub async fn connect(
        endpoints: &[String],
        namespace: impl Into<String>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(FlareError::configuration_error("etcd endpoints not configured"));
        }
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| FlareError::connection_failed(format!("Failed to connect to etcd: {}", e)))?;

        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            wait_window: DEFAULT_WAIT_WINDOW,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_wait_window(mut self, wait_window: Duration) -> Self {
        self.wait_window = wait_window;
        self
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, LeaseId>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn read_prefix(&self, service: &str) -> Result<QueryResult> {
        let prefix = ServiceInstance::service_prefix(&self.namespace, service);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let index = resp.header().map(|h| h.revision()).unwrap_or_default().max(0) as u64;
        let mut instances = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<ServiceInstance>(kv.value()) {
                Ok(instance) if instance.name() == service => instances.push(instance),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "Skipping undecodable service instance"
                    );
                }
            }
        }
        Ok(QueryResult { instances, index })
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<Lease> {
        let key = instance.registry_key(&self.namespace);
        let value = serde_json::to_string(instance)?;

        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(|e| FlareError::registration_failed(format!("Failed to grant lease: {}", e)))?;
        let lease_id = lease.id();

        client
            .put(key.clone(), value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|e| FlareError::registration_failed(format!("Failed to put {}: {}", key, e)))?;

        let previous = self.leases().insert(key.clone(), lease_id);
        if let Some(previous) = previous.filter(|p| *p != lease_id) {
            // 旧租约上已经没有键，吊销失败不影响本次注册
            if let Err(e) = client.lease_revoke(previous).await {
                debug!(lease_id = previous, error = %e, "Failed to revoke previous lease");
            }
        }

        info!(key = %key, lease_id, "Service instance registered in etcd");
        Ok(Lease {
            id: lease_id,
            key,
            ttl,
        })
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = instance.registry_key(&self.namespace);
        let mut client = self.client.clone();
        client.delete(key.clone(), None).await?;

        let lease_id = self.leases().remove(&key);
        if let Some(lease_id) = lease_id {
            if let Err(e) = client.lease_revoke(lease_id).await {
                debug!(lease_id, error = %e, "Failed to revoke lease on deregister");
            }
        }
        info!(key = %key, "Service instance deregistered from etcd");
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveReceiver> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease.id).await?;
        let (tx, rx) = mpsc::channel(16);
        let lease_id = lease.id;
        let interval = (lease.ttl / 3).max(Duration::from_millis(500));

        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease_id, error = %e, "Lease keep-alive request failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        let response = KeepAliveResponse {
                            lease_id,
                            ttl: Duration::from_secs(resp.ttl() as u64),
                        };
                        if tx.send(response).await.is_err() {
                            // 接收端已放弃续约
                            break;
                        }
                    }
                    Ok(Some(_)) => {
                        warn!(lease_id, "Lease expired on etcd");
                        break;
                    }
                    Ok(None) => {
                        warn!(lease_id, "Lease keep-alive stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(lease_id, error = %e, "Lease keep-alive stream error");
                        break;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn query(
        &self,
        service: &str,
        last_index: u64,
        _passing_only: bool,
    ) -> Result<QueryResult> {
        if last_index == 0 {
            return self.read_prefix(service).await;
        }

        let prefix = ServiceInstance::service_prefix(&self.namespace, service);
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(last_index as i64 + 1);
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        let changed = tokio::time::timeout(self.wait_window, async {
            loop {
                match stream.message().await? {
                    Some(resp) if resp.compact_revision() > 0 => return Ok::<bool, FlareError>(true),
                    Some(resp) if !resp.events().is_empty() => return Ok(true),
                    Some(resp) if resp.canceled() => {
                        return Err(FlareError::backend_unavailable("etcd watch canceled"));
                    }
                    Some(_) => continue,
                    None => return Err(FlareError::backend_unavailable("etcd watch stream closed")),
                }
            }
        })
        .await;

        if let Err(e) = watcher.cancel().await {
            debug!(error = %e, "Failed to cancel etcd watch");
        }

        match changed {
            Ok(Ok(_)) => self.read_prefix(service).await,
            Ok(Err(e)) => Err(e),
            // 等待窗口内没有变化
            Err(_) => Ok(QueryResult {
                instances: Vec::new(),
                index: last_index,
            }),
        }
    }
}
