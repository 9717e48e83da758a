//! tonic 负载均衡 Channel 适配
//!
//! 把解析器发布的完整地址列表转换为 `Change` 增量，
//! 送入 `Channel::balance_channel` 返回的发送端。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::discovery::address::Address;
use crate::discovery::resolver::AddressUpdater;
use crate::error::{ErrorCode, FlareError, Result};
use crate::utils::{new_endpoint, scheme};

type EndpointConfigurer = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// 驱动 tonic 负载均衡 Channel 的地址消费者
pub struct BalanceChannelUpdater {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    current: Mutex<HashMap<String, Address>>,
    scheme: String,
    configure: Option<EndpointConfigurer>,
}

impl BalanceChannelUpdater {
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>) -> Self {
        Self {
            tx,
            current: Mutex::new(HashMap::new()),
            scheme: "http".to_string(),
            configure: None,
        }
    }

    /// 创建负载均衡 Channel 以及驱动它的更新器
    pub fn channel(capacity: usize) -> (Channel, Self) {
        let (channel, tx) = Channel::balance_channel::<String>(capacity);
        (channel, Self::new(tx))
    }

    /// 连接 URI 使用的 scheme（默认 `http`，TLS 时为 `https`）
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// 启用 TLS 时使用 `https`
    pub fn with_tls(mut self, secure: bool) -> Self {
        self.scheme = scheme("http", secure);
        self
    }

    /// 自定义每个 Endpoint（超时、TLS 等）
    pub fn with_endpoint_config<F>(mut self, configure: F) -> Self
    where
        F: Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
    {
        self.configure = Some(Arc::new(configure));
        self
    }

    /// 当前已插入的地址
    pub async fn current(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.current.lock().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    fn endpoint(&self, address: &Address) -> Result<Endpoint> {
        let uri = new_endpoint(&self.scheme, &address.addr);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| FlareError::invalid_endpoint(&address.addr, e.to_string()))?;
        Ok(match &self.configure {
            Some(configure) => configure(endpoint),
            None => endpoint,
        })
    }

    async fn send(&self, change: Change<String, Endpoint>) -> Result<()> {
        self.tx.send(change).await.map_err(|_| {
            FlareError::localized(ErrorCode::ConnectionClosed, "balance channel closed")
        })
    }
}

#[async_trait]
impl AddressUpdater for BalanceChannelUpdater {
    async fn update_addresses(&self, addresses: Vec<Address>) -> Result<()> {
        let mut current = self.current.lock().await;
        let next: HashMap<String, Address> = addresses
            .into_iter()
            .map(|a| (a.addr.clone(), a))
            .collect();

        let removed: Vec<String> = current
            .keys()
            .filter(|k| !next.contains_key(*k))
            .cloned()
            .collect();
        for key in removed {
            self.send(Change::Remove(key.clone())).await?;
            current.remove(&key);
            debug!(addr = %key, "Endpoint removed from balance channel");
        }

        for (key, address) in next {
            if current.contains_key(&key) {
                continue;
            }
            let endpoint = match self.endpoint(&address) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(addr = %key, error = %e, "Skipping invalid endpoint");
                    continue;
                }
            };
            self.send(Change::Insert(key.clone(), endpoint)).await?;
            debug!(addr = %key, "Endpoint inserted into balance channel");
            current.insert(key, address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(addr: &str) -> Address {
        Address::new(addr, "svc")
    }

    #[tokio::test]
    async fn test_diff_produces_insert_and_remove() {
        let (tx, mut rx) = mpsc::channel(16);
        let updater = BalanceChannelUpdater::new(tx);

        updater
            .update_addresses(vec![address("10.0.0.1:9090"), address("10.0.0.2:9090")])
            .await
            .unwrap();
        let mut inserted = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Change::Insert(key, endpoint) => {
                    let uri = endpoint.uri();
                    assert_eq!(uri.scheme_str(), Some("http"));
                    assert_eq!(
                        format!("{}:{}", uri.host().unwrap(), uri.port_u16().unwrap()),
                        key
                    );
                    inserted.push(key);
                }
                Change::Remove(_) => panic!("unexpected remove"),
            }
        }
        inserted.sort();
        assert_eq!(inserted, vec!["10.0.0.1:9090", "10.0.0.2:9090"]);

        updater
            .update_addresses(vec![address("10.0.0.2:9090")])
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Change::Remove(key) => assert_eq!(key, "10.0.0.1:9090"),
            Change::Insert(..) => panic!("unexpected insert"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(updater.current().await, vec!["10.0.0.2:9090".to_string()]);
    }

    #[tokio::test]
    async fn test_tls_uses_https_scheme() {
        let (tx, mut rx) = mpsc::channel(1);
        let updater = BalanceChannelUpdater::new(tx).with_tls(true);
        updater
            .update_addresses(vec![address("10.0.0.1:9090")])
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Change::Insert(_, endpoint) => assert_eq!(endpoint.uri().scheme_str(), Some("https")),
            Change::Remove(_) => panic!("unexpected remove"),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let updater = BalanceChannelUpdater::new(tx);
        assert!(updater
            .update_addresses(vec![address("10.0.0.1:9090")])
            .await
            .is_err());
    }
}
