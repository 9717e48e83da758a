//! 解析器桥接
//!
//! 把订阅者收到的实例列表转换为去重、过滤后的网络地址，发布给下游解析消费者。
//! 首次建立订阅受 bootstrap 超时约束，超时则关闭发现会话并返回
//! "discovery create watcher overtime"。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::address::Address;
use crate::discovery::instance::ServiceInstance;
use crate::discovery::trait_def::{Discovery, Watcher};
use crate::error::{FlareError, Result};
use crate::metrics::DiscoveryMetrics;
use crate::utils::Context;

/// 元数据中的集群标签
pub const CLUSTER_KEY: &str = "cluster";

/// 元数据中的可用区标签
pub const ZONE_KEY: &str = "zone";

/// 下游解析消费者
#[async_trait]
pub trait AddressUpdater: Send + Sync {
    /// 以完整列表替换当前地址集合
    async fn update_addresses(&self, addresses: Vec<Address>) -> Result<()>;
}

/// 解析器参数
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// 选取的端点 scheme
    pub scheme: String,
    /// 建立订阅的超时
    pub bootstrap_timeout: Duration,
    /// 只接受 `cluster` 在其中的实例，为空表示不过滤
    pub required_clusters: Vec<String>,
    /// 优先可用区
    pub zone: Option<String>,
    /// 订阅出错后的重试间隔
    pub retry_interval: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            scheme: "grpc".to_string(),
            bootstrap_timeout: Duration::from_secs(10),
            required_clusters: Vec::new(),
            zone: None,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ResolverOptions {
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_required_clusters(mut self, clusters: Vec<String>) -> Self {
        self.required_clusters = clusters;
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// 由实例列表构建地址列表
///
/// 1. 按 `cluster` 过滤
/// 2. 若配置了可用区且有实例位于该区，只保留这些实例
/// 3. 取匹配 scheme 的端点，按 `host:port` 去重，先出现者优先
pub fn build_addresses(instances: &[ServiceInstance], options: &ResolverOptions) -> Vec<Address> {
    let mut candidates: Vec<&ServiceInstance> = instances
        .iter()
        .filter(|ins| {
            options.required_clusters.is_empty()
                || ins
                    .metadata_value(CLUSTER_KEY)
                    .is_some_and(|c| options.required_clusters.iter().any(|r| r == c))
        })
        .collect();

    if let Some(zone) = options.zone.as_deref() {
        if candidates
            .iter()
            .any(|ins| ins.metadata_value(ZONE_KEY) == Some(zone))
        {
            candidates.retain(|ins| ins.metadata_value(ZONE_KEY) == Some(zone));
        }
    }

    let mut seen = HashSet::new();
    let mut addresses = Vec::with_capacity(candidates.len());
    for ins in candidates {
        match ins.endpoint(&options.scheme) {
            Ok(Some(addr)) => {
                if seen.insert(addr.clone()) {
                    addresses.push(Address::from_instance(ins, addr));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(service = %ins, error = %e, "Skipping instance with malformed endpoint");
            }
        }
    }
    addresses
}

/// 解析器构建器
pub struct DiscoveryResolverBuilder {
    discovery: Arc<dyn Discovery>,
    options: ResolverOptions,
    metrics: DiscoveryMetrics,
}

impl DiscoveryResolverBuilder {
    pub fn new(discovery: Arc<dyn Discovery>, options: ResolverOptions) -> Self {
        Self {
            discovery,
            options,
            metrics: DiscoveryMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scheme(&self) -> &str {
        &self.options.scheme
    }

    async fn close_discovery(&self) {
        if let Err(e) = self.discovery.close().await {
            warn!(error = %e, "Failed to close discovery session");
        }
    }

    /// 为 `service` 建立解析器，地址变化时回调 `updater`
    pub async fn build(
        &self,
        service: &str,
        updater: Arc<dyn AddressUpdater>,
    ) -> Result<DiscoveryResolver> {
        let discovery = self.discovery.clone();
        let name = service.to_string();
        let mut creating = tokio::spawn(async move { discovery.watch(&name).await });

        let watcher = match tokio::time::timeout(self.options.bootstrap_timeout, &mut creating).await
        {
            Ok(Ok(Ok(watcher))) => watcher,
            Ok(Ok(Err(e))) => {
                warn!(service = %service, error = %e, "Failed to create watcher");
                self.close_discovery().await;
                return Err(e);
            }
            Ok(Err(e)) => {
                self.close_discovery().await;
                return Err(FlareError::system(format!("watch task failed: {}", e)));
            }
            Err(_) => {
                creating.abort();
                warn!(
                    service = %service,
                    timeout = ?self.options.bootstrap_timeout,
                    "Watcher creation timed out"
                );
                self.close_discovery().await;
                return Err(FlareError::watcher_create_timeout());
            }
        };

        let ctx = Context::background();
        let addresses = Arc::new(RwLock::new(Vec::new()));
        let task = tokio::spawn(
            UpdateLoop {
                service: service.to_string(),
                watcher,
                updater,
                addresses: addresses.clone(),
                options: self.options.clone(),
                metrics: self.metrics.clone(),
            }
            .run(ctx.clone()),
        );
        info!(service = %service, scheme = %self.options.scheme, "Resolver started");

        Ok(DiscoveryResolver {
            service: service.to_string(),
            addresses,
            ctx,
            task: Mutex::new(Some(task)),
            discovery: self.discovery.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

struct UpdateLoop {
    service: String,
    watcher: Box<dyn Watcher>,
    updater: Arc<dyn AddressUpdater>,
    addresses: Arc<RwLock<Vec<Address>>>,
    options: ResolverOptions,
    metrics: DiscoveryMetrics,
}

impl UpdateLoop {
    async fn run(mut self, ctx: Context) {
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.done() => break,
                next = self.watcher.next() => next,
            };
            match next {
                Ok(instances) => self.update(&instances).await,
                Err(_) if ctx.is_done() => break,
                Err(e) if e.is_cancelled() => {
                    debug!(service = %self.service, "Watcher cancelled, stopping resolver");
                    break;
                }
                Err(e) => {
                    warn!(service = %self.service, error = %e, "Failed to watch service");
                    tokio::select! {
                        _ = ctx.done() => break,
                        _ = tokio::time::sleep(self.options.retry_interval) => {}
                    }
                }
            }
        }
        if let Err(e) = self.watcher.close().await {
            debug!(service = %self.service, error = %e, "Failed to close watcher");
        }
    }

    async fn update(&self, instances: &[ServiceInstance]) {
        let addresses = build_addresses(instances, &self.options);
        if addresses.is_empty() {
            debug!(
                service = %self.service,
                instances = instances.len(),
                "No usable address, keeping previous list"
            );
            return;
        }

        match self.updater.update_addresses(addresses.clone()).await {
            Ok(()) => {
                self.metrics.record_publish(true);
                info!(
                    service = %self.service,
                    addresses = addresses.len(),
                    "Addresses updated"
                );
                *self.addresses.write().unwrap_or_else(|e| e.into_inner()) = addresses;
            }
            Err(e) => {
                self.metrics.record_publish(false);
                warn!(service = %self.service, error = %e, "Failed to publish addresses");
            }
        }
    }
}

/// 运行中的解析器
pub struct DiscoveryResolver {
    service: String,
    addresses: Arc<RwLock<Vec<Address>>>,
    ctx: Context,
    task: Mutex<Option<JoinHandle<()>>>,
    discovery: Arc<dyn Discovery>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DiscoveryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResolver")
            .field("service", &self.service)
            .field("addresses", &self.addresses().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DiscoveryResolver {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// 最近一次成功发布的地址列表
    pub fn addresses(&self) -> Vec<Address> {
        self.addresses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 地址由订阅推送，无需主动解析
    pub fn resolve_now(&self) {}

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 停止更新循环、关闭订阅和发现会话；重复调用无副作用
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ctx.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(service = %self.service, error = %e, "Resolver task join failed");
            }
        }
        info!(service = %self.service, "Resolver closed");
        self.discovery.close().await
    }
}

impl Drop for DiscoveryResolver {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// 按脚本依次返回实例列表的订阅者
    struct ScriptedWatcher {
        rx: mpsc::UnboundedReceiver<Vec<ServiceInstance>>,
    }

    #[async_trait]
    impl Watcher for ScriptedWatcher {
        async fn next(&mut self) -> Result<Vec<ServiceInstance>> {
            match self.rx.recv().await {
                Some(instances) => Ok(instances),
                None => Err(FlareError::cancelled("script finished")),
            }
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedDiscovery {
        watcher: Mutex<Option<ScriptedWatcher>>,
    }

    #[async_trait]
    impl Discovery for ScriptedDiscovery {
        async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
            Err(FlareError::service_not_found(name))
        }

        async fn watch(&self, _name: &str) -> Result<Box<dyn Watcher>> {
            let watcher = self.watcher.lock().unwrap().take().unwrap();
            Ok(Box::new(watcher))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingUpdater {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AddressUpdater for CountingUpdater {
        async fn update_addresses(&self, _addresses: Vec<Address>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn instance(id: &str, endpoint: &str) -> ServiceInstance {
        ServiceInstance::new("svc", id).with_endpoint(endpoint)
    }

    #[test]
    fn test_dedup_first_wins() {
        let instances = vec![
            instance("1", "grpc://10.0.0.1:9090"),
            instance("2", "grpc://10.0.0.1:9090"),
            instance("3", "http://10.0.0.3:8000"),
        ];
        let addresses = build_addresses(&instances, &ResolverOptions::default());
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].addr, "10.0.0.1:9090");
        assert_eq!(addresses[0].server_name, "svc");
        assert_eq!(addresses[0].attribute("instance_id"), Some("1"));
    }

    #[test]
    fn test_required_clusters_filter() {
        let clusters = ["c1", "c1", "c1", "c2", "c3", "c4"];
        let instances: Vec<ServiceInstance> = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| {
                instance(&i.to_string(), &format!("grpc://10.0.0.{}:9090", i))
                    .with_metadata(CLUSTER_KEY, *c)
            })
            .collect();
        let options = ResolverOptions::default()
            .with_required_clusters(vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(build_addresses(&instances, &options).len(), 4);
        assert_eq!(build_addresses(&instances, &ResolverOptions::default()).len(), 6);
    }

    #[test]
    fn test_zone_preference_falls_back_to_all() {
        let instances = vec![
            instance("1", "grpc://10.0.0.1:9090").with_metadata(ZONE_KEY, "a"),
            instance("2", "grpc://10.0.0.2:9090").with_metadata(ZONE_KEY, "b"),
        ];
        let in_zone = build_addresses(&instances, &ResolverOptions::default().with_zone("b"));
        assert_eq!(in_zone.len(), 1);
        assert_eq!(in_zone[0].addr, "10.0.0.2:9090");

        let unknown = build_addresses(&instances, &ResolverOptions::default().with_zone("z"));
        assert_eq!(unknown.len(), 2);
    }

    #[test]
    fn test_malformed_endpoint_skipped() {
        let instances = vec![
            instance("1", "10.0.0.1"),
            instance("2", "grpc://10.0.0.2:9090").with_version("v2"),
        ];
        let addresses = build_addresses(&instances, &ResolverOptions::default());
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].attribute("version"), Some("v2"));
    }

    #[tokio::test]
    async fn test_empty_update_keeps_published_addresses() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discovery = Arc::new(ScriptedDiscovery {
            watcher: Mutex::new(Some(ScriptedWatcher { rx })),
        });
        let updater = Arc::new(CountingUpdater::default());
        let builder = DiscoveryResolverBuilder::new(discovery, ResolverOptions::default());
        let resolver = builder.build("svc", updater.clone()).await.unwrap();

        tx.send(vec![instance("1", "grpc://10.0.0.1:9090")]).unwrap();
        // 空列表以及没有匹配 scheme 的列表都不发布
        tx.send(Vec::new()).unwrap();
        tx.send(vec![instance("2", "http://10.0.0.2:8000")]).unwrap();
        drop(tx);

        let task = resolver.task.lock().unwrap().take().unwrap();
        task.await.unwrap();

        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
        let addresses = resolver.addresses();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].addr, "10.0.0.1:9090");
    }
}
