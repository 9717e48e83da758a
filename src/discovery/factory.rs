//! 服务发现工厂
//!
//! 按配置在构造时选择后端，并用同一份配置和指标构建注册器、订阅中心和解析器。

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::backend::memory::MemoryBackend;
use crate::discovery::config::{BackendType, DiscoveryConfig};
use crate::discovery::hub::SubscriptionHub;
use crate::discovery::instance::ServiceInstance;
use crate::discovery::registry::ServiceRegistry;
use crate::discovery::resolver::DiscoveryResolverBuilder;
use crate::discovery::trait_def::Registrar;
use crate::error::{FlareError, Result};
use crate::metrics::DiscoveryMetrics;
use crate::utils::Context;

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建服务发现后端
    pub async fn create_backend(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        config.validate()?;
        let backend: Arc<dyn DiscoveryBackend> = match config.backend {
            BackendType::Memory => Arc::new(MemoryBackend::new()),
            BackendType::Etcd => Self::create_etcd(config).await?,
            BackendType::Consul => Self::create_consul(config)?,
        };
        info!(backend = backend.name(), "Discovery backend created");
        Ok(backend)
    }

    #[cfg(feature = "etcd")]
    async fn create_etcd(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        use crate::discovery::backend::etcd::EtcdBackend;

        let backend = EtcdBackend::connect(
            &config.endpoints,
            config.namespace.clone(),
            Duration::from_secs(config.dial_timeout),
        )
        .await?
        .with_wait_window(wait_window(config));
        Ok(Arc::new(backend))
    }

    #[cfg(not(feature = "etcd"))]
    async fn create_etcd(_config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        Err(FlareError::configuration_error(
            "etcd backend requires the `etcd` feature",
        ))
    }

    #[cfg(feature = "consul")]
    fn create_consul(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        use crate::discovery::backend::consul::ConsulBackend;

        let url = config
            .endpoints
            .first()
            .ok_or_else(|| FlareError::configuration_error("consul url not configured"))?;
        let backend = ConsulBackend::new(url.clone())
            .with_datacenter(config.datacenter)
            .with_health_check_interval(Duration::from_secs(config.health_check_interval))
            .with_deregister_critical_after(Duration::from_secs(config.deregister_critical_after))
            .with_wait_time(wait_window(config));
        Ok(Arc::new(backend))
    }

    #[cfg(not(feature = "consul"))]
    fn create_consul(_config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>> {
        Err(FlareError::configuration_error(
            "consul backend requires the `consul` feature",
        ))
    }

    /// 创建注册器
    pub fn create_registry(
        backend: Arc<dyn DiscoveryBackend>,
        config: &DiscoveryConfig,
        metrics: &DiscoveryMetrics,
    ) -> ServiceRegistry {
        ServiceRegistry::new(backend, config.registry_options()).with_metrics(metrics.clone())
    }

    /// 创建订阅中心
    pub fn create_hub(
        backend: Arc<dyn DiscoveryBackend>,
        config: &DiscoveryConfig,
        metrics: &DiscoveryMetrics,
    ) -> SubscriptionHub {
        SubscriptionHub::with_metrics(
            backend,
            config.hub_options(),
            &Context::background(),
            metrics.clone(),
        )
    }

    /// 创建解析器构建器，独占一个订阅中心
    pub fn create_resolver_builder(
        hub: SubscriptionHub,
        config: &DiscoveryConfig,
    ) -> DiscoveryResolverBuilder {
        let metrics = hub.metrics().clone();
        DiscoveryResolverBuilder::new(Arc::new(hub), config.resolver_options()).with_metrics(metrics)
    }

    /// 快速构建：注册实例并返回注册器和订阅中心
    pub async fn register_and_discover(
        config: &DiscoveryConfig,
        instance: ServiceInstance,
    ) -> Result<(ServiceRegistry, SubscriptionHub)> {
        let backend = Self::create_backend(config).await?;
        let metrics = DiscoveryMetrics::new();
        let registry = Self::create_registry(backend.clone(), config, &metrics);
        registry.register(instance).await?;
        let hub = Self::create_hub(backend, config, &metrics);
        Ok((registry, hub))
    }
}

/// 服务端等待窗口需短于客户端的查询超时
fn wait_window(config: &DiscoveryConfig) -> Duration {
    Duration::from_secs((config.query_timeout / 2).max(1))
}
