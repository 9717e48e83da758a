//! 服务注册器
//!
//! 同步完成注册（注册失败直接返回给调用方），随后为每个实例启动一个心跳任务。
//! 同一 `(name, id)` 重复注册会替换旧的心跳任务。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::heartbeat::{HeartbeatEngine, HeartbeatHandle, HeartbeatOptions, HeartbeatState};
use crate::discovery::instance::ServiceInstance;
use crate::discovery::trait_def::Registrar;
use crate::error::{FlareError, Result};
use crate::metrics::DiscoveryMetrics;
use crate::utils::Context;

/// 注册参数
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub namespace: String,
    pub lease_ttl: Duration,
    pub max_retry: usize,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        let heartbeat = HeartbeatOptions::default();
        Self {
            namespace: "/microservices".to_string(),
            lease_ttl: Duration::from_secs(15),
            max_retry: heartbeat.max_retry,
            attempt_timeout: heartbeat.attempt_timeout,
            backoff_base: heartbeat.backoff_base,
            backoff_max: heartbeat.backoff_max,
            jitter: heartbeat.jitter,
        }
    }
}

impl RegistryOptions {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration, jitter: bool) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self.jitter = jitter;
        self
    }

    fn heartbeat_options(&self) -> HeartbeatOptions {
        HeartbeatOptions {
            max_retry: self.max_retry,
            attempt_timeout: self.attempt_timeout,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            jitter: self.jitter,
        }
    }
}

/// 服务注册器
///
/// 所有心跳任务都派生自注册器的根上下文：`close` 或 drop 时取消根上下文，
/// 各心跳任务注销自己的实例后退出。
pub struct ServiceRegistry {
    backend: Arc<dyn DiscoveryBackend>,
    options: RegistryOptions,
    ctx: Context,
    heartbeats: Mutex<HashMap<String, HeartbeatHandle>>,
    metrics: DiscoveryMetrics,
}

impl ServiceRegistry {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, options: RegistryOptions) -> Self {
        Self::with_context(backend, options, &Context::background())
    }

    /// 心跳任务受 `parent` 约束：`parent` 结束时所有实例被注销
    pub fn with_context(
        backend: Arc<dyn DiscoveryBackend>,
        options: RegistryOptions,
        parent: &Context,
    ) -> Self {
        Self {
            backend,
            options,
            ctx: parent.with_cancel(),
            heartbeats: Mutex::new(HashMap::new()),
            metrics: DiscoveryMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn heartbeats(&self) -> std::sync::MutexGuard<'_, HashMap<String, HeartbeatHandle>> {
        self.heartbeats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 实例心跳的当前状态；未注册返回 `None`
    pub fn heartbeat_state(&self, instance: &ServiceInstance) -> Option<HeartbeatState> {
        self.heartbeats()
            .get(&instance.registry_key(&self.options.namespace))
            .map(HeartbeatHandle::state)
    }

    /// 心跳仍在运行的实例数
    pub fn registered_count(&self) -> usize {
        self.heartbeats()
            .values()
            .filter(|h| h.state() != HeartbeatState::Terminated)
            .count()
    }

    /// 注册实例，心跳由 `ctx` 与注册器自身的生命周期共同控制
    ///
    /// 任一方取消时心跳停止续约并注销实例。
    pub async fn register_with_context(
        &self,
        instance: ServiceInstance,
        ctx: &Context,
    ) -> Result<()> {
        self.register_governed(instance, Context::merge(&self.ctx, ctx))
            .await
    }

    async fn register_governed(&self, instance: ServiceInstance, governing: Context) -> Result<()> {
        instance.validate()?;
        if self.ctx.is_done() {
            return Err(FlareError::cancelled("service registry closed"));
        }

        let key = instance.registry_key(&self.options.namespace);
        let lease = governing
            .run(self.backend.register(&instance, self.options.lease_ttl))
            .await??;
        info!(
            service = %instance,
            lease_id = lease.id,
            backend = self.backend.name(),
            "✅ Service registered"
        );

        let engine = HeartbeatEngine::new(
            self.backend.clone(),
            instance,
            self.options.lease_ttl,
            self.options.heartbeat_options(),
            self.metrics.clone(),
        );
        let handle = engine.spawn(lease, &governing);
        let mut heartbeats = self.heartbeats();
        heartbeats.retain(|_, h| h.state() != HeartbeatState::Terminated);
        // 新租约到手后才替换旧心跳；旧心跳只停止续约，不注销同一条记录
        if let Some(previous) = heartbeats.insert(key, handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止所有心跳并注销全部实例
    pub async fn close(&self) {
        self.ctx.cancel();
        let handles: Vec<HeartbeatHandle> = self.heartbeats().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
        info!("Service registry closed");
    }
}

#[async_trait]
impl Registrar for ServiceRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        self.register_governed(instance, self.ctx.clone()).await
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = instance.registry_key(&self.options.namespace);
        if let Some(handle) = self.heartbeats().remove(&key) {
            handle.abort();
        }
        match self.backend.deregister(instance).await {
            Ok(()) => {
                self.metrics.record_deregistration();
                info!(service = %instance, "Service deregistered");
                Ok(())
            }
            Err(e) => {
                warn!(service = %instance, error = %e, "Failed to deregister service");
                Err(e)
            }
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        // 心跳任务收到取消后各自注销实例
        self.ctx.cancel();
    }
}
