//! 订阅中心
//!
//! 每个服务名对应一个 [`Subscription`]：保存最新的实例快照和全部订阅者，
//! 由一个刷新循环（见 [`crate::discovery::refresh`]）驱动。
//! 同一服务名的多次 `watch` 共享同一个订阅和刷新循环。
//!
//! 锁的划分：
//! - 订阅表：中心级读写锁，只在创建/删除订阅时写
//! - 订阅者集合：每个订阅自己的读写锁，广播时只读
//! - 快照：`ArcSwap` 原子替换，读路径无锁，从不原地修改

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::config::EmptyResultPolicy;
use crate::discovery::instance::ServiceInstance;
use crate::discovery::refresh;
use crate::discovery::trait_def::{Discovery, Watcher};
use crate::error::{FlareError, Result};
use crate::metrics::DiscoveryMetrics;
use crate::utils::Context;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// 订阅中心参数
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// 单次 blocking query 的超时
    pub query_timeout: Duration,
    /// 查询失败后的重试间隔
    pub retry_interval: Duration,
    pub passing_only: bool,
    pub empty_result_policy: EmptyResultPolicy,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
            passing_only: true,
            empty_result_policy: EmptyResultPolicy::Retain,
        }
    }
}

impl HubOptions {
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    pub fn with_empty_result_policy(mut self, policy: EmptyResultPolicy) -> Self {
        self.empty_result_policy = policy;
        self
    }
}

/// 单个服务的订阅
pub struct Subscription {
    name: String,
    snapshot: ArcSwap<Vec<ServiceInstance>>,
    watchers: RwLock<HashMap<u64, mpsc::Sender<()>>>,
    lifecycle: Context,
    next_id: AtomicU64,
}

impl Subscription {
    pub(crate) fn new(name: &str, parent: &Context) -> Self {
        Self {
            name: name.to_string(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            watchers: RwLock::new(HashMap::new()),
            lifecycle: parent.with_cancel(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.snapshot.load_full()
    }

    pub fn watcher_count(&self) -> usize {
        read(&self.watchers).len()
    }

    /// 生命周期上下文：最后一个订阅者退出或订阅中心关闭时结束
    pub fn lifecycle(&self) -> &Context {
        &self.lifecycle
    }

    /// 替换快照并通知所有订阅者
    ///
    /// 通知槽已满的订阅者直接跳过：它们下一次 `next` 会读到最新快照
    pub(crate) fn broadcast(&self, instances: Vec<ServiceInstance>, metrics: &DiscoveryMetrics) {
        self.snapshot.store(Arc::new(instances));

        let mut coalesced = 0;
        for tx in read(&self.watchers).values() {
            match tx.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => coalesced += 1,
                Err(TrySendError::Closed(())) => {}
            }
        }
        metrics.record_broadcast(coalesced);
    }

    /// 加入一个订阅者；生命周期已结束时返回 `None`
    fn attach(&self) -> Option<(u64, mpsc::Receiver<()>)> {
        let mut watchers = write(&self.watchers);
        if self.lifecycle.is_done() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        if !self.snapshot.load().is_empty() {
            let _ = tx.try_send(());
        }
        watchers.insert(id, tx);
        Some((id, rx))
    }

    /// 移除订阅者；集合变空时结束生命周期并返回 `true`
    fn detach(&self, id: u64) -> bool {
        let mut watchers = write(&self.watchers);
        if watchers.remove(&id).is_none() {
            return false;
        }
        if watchers.is_empty() {
            self.lifecycle.cancel();
            return true;
        }
        false
    }
}

pub(crate) struct HubInner {
    backend: Arc<dyn DiscoveryBackend>,
    options: HubOptions,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    metrics: DiscoveryMetrics,
    ctx: Context,
    closed: AtomicBool,
}

impl HubInner {
    /// 仅当表中仍是同一个订阅时才删除
    pub(crate) fn remove_subscription(&self, subscription: &Arc<Subscription>) {
        let mut table = write(&self.subscriptions);
        if let Some(current) = table.get(subscription.name()) {
            if Arc::ptr_eq(current, subscription) {
                table.remove(subscription.name());
                debug!(service = %subscription.name(), "Subscription removed");
            }
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// 订阅中心
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, options: HubOptions) -> Self {
        Self::with_context(backend, options, &Context::background())
    }

    /// 所有订阅的生命周期都派生自 `parent`
    pub fn with_context(
        backend: Arc<dyn DiscoveryBackend>,
        options: HubOptions,
        parent: &Context,
    ) -> Self {
        Self::with_metrics(backend, options, parent, DiscoveryMetrics::new())
    }

    pub fn with_metrics(
        backend: Arc<dyn DiscoveryBackend>,
        options: HubOptions,
        parent: &Context,
        metrics: DiscoveryMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend,
                options,
                subscriptions: RwLock::new(HashMap::new()),
                metrics,
                ctx: parent.with_cancel(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.inner.metrics
    }

    pub fn options(&self) -> &HubOptions {
        &self.inner.options
    }

    /// 订阅服务：同名订阅复用同一个刷新循环
    pub fn subscribe(&self, name: &str) -> Result<WatcherHandle> {
        if self.inner.ctx.is_done() {
            return Err(FlareError::watcher_closed("subscription hub closed"));
        }

        let mut table = write(&self.inner.subscriptions);
        if let Some(existing) = table.get(name).cloned() {
            if let Some((id, events)) = existing.attach() {
                return Ok(self.handle(id, events, existing));
            }
        }

        // 不存在，或旧订阅刚结束生命周期：替换为新订阅
        let subscription = Arc::new(Subscription::new(name, &self.inner.ctx));
        let (id, events) = subscription
            .attach()
            .ok_or_else(|| FlareError::watcher_closed("subscription hub closed"))?;
        table.insert(name.to_string(), subscription.clone());
        drop(table);

        tokio::spawn(refresh::run(
            Arc::downgrade(&self.inner),
            subscription.clone(),
            self.inner.backend.clone(),
            self.inner.options.clone(),
            self.inner.metrics.clone(),
        ));
        info!(service = %name, "Subscription created");
        Ok(self.handle(id, events, subscription))
    }

    fn handle(
        &self,
        id: u64,
        events: mpsc::Receiver<()>,
        subscription: Arc<Subscription>,
    ) -> WatcherHandle {
        WatcherHandle {
            id,
            events,
            cancel: subscription.lifecycle.with_cancel(),
            subscription,
            hub: Arc::downgrade(&self.inner),
            closed: false,
        }
    }

    /// 订阅（若存在）
    pub fn subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        read(&self.inner.subscriptions).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.inner.subscriptions).contains_key(name)
    }

    pub fn subscription_count(&self) -> usize {
        read(&self.inner.subscriptions).len()
    }
}

#[async_trait]
impl Discovery for SubscriptionHub {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        if let Some(subscription) = self.subscription(name) {
            let snapshot = subscription.snapshot();
            if !snapshot.is_empty() {
                return Ok(snapshot.as_ref().clone());
            }
        }

        let query = self
            .inner
            .backend
            .query(name, 0, self.inner.options.passing_only);
        match tokio::time::timeout(self.inner.options.query_timeout, query).await {
            Ok(Ok(result)) if !result.instances.is_empty() => Ok(result.instances),
            Ok(Ok(_)) => Err(FlareError::service_not_found(name)),
            Ok(Err(e)) => {
                warn!(service = %name, error = %e, "Failed to query service");
                Err(FlareError::service_not_found(name).with_details(e.to_string()))
            }
            Err(_) => Err(FlareError::service_not_found(name).with_details("query timeout")),
        }
    }

    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(self.subscribe(name)?))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ctx.cancel();
        write(&self.inner.subscriptions).clear();
        info!(backend = self.inner.backend.name(), "Subscription hub closed");
        self.inner.backend.close().await
    }
}

/// 订阅者句柄
///
/// `next` 在收到通知后读取订阅的当前快照，因此被合并掉的通知不会导致读到旧数据。
/// drop 时自动退订。
pub struct WatcherHandle {
    id: u64,
    events: mpsc::Receiver<()>,
    subscription: Arc<Subscription>,
    hub: Weak<HubInner>,
    cancel: Context,
    closed: bool,
}

impl WatcherHandle {
    pub fn service(&self) -> &str {
        self.subscription.name()
    }

    /// 当前快照（不等待通知）
    pub fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.subscription.snapshot()
    }

    /// 转换为实例列表流，订阅关闭或取消时结束
    pub fn into_stream(self) -> impl Stream<Item = Vec<ServiceInstance>> + Send {
        stream::unfold(self, |mut handle| async move {
            match handle.next().await {
                Ok(instances) => Some((instances, handle)),
                Err(e) => {
                    debug!(service = %handle.service(), error = %e, "Watcher stream ended");
                    None
                }
            }
        })
    }

    fn detach(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if self.subscription.detach(self.id) {
            debug!(service = %self.subscription.name(), "Last watcher detached");
            if let Some(hub) = self.hub.upgrade() {
                hub.remove_subscription(&self.subscription);
            }
        }
    }
}

#[async_trait]
impl Watcher for WatcherHandle {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>> {
        if self.closed {
            return Err(FlareError::watcher_closed("watcher closed"));
        }
        tokio::select! {
            biased;
            _ = self.cancel.done() => Err(FlareError::cancelled("watcher cancelled")),
            event = self.events.recv() => match event {
                Some(()) => Ok(self.subscription.snapshot().as_ref().clone()),
                None => Err(FlareError::watcher_closed("watcher channel closed")),
            },
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
