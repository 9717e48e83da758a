//! 内存服务发现后端
//!
//! 用于测试和单进程场景。实现了与 consul 相同的 blocking query 语义：
//! 游标与当前 index 相同时等待变化或等待窗口结束。
//! 另外提供故障注入（注册/查询/续约失败、租约吊销）以驱动引擎的重试路径。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DiscoveryBackend, KeepAliveReceiver, KeepAliveResponse, Lease, LeaseId, QueryResult};
use crate::discovery::instance::ServiceInstance;
use crate::error::{FlareError, Result};

/// 默认的服务端等待窗口
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Record {
    instance: ServiceInstance,
    lease_id: LeaseId,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    keepers: Vec<mpsc::Sender<KeepAliveResponse>>,
}

#[derive(Debug, Default)]
struct State {
    /// `name/id` -> 记录
    records: BTreeMap<String, Record>,
    leases: HashMap<LeaseId, LeaseEntry>,
    unhealthy: HashSet<String>,
    next_lease: LeaseId,
    index: u64,
    fail_registers: usize,
    fail_queries: usize,
    fail_keep_alives: usize,
    deregistered: Vec<String>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn snapshot(&self, service: &str, passing_only: bool) -> Vec<ServiceInstance> {
        self.records
            .values()
            .filter(|r| r.instance.name() == service)
            .filter(|r| !passing_only || !self.unhealthy.contains(r.instance.id()))
            .map(|r| r.instance.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    register: AtomicUsize,
    deregister: AtomicUsize,
    keep_alive: AtomicUsize,
    query: AtomicUsize,
    close: AtomicUsize,
}

/// 内存服务发现后端
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    index_tx: watch::Sender<u64>,
    wait_window: Duration,
    calls: CallCounters,
    closed: CancellationToken,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn record_key(name: &str, id: &str) -> String {
    format!("{}/{}", name, id)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_wait_window(DEFAULT_WAIT_WINDOW)
    }

    /// 指定 blocking query 的等待窗口
    pub fn with_wait_window(wait_window: Duration) -> Self {
        // 与 consul/etcd 一致，index 从 1 开始，0 专指"没有基线"
        let (index_tx, _) = watch::channel(1);
        Self {
            state: Mutex::new(State {
                index: 1,
                ..Default::default()
            }),
            index_tx,
            wait_window,
            calls: CallCounters::default(),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // 临界区内不会 panic，中毒时沿用内部数据
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_index(&self, index: u64) {
        self.index_tx.send_replace(index);
    }

    /// 接下来 `n` 次注册失败
    pub fn fail_next_registers(&self, n: usize) {
        self.lock().fail_registers = n;
    }

    /// 接下来 `n` 次查询失败
    pub fn fail_next_queries(&self, n: usize) {
        self.lock().fail_queries = n;
    }

    /// 接下来 `n` 次续约请求失败
    pub fn fail_next_keep_alives(&self, n: usize) {
        self.lock().fail_keep_alives = n;
    }

    /// 吊销租约：关闭所有续约通道并删除绑定的记录
    pub fn revoke_lease(&self, lease_id: LeaseId) -> bool {
        let index = {
            let mut state = self.lock();
            let Some(_entry) = state.leases.remove(&lease_id) else {
                return false;
            };
            let before = state.records.len();
            state.records.retain(|_, r| r.lease_id != lease_id);
            if state.records.len() != before {
                Some(state.bump())
            } else {
                None
            }
        };
        if let Some(index) = index {
            self.publish_index(index);
        }
        debug!(lease_id, "Lease revoked");
        true
    }

    /// 吊销实例当前绑定的租约
    pub fn revoke_instance(&self, name: &str, id: &str) -> bool {
        let lease_id = self
            .lock()
            .records
            .get(&record_key(name, id))
            .map(|r| r.lease_id);
        match lease_id {
            Some(lease_id) => self.revoke_lease(lease_id),
            None => false,
        }
    }

    /// 设置实例健康状态（影响 `passing_only` 查询）
    pub fn set_passing(&self, id: &str, passing: bool) {
        let index = {
            let mut state = self.lock();
            let changed = if passing {
                state.unhealthy.remove(id)
            } else {
                state.unhealthy.insert(id.to_string())
            };
            changed.then(|| state.bump())
        };
        if let Some(index) = index {
            self.publish_index(index);
        }
    }

    /// 当前 index
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// 某服务当前的全部实例（不区分健康状态）
    pub fn instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.lock().snapshot(service, false)
    }

    /// 实例当前绑定的租约
    pub fn lease_of(&self, name: &str, id: &str) -> Option<LeaseId> {
        self.lock()
            .records
            .get(&record_key(name, id))
            .map(|r| r.lease_id)
    }

    /// 按顺序记录的被注销实例 `name/id`
    pub fn deregistered(&self) -> Vec<String> {
        self.lock().deregistered.clone()
    }

    pub fn register_calls(&self) -> usize {
        self.calls.register.load(Ordering::SeqCst)
    }

    pub fn deregister_calls(&self) -> usize {
        self.calls.deregister.load(Ordering::SeqCst)
    }

    pub fn keep_alive_calls(&self) -> usize {
        self.calls.keep_alive.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.calls.query.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.calls.close.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(FlareError::backend_unavailable("memory backend closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<Lease> {
        self.calls.register.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let key = record_key(instance.name(), instance.id());
        let (lease, index) = {
            let mut state = self.lock();
            if state.fail_registers > 0 {
                state.fail_registers -= 1;
                return Err(FlareError::backend_unavailable("injected register failure"));
            }
            state.next_lease += 1;
            let lease_id = state.next_lease;
            state.leases.insert(
                lease_id,
                LeaseEntry {
                    ttl,
                    keepers: Vec::new(),
                },
            );
            let changed = state
                .records
                .get(&key)
                .map(|r| !r.instance.equivalent(instance))
                .unwrap_or(true);
            state.records.insert(
                key.clone(),
                Record {
                    instance: instance.clone(),
                    lease_id,
                },
            );
            let index = changed.then(|| state.bump());
            (
                Lease {
                    id: lease_id,
                    key,
                    ttl,
                },
                index,
            )
        };
        if let Some(index) = index {
            self.publish_index(index);
        }
        Ok(lease)
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        self.calls.deregister.fetch_add(1, Ordering::SeqCst);
        let key = record_key(instance.name(), instance.id());
        let index = {
            let mut state = self.lock();
            state.deregistered.push(key.clone());
            state.records.remove(&key).map(|_| state.bump())
        };
        if let Some(index) = index {
            self.publish_index(index);
        }
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveReceiver> {
        self.calls.keep_alive.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let mut state = self.lock();
        if state.fail_keep_alives > 0 {
            state.fail_keep_alives -= 1;
            return Err(FlareError::backend_unavailable("injected keep-alive failure"));
        }
        let entry = state
            .leases
            .get_mut(&lease.id)
            .ok_or_else(|| FlareError::lease_lost(format!("lease {} not found", lease.id)))?;
        let (tx, rx) = mpsc::channel(16);
        let _ = tx.try_send(KeepAliveResponse {
            lease_id: lease.id,
            ttl: entry.ttl,
        });
        entry.keepers.push(tx);
        Ok(rx)
    }

    async fn query(
        &self,
        service: &str,
        last_index: u64,
        passing_only: bool,
    ) -> Result<QueryResult> {
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let mut index_rx = self.index_tx.subscribe();
        {
            let mut state = self.lock();
            if state.fail_queries > 0 {
                state.fail_queries -= 1;
                return Err(FlareError::backend_unavailable("injected query failure"));
            }
            if last_index == 0 || state.index != last_index {
                return Ok(QueryResult {
                    instances: state.snapshot(service, passing_only),
                    index: state.index,
                });
            }
        }

        tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(FlareError::backend_unavailable("memory backend closed"));
            }
            _ = tokio::time::timeout(self.wait_window, index_rx.changed()) => {}
        }

        let state = self.lock();
        Ok(QueryResult {
            instances: state.snapshot(service, passing_only),
            index: state.index,
        })
    }

    async fn close(&self) -> Result<()> {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}
