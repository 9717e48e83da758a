//! 服务发现后端抽象和实现
//!
//! 引擎只通过 [`DiscoveryBackend`] 与协调存储交互，对具体是 consul 风格
//! （blocking query + 不透明 index 游标）还是 etcd 风格（lease + watch）无感知。

pub mod memory;

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "etcd")]
pub mod etcd;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::discovery::instance::ServiceInstance;
use crate::error::Result;

/// 租约 ID
pub type LeaseId = i64;

/// 注册成功后后端返回的租约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// 租约 ID（etcd lease；consul 下为本地编号）
    pub id: LeaseId,

    /// 租约绑定的键（etcd key；consul 下为 TTL check ID）
    pub key: String,

    /// 租约 TTL
    pub ttl: Duration,
}

/// 一次成功续约的响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease_id: LeaseId,
    pub ttl: Duration,
}

/// 续约通道：租约丢失时关闭
pub type KeepAliveReceiver = mpsc::Receiver<KeepAliveResponse>;

/// blocking query 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub instances: Vec<ServiceInstance>,

    /// 新的游标；与传入的 `last_index` 相同表示没有变化
    pub index: u64,
}

/// 服务发现后端 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait。
/// 取消通过丢弃 future（或与 [`crate::utils::Context`] 竞争）表达。
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    /// 注册服务实例并获取新租约
    ///
    /// 同一 `(name, id)` 重复注册会覆盖已有记录，不会产生重复条目
    async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<Lease>;

    /// 注销服务实例
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// 开始续约，返回的通道在租约丢失时关闭
    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveReceiver>;

    /// blocking query
    ///
    /// `last_index == 0` 表示没有基线，立即返回；否则在状态变化或服务端等待窗口
    /// 结束时返回。调用方负责用超时约束本次调用。
    async fn query(&self, service: &str, last_index: u64, passing_only: bool)
        -> Result<QueryResult>;

    /// 一次性获取服务实例列表
    async fn get_service(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.query(service, 0, true).await?.instances)
    }

    /// 关闭后端会话
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
