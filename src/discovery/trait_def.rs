//! 服务注册发现 Trait 定义

use async_trait::async_trait;

use crate::discovery::instance::ServiceInstance;
use crate::error::Result;

/// 服务注册
#[async_trait]
pub trait Registrar: Send + Sync {
    /// 注册服务实例并开始续约
    async fn register(&self, instance: ServiceInstance) -> Result<()>;

    /// 注销服务实例
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;
}

/// 服务发现
#[async_trait]
pub trait Discovery: Send + Sync {
    /// 获取服务当前的实例列表
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// 订阅服务变化
    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>>;

    /// 关闭发现会话
    async fn close(&self) -> Result<()>;
}

/// 服务变化订阅
#[async_trait]
pub trait Watcher: Send + Sync {
    /// 阻塞直到收到通知，然后返回最新的实例快照
    async fn next(&mut self) -> Result<Vec<ServiceInstance>>;

    /// 停止订阅
    async fn close(&mut self) -> Result<()>;
}
