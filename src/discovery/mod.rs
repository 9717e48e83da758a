//! 服务注册与发现模块
//!
//! - 注册侧：[`ServiceRegistry`] 登记实例，并为每个实例启动一个 [`HeartbeatEngine`] 续约租约
//! - 发现侧：[`SubscriptionHub`] 按服务名合并订阅，刷新循环以 blocking query 驱动快照
//! - 解析侧：[`DiscoveryResolver`] 把快照转换为 gRPC 地址列表，交给 [`AddressUpdater`]
//!
//! 后端（内存、etcd、consul）实现 [`DiscoveryBackend`]，在构造时选定。

pub mod address;
pub mod backend;
pub mod balance;
pub mod config;
pub mod factory;
pub mod heartbeat;
pub mod hub;
pub mod instance;
mod refresh;
pub mod registry;
pub mod resolver;
pub mod trait_def;

pub use address::Address;
pub use backend::{DiscoveryBackend, KeepAliveResponse, Lease, LeaseId, QueryResult};
pub use balance::BalanceChannelUpdater;
pub use config::{BackendType, DataCenter, DiscoveryConfig, EmptyResultPolicy};
pub use factory::DiscoveryFactory;
pub use heartbeat::{HeartbeatEngine, HeartbeatHandle, HeartbeatOptions, HeartbeatState};
pub use hub::{HubOptions, Subscription, SubscriptionHub, WatcherHandle};
pub use instance::ServiceInstance;
pub use registry::{RegistryOptions, ServiceRegistry};
pub use resolver::{
    AddressUpdater, CLUSTER_KEY, DiscoveryResolver, DiscoveryResolverBuilder, ResolverOptions,
    ZONE_KEY, build_addresses,
};
pub use trait_def::{Discovery, Registrar, Watcher};
