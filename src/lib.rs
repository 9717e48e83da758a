//! Flare Discovery
//!
//! 服务注册与发现客户端：租约续期、订阅分发以及 gRPC 地址解析。

pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod utils;

// Re-exports
pub use config::{Config, ServiceConfig};
pub use discovery::{
    Address, AddressUpdater, BackendType, BalanceChannelUpdater, DataCenter, Discovery,
    DiscoveryBackend, DiscoveryConfig, DiscoveryFactory, DiscoveryResolver,
    DiscoveryResolverBuilder, EmptyResultPolicy, HeartbeatState, Registrar, ServiceInstance,
    ServiceRegistry, SubscriptionHub, Watcher, WatcherHandle,
};
pub use error::{ErrorBuilder, ErrorCategory, ErrorCode, FlareError, Result};
pub use metrics::{DiscoveryMetrics, MetricsSnapshot};
pub use retry::*;
pub use utils::*;
