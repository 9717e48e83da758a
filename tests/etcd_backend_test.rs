//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! # 使用 Docker 启动 etcd
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

#![cfg(feature = "etcd")]

use std::sync::Arc;

use flare_discovery::discovery::{
    BackendType, Discovery, DiscoveryBackend, DiscoveryConfig, DiscoveryFactory, Registrar,
    ServiceInstance, Watcher,
};
use tokio::time::{Duration, sleep, timeout};

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

/// 测试命名空间
const TEST_NAMESPACE: &str = "/flare-test";

fn create_test_config() -> DiscoveryConfig {
    DiscoveryConfig {
        backend: BackendType::Etcd,
        endpoints: etcd_endpoints(),
        namespace: TEST_NAMESPACE.to_string(),
        lease_ttl: 5,
        ..Default::default()
    }
}

fn create_test_instance(service: &str, id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(service, id)
        .with_version("v1.0.0")
        .with_metadata("cluster", "test")
        .with_endpoint(format!("grpc://127.0.0.1:{}", port))
}

async fn create_backend() -> Arc<dyn DiscoveryBackend> {
    DiscoveryFactory::create_backend(&create_test_config())
        .await
        .expect("Failed to create etcd backend")
}

/// 测试：注册后可查询，注销后消失
#[tokio::test]
#[ignore]
async fn test_etcd_register_and_deregister() {
    let backend = create_backend().await;
    let instance = create_test_instance("etcd-register", "node-1", 8080);

    backend
        .register(&instance, Duration::from_secs(5))
        .await
        .expect("Failed to register service");
    let instances = backend.get_service("etcd-register").await.unwrap();
    assert!(instances.iter().any(|i| i.id() == "node-1"));

    backend.deregister(&instance).await.unwrap();
    let instances = backend.get_service("etcd-register").await.unwrap();
    assert!(instances.iter().all(|i| i.id() != "node-1"));
}

/// 测试：心跳使记录在超过 TTL 后仍然存在
#[tokio::test]
#[ignore]
async fn test_etcd_heartbeat_keeps_instance_alive() {
    let config = create_test_config();
    let instance = create_test_instance("etcd-heartbeat", "node-1", 8081);
    let (registry, hub) = DiscoveryFactory::register_and_discover(&config, instance.clone())
        .await
        .expect("Failed to register service");

    sleep(Duration::from_secs(config.lease_ttl * 2)).await;
    let instances = hub.get_service("etcd-heartbeat").await.unwrap();
    assert!(instances.iter().any(|i| i.id() == "node-1"));

    registry.deregister(&instance).await.unwrap();
    registry.close().await;
}

/// 测试：订阅收到新实例
#[tokio::test]
#[ignore]
async fn test_etcd_watch() {
    let config = create_test_config();
    let backend = create_backend().await;
    let metrics = Default::default();
    let registry = DiscoveryFactory::create_registry(backend.clone(), &config, &metrics);
    let hub = DiscoveryFactory::create_hub(backend, &config, &metrics);

    let mut watcher = hub.watch("etcd-watch").await.unwrap();
    let instance = create_test_instance("etcd-watch", "node-1", 8082);
    registry.register(instance.clone()).await.unwrap();

    let instances = timeout(Duration::from_secs(10), watcher.next())
        .await
        .expect("No change observed")
        .unwrap();
    assert!(instances.iter().any(|i| i.id() == "node-1"));

    watcher.close().await.unwrap();
    registry.close().await;
    hub.close().await.unwrap();
}
