//! 刷新循环
//!
//! 每个订阅一个任务：以不透明游标 `last_index` 反复发起 blocking query，
//! 结果变化时替换订阅快照并广播。查询失败时保留旧快照，等待固定间隔后重试。
//! 订阅生命周期结束时退出，并把订阅从订阅中心移除。

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::discovery::backend::DiscoveryBackend;
use crate::discovery::config::EmptyResultPolicy;
use crate::discovery::hub::{HubInner, HubOptions, Subscription};
use crate::error::FlareError;
use crate::metrics::DiscoveryMetrics;
use crate::retry::{FixedRetryPolicy, RetryPolicy};

pub(crate) async fn run(
    hub: Weak<HubInner>,
    subscription: Arc<Subscription>,
    backend: Arc<dyn DiscoveryBackend>,
    options: HubOptions,
    metrics: DiscoveryMetrics,
) {
    let service = subscription.name().to_string();
    let lifecycle = subscription.lifecycle().clone();
    let policy = FixedRetryPolicy::forever(options.retry_interval);
    let mut last_index = 0u64;
    let mut failures = 0usize;
    debug!(service = %service, backend = backend.name(), "Refresh loop started");

    loop {
        let ctx = lifecycle.with_timeout(options.query_timeout);
        let result = ctx
            .run(backend.query(&service, last_index, options.passing_only))
            .await;

        let err: FlareError = match result {
            Ok(Ok(result)) => {
                metrics.record_poll(true);
                if result.index < last_index {
                    // 游标回退（后端重建等），重新建立基线
                    debug!(service = %service, index = result.index, last_index, "Index went backwards, resetting");
                    last_index = 0;
                }
                if result.index != last_index {
                    if !result.instances.is_empty()
                        || options.empty_result_policy == EmptyResultPolicy::Publish
                    {
                        debug!(
                            service = %service,
                            index = result.index,
                            instances = result.instances.len(),
                            "Service changed, broadcasting"
                        );
                        subscription.broadcast(result.instances, &metrics);
                    } else {
                        debug!(service = %service, index = result.index, "Empty result retained");
                    }
                }
                last_index = result.index;
                failures = 0;
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) if lifecycle.is_done() => break,
            Err(e) => e.into(),
        };

        metrics.record_poll(false);
        if !policy.should_retry(failures, &err) {
            break;
        }
        warn!(service = %service, error = %err, failures, "Service query failed, retrying");
        let delay = policy.backoff_duration(failures);
        failures = failures.saturating_add(1);
        tokio::select! {
            _ = lifecycle.done() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(hub) = hub.upgrade() {
        hub.remove_subscription(&subscription);
    }
    debug!(service = %service, "Refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::discovery::backend::{KeepAliveReceiver, Lease, QueryResult};
    use crate::discovery::instance::ServiceInstance;
    use crate::error::Result;
    use crate::utils::Context;

    /// 按脚本返回查询结果；脚本耗尽后查询一直挂起
    #[derive(Default)]
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<QueryResult>>>,
        cursors: Mutex<Vec<u64>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<QueryResult>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                cursors: Mutex::new(Vec::new()),
            })
        }

        fn cursors(&self) -> Vec<u64> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn register(&self, _instance: &ServiceInstance, _ttl: Duration) -> Result<Lease> {
            Err(FlareError::backend_unavailable("not supported"))
        }

        async fn deregister(&self, _instance: &ServiceInstance) -> Result<()> {
            Ok(())
        }

        async fn keep_alive(&self, _lease: &Lease) -> Result<KeepAliveReceiver> {
            Err(FlareError::backend_unavailable("not supported"))
        }

        async fn query(&self, _service: &str, last_index: u64, _passing: bool) -> Result<QueryResult> {
            self.cursors.lock().unwrap().push(last_index);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new("svc", id).with_endpoint(format!("grpc://10.0.0.{}:9090", id))
    }

    fn result(ids: &[&str], index: u64) -> Result<QueryResult> {
        Ok(QueryResult {
            instances: ids.iter().map(|id| instance(id)).collect(),
            index,
        })
    }

    /// 运行刷新循环直到脚本耗尽（第 `queries` 次查询挂起），返回订阅和指标
    async fn drive(
        backend: Arc<ScriptedBackend>,
        policy: EmptyResultPolicy,
        queries: usize,
    ) -> (Arc<Subscription>, DiscoveryMetrics) {
        let subscription = Arc::new(Subscription::new("svc", &Context::background()));
        let metrics = DiscoveryMetrics::new();
        let options = HubOptions::default().with_empty_result_policy(policy);
        let task = tokio::spawn(run(
            Weak::new(),
            subscription.clone(),
            backend.clone(),
            options,
            metrics.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(60), async {
            while backend.cursors().len() < queries {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        subscription.lifecycle().cancel();
        task.await.unwrap();
        (subscription, metrics)
    }

    fn ids(subscription: &Subscription) -> Vec<String> {
        subscription.snapshot().iter().map(|i| i.id().to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_ignores_empty_result() {
        let backend = ScriptedBackend::new(vec![result(&["1"], 2), result(&[], 3)]);
        let (subscription, _) = drive(backend.clone(), EmptyResultPolicy::Retain, 3).await;

        assert_eq!(ids(&subscription), vec!["1"]);
        // 空结果仍然推进游标
        assert_eq!(backend.cursors(), vec![0, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_broadcasts_empty_result() {
        let backend = ScriptedBackend::new(vec![result(&["1"], 2), result(&[], 3)]);
        let (subscription, metrics) = drive(backend, EmptyResultPolicy::Publish, 3).await;

        assert!(subscription.snapshot().is_empty());
        assert_eq!(metrics.snapshot().broadcasts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_keeps_snapshot_and_cursor() {
        let backend = ScriptedBackend::new(vec![
            result(&["1"], 2),
            Err(FlareError::backend_unavailable("consul 503")),
            Err(FlareError::backend_unavailable("consul 503")),
            result(&["1", "2"], 4),
        ]);
        let started = tokio::time::Instant::now();
        let (subscription, metrics) =
            drive(backend.clone(), EmptyResultPolicy::Retain, 5).await;

        assert_eq!(ids(&subscription), vec!["1", "2"]);
        assert_eq!(backend.cursors(), vec![0, 2, 2, 2, 4]);
        assert_eq!(metrics.snapshot().poll_errors, 2);
        assert_eq!(metrics.snapshot().broadcasts, 2);
        // 每次失败后等待固定的重试间隔
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_survives_error_before_next_result() {
        let backend = ScriptedBackend::new(vec![
            result(&["1"], 2),
            Err(FlareError::timeout("query timed out")),
        ]);
        let (subscription, _) = drive(backend, EmptyResultPolicy::Publish, 3).await;
        assert_eq!(ids(&subscription), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_moving_backwards_resets_cursor() {
        let backend = ScriptedBackend::new(vec![
            result(&["1"], 10),
            result(&["2"], 3),
            result(&["2"], 3),
        ]);
        let (subscription, metrics) =
            drive(backend.clone(), EmptyResultPolicy::Retain, 4).await;

        assert_eq!(ids(&subscription), vec!["2"]);
        assert_eq!(backend.cursors(), vec![0, 10, 3, 3]);
        // 同一游标再次返回不会重复广播
        assert_eq!(metrics.snapshot().broadcasts, 2);
    }
}
