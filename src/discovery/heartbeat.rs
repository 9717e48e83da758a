//! 心跳引擎
//!
//! 为一个已注册的实例维持租约：
//! `Alive(lease)` --续约通道关闭--> `Retrying(attempt)` --重新注册成功--> `Alive(new lease)`；
//! 连续 `max_retry` 次重新注册失败，或上下文结束 --> `Terminated`（尽力注销后退出）。
//! 终止性失败不会返回给调用方，只能通过日志、指标和 [`HeartbeatHandle::state`] 观察。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::backend::{DiscoveryBackend, KeepAliveReceiver, Lease, LeaseId};
use crate::discovery::instance::ServiceInstance;
use crate::error::FlareError;
use crate::metrics::DiscoveryMetrics;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::utils::{Context, ContextError};

/// 心跳状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// 租约有效
    Alive { lease_id: LeaseId },
    /// 正在进行第 `attempt` 次重新注册（从 1 开始）
    Retrying { attempt: usize },
    /// 已退出
    Terminated,
}

/// 心跳参数
#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    /// 租约丢失后连续重新注册的最大次数
    pub max_retry: usize,
    /// 单次重新注册（含续约建立）的超时
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: bool,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            max_retry: 5,
            attempt_timeout: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(16),
            jitter: true,
        }
    }
}

/// 心跳引擎
pub struct HeartbeatEngine {
    backend: Arc<dyn DiscoveryBackend>,
    instance: ServiceInstance,
    ttl: Duration,
    options: HeartbeatOptions,
    metrics: DiscoveryMetrics,
}

/// 运行中的心跳任务句柄
pub struct HeartbeatHandle {
    ctx: Context,
    state: watch::Receiver<HeartbeatState>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// 当前状态
    pub fn state(&self) -> HeartbeatState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.state.clone()
    }

    /// 等待心跳进入 `Terminated`
    pub async fn terminated(&mut self) {
        let _ = self
            .state
            .wait_for(|s| *s == HeartbeatState::Terminated)
            .await;
    }

    /// 取消心跳，任务会尽力注销实例后退出
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// 取消心跳并等待任务退出
    pub async fn stop(self) {
        self.ctx.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task join failed");
        }
    }

    /// 直接终止任务，不注销实例
    pub fn abort(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum Exit {
    Cancelled,
    Exhausted,
}

impl HeartbeatEngine {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        instance: ServiceInstance,
        ttl: Duration,
        options: HeartbeatOptions,
        metrics: DiscoveryMetrics,
    ) -> Self {
        Self {
            backend,
            instance,
            ttl,
            options,
            metrics,
        }
    }

    /// 以已经获取的租约启动心跳任务
    ///
    /// 返回的句柄持有 `ctx` 派生出的子上下文，取消任一方都会结束心跳
    pub fn spawn(self, lease: Lease, ctx: &Context) -> HeartbeatHandle {
        let ctx = ctx.with_cancel();
        let (state_tx, state_rx) = watch::channel(HeartbeatState::Alive { lease_id: lease.id });
        let task = tokio::spawn(self.run(lease, ctx.clone(), state_tx));
        HeartbeatHandle {
            ctx,
            state: state_rx,
            task,
        }
    }

    async fn run(self, lease: Lease, ctx: Context, state: watch::Sender<HeartbeatState>) {
        let policy = ExponentialBackoffPolicy::new(
            self.options.max_retry,
            self.options.backoff_base,
            self.options.backoff_max,
        )
        .with_jitter(self.options.jitter);

        let mut lease_id = lease.id;
        let mut keep_alive = match ctx.run(self.backend.keep_alive(&lease)).await {
            Ok(Ok(rx)) => Some(rx),
            Ok(Err(e)) => {
                warn!(
                    service = %self.instance,
                    lease_id,
                    error = %e,
                    "Failed to start lease keep-alive"
                );
                None
            }
            Err(_) => None,
        };

        let exit = loop {
            if let Some(rx) = keep_alive.as_mut() {
                if self.renew(rx, lease_id, &ctx).await.is_err() {
                    break Exit::Cancelled;
                }
            }
            if ctx.is_done() {
                break Exit::Cancelled;
            }

            warn!(service = %self.instance, lease_id, "Lease lost, re-registering");
            match self.reacquire(&ctx, &policy, &state).await {
                Ok((lease, rx)) => {
                    lease_id = lease.id;
                    keep_alive = Some(rx);
                    state.send_replace(HeartbeatState::Alive { lease_id });
                }
                Err(exit) => break exit,
            }
        };

        match exit {
            Exit::Cancelled => {
                info!(service = %self.instance, "Heartbeat cancelled, deregistering");
            }
            Exit::Exhausted => {
                error!(
                    service = %self.instance,
                    max_retry = self.options.max_retry,
                    "Heartbeat terminated after exhausting re-registration attempts"
                );
                self.metrics.record_heartbeat_termination();
            }
        }
        self.deregister().await;
        state.send_replace(HeartbeatState::Terminated);
    }

    /// 消费续约响应，直到通道关闭（返回 `Ok`）或上下文结束（返回 `Err`）
    async fn renew(
        &self,
        rx: &mut KeepAliveReceiver,
        lease_id: LeaseId,
        ctx: &Context,
    ) -> Result<(), ContextError> {
        loop {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                resp = rx.recv() => match resp {
                    Some(resp) => {
                        self.metrics.record_lease_renewal();
                        debug!(lease_id, ttl = ?resp.ttl, "Lease renewed");
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn reacquire(
        &self,
        ctx: &Context,
        policy: &ExponentialBackoffPolicy,
        state: &watch::Sender<HeartbeatState>,
    ) -> Result<(Lease, KeepAliveReceiver), Exit> {
        for attempt in 0..self.options.max_retry {
            if ctx.is_done() {
                return Err(Exit::Cancelled);
            }
            state.send_replace(HeartbeatState::Retrying {
                attempt: attempt + 1,
            });
            self.metrics.record_reregister_attempt();

            let attempt_ctx = ctx.with_timeout(self.options.attempt_timeout);
            let result = attempt_ctx
                .run(async {
                    let lease = self.backend.register(&self.instance, self.ttl).await?;
                    let rx = self.backend.keep_alive(&lease).await?;
                    Ok::<_, FlareError>((lease, rx))
                })
                .await;

            let err: FlareError = match result {
                Ok(Ok((lease, rx))) => {
                    info!(
                        service = %self.instance,
                        lease_id = lease.id,
                        attempt = attempt + 1,
                        "Service instance re-registered"
                    );
                    return Ok((lease, rx));
                }
                Ok(Err(e)) => e,
                Err(_) if ctx.is_done() => return Err(Exit::Cancelled),
                Err(e) => e.into(),
            };
            warn!(
                service = %self.instance,
                attempt = attempt + 1,
                error = %err,
                "Re-registration attempt failed"
            );

            if attempt + 1 < self.options.max_retry {
                let delay = policy.backoff_duration(attempt);
                debug!(attempt = attempt + 1, delay = ?delay, "Backing off before next attempt");
                tokio::select! {
                    _ = ctx.done() => return Err(Exit::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Err(Exit::Exhausted)
    }

    async fn deregister(&self) {
        match tokio::time::timeout(
            self.options.attempt_timeout,
            self.backend.deregister(&self.instance),
        )
        .await
        {
            Ok(Ok(())) => {
                self.metrics.record_deregistration();
                info!(service = %self.instance, "Service instance deregistered");
            }
            Ok(Err(e)) => {
                warn!(service = %self.instance, error = %e, "Failed to deregister service instance");
            }
            Err(_) => {
                warn!(service = %self.instance, "Deregister timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::memory::MemoryBackend;

    fn instance() -> ServiceInstance {
        ServiceInstance::new("svc", "1").with_endpoint("grpc://10.0.0.1:9090")
    }

    fn options(max_retry: usize) -> HeartbeatOptions {
        HeartbeatOptions {
            max_retry,
            jitter: false,
            ..Default::default()
        }
    }

    async fn start(
        backend: &Arc<MemoryBackend>,
        max_retry: usize,
        metrics: &DiscoveryMetrics,
    ) -> (Lease, HeartbeatHandle) {
        let ttl = Duration::from_secs(15);
        let lease = backend.register(&instance(), ttl).await.unwrap();
        let engine = HeartbeatEngine::new(
            backend.clone(),
            instance(),
            ttl,
            options(max_retry),
            metrics.clone(),
        );
        let handle = engine.spawn(lease.clone(), &Context::background());
        (lease, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_loss_reregisters() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = DiscoveryMetrics::new();
        let (lease, handle) = start(&backend, 3, &metrics).await;
        let mut state = handle.subscribe();
        tokio::task::yield_now().await;

        assert!(backend.revoke_lease(lease.id));
        state
            .wait_for(|s| matches!(s, HeartbeatState::Alive { lease_id } if *lease_id != lease.id))
            .await
            .unwrap();

        assert_eq!(backend.instances("svc").len(), 1);
        assert_eq!(backend.register_calls(), 2);
        assert_eq!(metrics.snapshot().reregister_attempts, 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_terminate_and_deregister() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = DiscoveryMetrics::new();
        let (lease, mut handle) = start(&backend, 3, &metrics).await;
        tokio::task::yield_now().await;

        backend.fail_next_registers(usize::MAX);
        let started = tokio::time::Instant::now();
        backend.revoke_lease(lease.id);
        handle.terminated().await;

        // 初始注册 1 次 + 重新注册 3 次
        assert_eq!(backend.register_calls(), 4);
        assert_eq!(metrics.snapshot().reregister_attempts, 3);
        assert_eq!(metrics.snapshot().heartbeat_terminations, 1);
        assert_eq!(backend.deregister_calls(), 1);
        // 退避 1s + 2s，最后一次失败后不再等待
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deregisters_without_retry() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = DiscoveryMetrics::new();
        let (_lease, handle) = start(&backend, 3, &metrics).await;
        tokio::task::yield_now().await;
        assert!(matches!(handle.state(), HeartbeatState::Alive { .. }));

        handle.stop().await;
        assert_eq!(backend.deregister_calls(), 1);
        assert_eq!(backend.deregistered(), vec!["svc/1".to_string()]);
        assert_eq!(metrics.snapshot().reregister_attempts, 0);
        assert!(backend.instances("svc").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keep_alive_start_triggers_reregister() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = DiscoveryMetrics::new();
        backend.fail_next_keep_alives(1);
        let (_lease, handle) = start(&backend, 3, &metrics).await;
        let mut state = handle.subscribe();

        state
            .wait_for(|s| matches!(s, HeartbeatState::Alive { lease_id } if *lease_id > 1))
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().reregister_attempts, 1);
        handle.stop().await;
    }
}
