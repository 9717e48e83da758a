//! 指标收集模块
//!
//! 服务发现各组件的计数器。心跳耗尽重试等终止性失败不会同步返回给调用方，
//! 只能通过日志和这里的计数器观察。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lease_renewals: u64,
    pub reregister_attempts: u64,
    pub heartbeat_terminations: u64,
    pub deregistrations: u64,
    pub poll_success: u64,
    pub poll_errors: u64,
    pub broadcasts: u64,
    pub coalesced_notifications: u64,
    pub address_publishes: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    lease_renewals: AtomicU64,
    reregister_attempts: AtomicU64,
    heartbeat_terminations: AtomicU64,
    deregistrations: AtomicU64,
    poll_success: AtomicU64,
    poll_errors: AtomicU64,
    broadcasts: AtomicU64,
    coalesced_notifications: AtomicU64,
    address_publishes: AtomicU64,
    publish_failures: AtomicU64,
}

/// 指标收集器
#[derive(Debug, Clone, Default)]
pub struct DiscoveryMetrics {
    counters: Arc<Counters>,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lease_renewal(&self) {
        self.counters.lease_renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reregister_attempt(&self) {
        self.counters.reregister_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_termination(&self) {
        self.counters.heartbeat_terminations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deregistration(&self) {
        self.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self, success: bool) {
        if success {
            self.counters.poll_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_broadcast(&self, coalesced: u64) {
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .coalesced_notifications
            .fetch_add(coalesced, Ordering::Relaxed);
    }

    pub fn record_publish(&self, success: bool) {
        if success {
            self.counters.address_publishes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            lease_renewals: c.lease_renewals.load(Ordering::Relaxed),
            reregister_attempts: c.reregister_attempts.load(Ordering::Relaxed),
            heartbeat_terminations: c.heartbeat_terminations.load(Ordering::Relaxed),
            deregistrations: c.deregistrations.load(Ordering::Relaxed),
            poll_success: c.poll_success.load(Ordering::Relaxed),
            poll_errors: c.poll_errors.load(Ordering::Relaxed),
            broadcasts: c.broadcasts.load(Ordering::Relaxed),
            coalesced_notifications: c.coalesced_notifications.load(Ordering::Relaxed),
            address_publishes: c.address_publishes.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = DiscoveryMetrics::new();
        let clone = metrics.clone();
        clone.record_poll(true);
        clone.record_poll(false);
        clone.record_broadcast(2);
        metrics.record_publish(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.poll_success, 1);
        assert_eq!(snap.poll_errors, 1);
        assert_eq!(snap.broadcasts, 1);
        assert_eq!(snap.coalesced_notifications, 2);
        assert_eq!(snap.publish_failures, 1);
    }
}
