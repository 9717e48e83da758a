use super::RetryPolicy;
use crate::error::FlareError;
use rand::Rng;
use std::time::Duration;

/// 指数退避重试策略
///
/// 第 `n` 次失败后的等待上限为 `min(base * 2^n, max_delay)`；
/// 开启抖动时实际等待时间在 `[上限/2, 上限]` 之间均匀随机
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// 开启/关闭抖动
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// 第 `attempt` 次失败后的等待上限（不含抖动）
    pub fn ceiling(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &FlareError) -> bool {
        if attempt + 1 >= self.max_attempts {
            return false;
        }
        // 取消、端点格式等本地错误不重试
        error.is_retryable()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
