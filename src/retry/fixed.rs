use super::RetryPolicy;
use crate::error::FlareError;
use std::time::Duration;

/// 固定延迟重试策略
///
/// `max_attempts` 为 `usize::MAX` 时表示无限重试（用于刷新循环）
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// 无限次重试
    pub fn forever(delay: Duration) -> Self {
        Self::new(usize::MAX, delay)
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &FlareError) -> bool {
        if attempt.saturating_add(1) >= self.max_attempts {
            return false;
        }
        !error.is_cancelled()
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
