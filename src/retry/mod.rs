//! 重试策略模块

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;

use crate::error::FlareError;

/// 重试策略 trait
///
/// `attempt` 从 0 开始计数，表示已经失败的次数减一
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &FlareError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}
