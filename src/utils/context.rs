//! 组合取消上下文
//!
//! 基于 `CancellationToken` 加可选截止时间，支持从两个父上下文派生一个子上下文：
//! 任一父上下文结束、或本地取消时子上下文结束，截止时间取两者中较早的一个。

use std::future::Future;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FlareError;

/// 上下文结束原因
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for FlareError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => FlareError::cancelled(err.to_string()),
            ContextError::DeadlineExceeded => FlareError::timeout(err.to_string()),
        }
    }
}

/// 可取消、可设置截止时间的上下文
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// 根上下文：永不超时，只能显式取消
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// 派生可单独取消的子上下文
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// 派生带超时的子上下文，截止时间不会晚于父上下文
    pub fn with_timeout(&self, timeout: std::time::Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 派生带截止时间的子上下文
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: Some(earliest(self.deadline, Some(deadline)).unwrap_or(deadline)),
        }
    }

    /// 合并两个上下文
    ///
    /// 需要在 tokio runtime 中调用：若两个父上下文都未结束，会启动一个后台任务
    /// 监听二者，任务在子上下文结束时随之退出。
    pub fn merge(a: &Context, b: &Context) -> Self {
        let merged = Self {
            token: a.token.child_token(),
            deadline: earliest(a.deadline, b.deadline),
        };
        if b.token.is_cancelled() {
            merged.token.cancel();
        } else if !merged.token.is_cancelled() {
            let child = merged.token.clone();
            let other = b.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = other.cancelled() => child.cancel(),
                    _ = child.cancelled() => {}
                }
            });
        }
        merged
    }

    /// 取消当前上下文（以及由它派生的所有子上下文）
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 截止时间
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 底层取消令牌
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 上下文是否已结束
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// 结束原因；未结束返回 `None`
    pub fn err(&self) -> Option<ContextError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        None
    }

    /// 等待上下文结束，返回结束原因
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// 在上下文约束下执行 future；上下文先结束时丢弃 future 并返回结束原因
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(3));
        let res = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_never_later_than_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(30));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = Context::background();
        let child = parent.with_cancel();
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_merge_done_when_either_parent_done() {
        let a = Context::background();
        let b = Context::background();
        let merged = Context::merge(&a, &b);
        assert!(!merged.is_done());

        b.cancel();
        merged.done().await;
        assert_eq!(merged.err(), Some(ContextError::Canceled));
        assert!(!a.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_takes_earlier_deadline() {
        let a = Context::background().with_timeout(Duration::from_secs(5));
        let b = Context::background().with_timeout(Duration::from_secs(2));
        let merged = Context::merge(&a, &b);
        assert_eq!(merged.deadline(), b.deadline());

        let res = merged.run(tokio::time::sleep(Duration::from_secs(3))).await;
        assert_eq!(res, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_local_cancel_does_not_touch_parents() {
        let a = Context::background();
        let b = Context::background();
        let merged = Context::merge(&a, &b);
        merged.cancel();
        assert!(merged.is_done());
        assert!(!a.is_done());
        assert!(!b.is_done());
    }
}
