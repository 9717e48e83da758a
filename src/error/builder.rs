//! 错误构建器
//!
//! 提供链式 API 用于构建错误

use super::{ErrorCode, FlareError};

/// 错误构建器
pub struct ErrorBuilder {
    code: ErrorCode,
    reason: String,
    details: Vec<String>,
}

impl ErrorBuilder {
    /// 创建新的错误构建器
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: Vec::new(),
        }
    }

    /// 添加错误详情（多次调用按顺序拼接）
    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details.push(details.into());
        self
    }

    /// 添加键值参数，写入详情
    #[must_use]
    pub fn param(mut self, key: impl AsRef<str>, value: impl std::fmt::Display) -> Self {
        self.details.push(format!("{}={}", key.as_ref(), value));
        self
    }

    /// 构建 FlareError
    pub fn build_error(self) -> FlareError {
        FlareError::Localized {
            code: self.code,
            reason: self.reason,
            details: if self.details.is_empty() {
                None
            } else {
                Some(self.details.join("; "))
            },
        }
    }
}
