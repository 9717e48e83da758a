//! Flare 服务发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// Flare 统一错误类型
#[derive(Error, Debug, Clone)]
pub enum FlareError {
    /// 带错误代码的错误（可以暴露给调用方）
    #[error("错误 [{code}] {reason}", code = .code.as_str())]
    Localized {
        code: ErrorCode,
        reason: String,
        details: Option<String>,
    },

    /// 系统错误（用于内部错误，不暴露给用户）
    #[error("系统错误: {0}")]
    System(String),
}

impl FlareError {
    /// 创建带错误代码的错误
    pub fn localized(code: ErrorCode, reason: impl Into<String>) -> Self {
        FlareError::Localized {
            code,
            reason: reason.into(),
            details: None,
        }
    }

    /// 创建系统错误
    pub fn system(msg: impl Into<String>) -> Self {
        FlareError::System(msg.into())
    }

    // ============================================================
    // 便捷方法：后端相关错误
    // ============================================================

    /// 后端暂时不可用（可重试）
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ServiceUnavailable, reason)
    }

    /// 连接失败（可重试）
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConnectionFailed, reason)
    }

    /// 注册失败
    pub fn registration_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::RegistrationFailed, reason)
    }

    /// 租约丢失
    pub fn lease_lost(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::LeaseLost, reason)
    }

    // ============================================================
    // 便捷方法：服务发现相关错误
    // ============================================================

    /// 服务未找到
    pub fn service_not_found(service: impl AsRef<str>) -> Self {
        Self::localized(
            ErrorCode::ServiceNotFound,
            format!("service {} not resolved in registry", service.as_ref()),
        )
    }

    /// 创建 watcher 超时（Resolver 启动阶段）
    pub fn watcher_create_timeout() -> Self {
        Self::localized(
            ErrorCode::WatcherCreateTimeout,
            "discovery create watcher overtime",
        )
    }

    /// watcher 已关闭
    pub fn watcher_closed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::WatcherClosed, reason)
    }

    /// 端点格式错误（永久错误，不重试）
    pub fn invalid_endpoint(endpoint: impl AsRef<str>, reason: impl Into<String>) -> Self {
        FlareError::Localized {
            code: ErrorCode::InvalidEndpoint,
            reason: format!("invalid endpoint: {}", endpoint.as_ref()),
            details: Some(reason.into()),
        }
    }

    // ============================================================
    // 便捷方法：序列化相关错误
    // ============================================================

    /// 创建序列化错误
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::SerializationError, reason)
    }

    /// 创建反序列化错误
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::DeserializationError, reason)
    }

    // ============================================================
    // 便捷方法：通用错误
    // ============================================================

    /// 创建操作超时错误
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::OperationTimeout, reason)
    }

    /// 创建取消错误（干净的关闭信号，不需要重试）
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::OperationCancelled, reason)
    }

    /// 创建配置错误
    pub fn configuration_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConfigurationError, reason)
    }

    /// 附加错误详情
    #[must_use]
    pub fn with_details(self, details: impl Into<String>) -> Self {
        match self {
            FlareError::Localized { code, reason, .. } => FlareError::Localized {
                code,
                reason,
                details: Some(details.into()),
            },
            other => other,
        }
    }

    // ============================================================
    // 信息获取方法
    // ============================================================

    /// 获取错误代码
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            FlareError::Localized { code, .. } => Some(*code),
            FlareError::System(_) => None,
        }
    }

    /// 获取错误原因
    pub fn reason(&self) -> &str {
        match self {
            FlareError::Localized { reason, .. } => reason,
            FlareError::System(msg) => msg,
        }
    }

    /// 获取错误详情
    pub fn details(&self) -> Option<&str> {
        match self {
            FlareError::Localized { details, .. } => details.as_deref(),
            FlareError::System(_) => None,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().map(|code| code.is_retryable()).unwrap_or(false)
    }

    /// 判断是否为取消信号
    pub fn is_cancelled(&self) -> bool {
        self.code() == Some(ErrorCode::OperationCancelled)
    }

    /// 判断是否为超时
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.code(),
            Some(ErrorCode::OperationTimeout) | Some(ErrorCode::WatcherCreateTimeout)
        )
    }
}

impl From<serde_json::Error> for FlareError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            FlareError::deserialization_error(err.to_string())
        } else {
            FlareError::serialization_error(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for FlareError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        FlareError::timeout(err.to_string())
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for FlareError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::InvalidArgs(msg) => {
                Self::localized(ErrorCode::InvalidParameter, msg)
            }
            other => FlareError::backend_unavailable("etcd request failed")
                .with_details(other.to_string()),
        }
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for FlareError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FlareError::localized(ErrorCode::NetworkTimeout, "consul request timeout")
                .with_details(err.to_string())
        } else if err.is_decode() {
            FlareError::deserialization_error(err.to_string())
        } else {
            FlareError::backend_unavailable("consul request failed")
                .with_details(err.to_string())
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, FlareError>;
