//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 3000-3999: 协议相关错误（端点格式等）
/// - 6000-6999: 系统相关错误
/// - 7000-7999: 网络相关错误
/// - 8000-8999: 序列化相关错误
/// - 9000-9999: 通用错误
/// - 10000-10999: 服务发现相关错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionClosed = 1002,

    // ============================================================
    // 协议相关错误 (3000-3999)
    // ============================================================
    InvalidEndpoint = 3006,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    ServiceUnavailable = 6001,
    ConfigurationError = 6003,

    // ============================================================
    // 网络相关错误 (7000-7999)
    // ============================================================
    NetworkTimeout = 7001,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,
    DeserializationError = 8001,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    OperationTimeout = 9004,
    OperationCancelled = 9005,

    // ============================================================
    // 服务发现相关错误 (10000-10999)
    // ============================================================
    ServiceNotFound = 10000,
    RegistrationFailed = 10001,
    LeaseLost = 10002,
    WatcherCreateTimeout = 10003,
    WatcherClosed = 10004,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::InvalidEndpoint => "INVALID_ENDPOINT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::OperationCancelled => "OPERATION_CANCELLED",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::LeaseLost => "LEASE_LOST",
            ErrorCode::WatcherCreateTimeout => "WATCHER_CREATE_TIMEOUT",
            ErrorCode::WatcherClosed => "WATCHER_CLOSED",
        }
    }

    /// 获取错误代码的类别（用于错误分类）
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            3000..=3999 => ErrorCategory::Protocol,
            6000..=6999 => ErrorCategory::System,
            7000..=7999 => ErrorCategory::Network,
            8000..=8999 => ErrorCategory::Serialization,
            10000..=10999 => ErrorCategory::Discovery,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 瞬时后端故障可重试；端点格式、序列化等本地错误永远不重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionClosed
                | ErrorCode::NetworkTimeout
                | ErrorCode::ServiceUnavailable
                | ErrorCode::OperationTimeout
                | ErrorCode::LeaseLost
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Protocol,
    System,
    Network,
    Serialization,
    Discovery,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Protocol => write!(f, "PROTOCOL"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Network => write!(f, "NETWORK"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::Discovery => write!(f, "DISCOVERY"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
